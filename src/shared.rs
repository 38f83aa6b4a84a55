//! State shared between a job's routine, its listener and any monitor background tasks.
//!
//! There is one [`SharedState`] per meter.
//! It is created on the meter's first job and [`SharedState::reset`] at the start of every job.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt::Display,
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

use crate::{
    actions::{Action, DeviceId},
    events::{Events, Topic},
};

/// A one-shot signal.
/// Clear by default, set once and visible to every task,
/// only cleared again when the job state is reset.
#[derive(Debug, Default)]
pub struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    /// Raise the flag. Setting an already set flag does nothing.
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the flag has been raised.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the flag is raised.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a concurrent `set` isn't missed.
            let notified = self.notify.notified();

            if self.is_set() {
                return;
            }

            notified.await;
        }
    }

    fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }
}

/// The state of a device within a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceResult {
    /// Not yet tested.
    #[serde(rename = "pending")]
    Pending,

    /// Under test.
    #[serde(rename = "running")]
    Running,

    /// Passed.
    #[serde(rename = "pass")]
    Pass,

    /// Failed.
    #[serde(rename = "fail")]
    Fail,

    /// The meter does not have the device.
    #[serde(rename = "missing")]
    Missing,

    /// Not asked for.
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl Display for DeviceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceResult::Pending => "pending",
            DeviceResult::Running => "running",
            DeviceResult::Pass => "pass",
            DeviceResult::Fail => "fail",
            DeviceResult::Missing => "missing",
            DeviceResult::NotApplicable => "n/a",
        };
        write!(f, "{s}")
    }
}

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Never ran, or reset.
    #[default]
    Idle,

    /// Running.
    Running,

    /// The routine returned.
    Finished,

    /// The routine failed.
    Error,

    /// A user stopped it.
    Cancelled,
}

/// How a job went.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    /// No critical fault and no stop.
    Pass,

    /// Anything else.
    Fail,
}

impl Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobResult::Pass => write!(f, "pass"),
            JobResult::Fail => write!(f, "fail"),
        }
    }
}

/// The job fields of a meter, see [`SharedState::job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFields {
    /// See [`JobStatus`].
    pub status: JobStatus,

    /// `None` until the job is done.
    pub result: Option<JobResult>,

    /// The routine's error, if it failed.
    pub last_error: Option<String>,

    /// The program running or last run.
    pub current_program: Option<String>,
}

/// When the job log is written to disk.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush once this many lines are waiting.
    pub lines: usize,

    /// Flush if the last flush is at least this old.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            lines: 64,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct JobLog {
    lines: Vec<String>,
    unflushed: Vec<String>,
    last_flush: Instant,
    path: Option<PathBuf>,
    policy: FlushPolicy,
}

impl JobLog {
    fn new(policy: FlushPolicy) -> Self {
        Self {
            lines: vec![],
            unflushed: vec![],
            last_flush: Instant::now(),
            path: None,
            policy,
        }
    }

    fn should_flush(&self) -> bool {
        self.unflushed.len() >= self.policy.lines
            || self.last_flush.elapsed() >= self.policy.interval
    }

    fn flush(&mut self) {
        self.last_flush = Instant::now();

        let lines = std::mem::take(&mut self.unflushed);
        let Some(path) = &self.path else {
            return;
        };
        if lines.is_empty() {
            return;
        }

        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            for line in &lines {
                writeln!(file, "{line}")?;
            }
            Ok(())
        };

        if let Err(e) = write() {
            warn!(?path, ?e, "Could not flush job log");
        }
    }
}

#[derive(Debug, Default)]
struct Coordination {
    job: JobFields,
    current_device: Option<DeviceId>,
    device_results: BTreeMap<DeviceId, DeviceResult>,
    device_meta: serde_json::Map<String, serde_json::Value>,
    allowed_monitors: HashSet<DeviceId>,
    extras: serde_json::Map<String, serde_json::Value>,
    pending_actions: VecDeque<(DeviceId, Action)>,
}

/// See the module level docs.
#[derive(Debug)]
pub struct SharedState {
    meter: String,

    /// Set to end the job early. Critical faults set this.
    pub stop: Flag,

    /// Set to tell the listener to wind down.
    pub end_listener: Flag,

    /// Set once a monitor reports success.
    pub success: Flag,

    state: Mutex<Coordination>,

    // Separate, so that logging never waits behind state updates.
    log: Mutex<JobLog>,

    events: Events,
}

impl SharedState {
    /// New state for the given meter, broadcasting progress on `events`.
    pub fn new(meter: &str, events: Events, policy: FlushPolicy) -> Self {
        Self {
            meter: meter.to_owned(),
            stop: Flag::default(),
            end_listener: Flag::default(),
            success: Flag::default(),
            state: Mutex::new(Coordination::default()),
            log: Mutex::new(JobLog::new(policy)),
            events,
        }
    }

    /// The meter this state belongs to.
    pub fn meter(&self) -> &str {
        &self.meter
    }

    /// The observer sink.
    pub fn events(&self) -> &Events {
        &self.events
    }

    fn state(&self) -> MutexGuard<'_, Coordination> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_log(&self) -> MutexGuard<'_, JobLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get ready for a new job.
    /// Clears all signals, per-device state, queued actions and the log buffer.
    /// The log file is kept, see [`SharedState::set_logfile`].
    pub fn reset(&self) {
        self.stop.clear();
        self.end_listener.clear();
        self.success.clear();

        *self.state() = Coordination::default();

        let mut log = self.job_log();
        log.lines.clear();
        log.unflushed.clear();
        log.last_flush = Instant::now();
    }

    /// A snapshot of the job fields.
    pub fn job(&self) -> JobFields {
        self.state().job.clone()
    }

    /// Update the job fields under the state lock.
    pub fn update_job<R>(&self, f: impl FnOnce(&mut JobFields) -> R) -> R {
        f(&mut self.state().job)
    }

    /// Replace the set of devices whose monitors' actions take effect.
    pub fn set_allowed<I, S>(&self, devices: I, reason: &str)
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        let devices = devices.into_iter().map(Into::into).collect::<HashSet<_>>();
        debug!(meter = %self.meter, ?devices, reason, "Allowed monitors");
        self.state().allowed_monitors = devices;
    }

    /// Whether actions from this device's monitor take effect.
    pub fn is_allowed(&self, device: &str) -> bool {
        self.state().allowed_monitors.contains(device)
    }

    /// The device under test, if any.
    pub fn current_device(&self) -> Option<DeviceId> {
        self.state().current_device.clone()
    }

    /// See [`SharedState::current_device`].
    pub fn set_current_device(&self, device: Option<&str>) {
        self.state().current_device = device.map(ToOwned::to_owned);
    }

    /// Record a device's result.
    pub fn set_device_result(&self, device: &str, result: DeviceResult) {
        self.state().device_results.insert(device.to_owned(), result);
    }

    /// Record results for several devices at once.
    pub fn set_device_results<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a str>,
        result: DeviceResult,
    ) {
        let mut state = self.state();
        for device in devices {
            state.device_results.insert(device.to_owned(), result);
        }
    }

    /// A device's result, if recorded.
    pub fn device_result(&self, device: &str) -> Option<DeviceResult> {
        self.state().device_results.get(device).copied()
    }

    /// All recorded results.
    pub fn device_results(&self) -> BTreeMap<DeviceId, DeviceResult> {
        self.state().device_results.clone()
    }

    /// Merge entries into the job's metadata.
    pub fn merge_meta(&self, data: serde_json::Map<String, serde_json::Value>) {
        self.state().device_meta.extend(data);
    }

    /// The job's metadata.
    pub fn device_meta(&self) -> serde_json::Map<String, serde_json::Value> {
        self.state().device_meta.clone()
    }

    /// Keep some run metadata around, e.g. the job's arguments.
    pub fn set_extra(&self, key: &str, value: serde_json::Value) {
        self.state().extras.insert(key.to_owned(), value);
    }

    /// See [`SharedState::set_extra`].
    pub fn extras(&self) -> serde_json::Map<String, serde_json::Value> {
        self.state().extras.clone()
    }

    /// Hand an action to the listener from outside its loop.
    /// `origin` is the device whose monitor produced it, used for the allow-list.
    pub fn queue_action(&self, origin: &str, action: Action) {
        self.state()
            .pending_actions
            .push_back((origin.to_owned(), action));
    }

    /// Take every queued action, oldest first.
    pub fn take_pending(&self) -> Vec<(DeviceId, Action)> {
        std::mem::take(&mut self.state().pending_actions).into()
    }

    /// Append a line to the job log.
    pub fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!(meter = %self.meter, "{line}");

        let stamped = format!("{} {line}", chrono::Local::now().format("%H:%M:%S%.3f"));

        let mut log = self.job_log();
        log.lines.push(stamped.clone());
        log.unflushed.push(stamped);

        if log.should_flush() {
            log.flush();
        }
    }

    /// Write anything not yet written to the log file.
    pub fn flush_logs(&self) {
        self.job_log().flush();
    }

    /// Where to write the log. `None` keeps it in memory only.
    pub fn set_logfile(&self, path: Option<PathBuf>) {
        let mut log = self.job_log();
        log.flush();
        log.path = path;
    }

    /// The log file in use, if any.
    pub fn logfile(&self) -> Option<PathBuf> {
        self.job_log().path.clone()
    }

    /// Every line logged this job.
    pub fn logs(&self) -> Vec<String> {
        self.job_log().lines.clone()
    }

    /// The job log as one text.
    pub fn log_text(&self) -> String {
        self.job_log().lines.join("\n")
    }

    /// Tell progress observers how far along a program is.
    pub fn broadcast_progress(&self, ip: &str, program: &str, current_cycle: u32, total_cycles: u32) {
        self.events.broadcast(
            Topic::Progress,
            json!({
                "ip": ip,
                "program": program,
                "current_cycle": current_cycle,
                "total_cycles": total_cycles,
            }),
        );
    }
}
