//! The listener tails a meter's log for the length of a job.
//!
//! Every line is classified, written to the job log unless it is noise,
//! and handed to each interested monitor.
//! The monitors' actions go through the [`ActionProcessor`],
//! which is the only place the job's watchdogs are touched.

use std::{fmt::Display, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    actions::{Action, Fault, Severity},
    classifier::{self, LogEvent},
    error::{Error, Result},
    monitor::Monitor,
    shared::{DeviceResult, SharedState},
    transport::{LogStream, LogTransport},
    watchdog::{Deadline, Watchdog},
};

/// Applies actions to the job, unless the device they are from is not allowed.
///
/// Suppressed actions are logged and otherwise dropped.
/// In particular, a suppressed watch is never armed.
#[derive(Debug)]
pub struct ActionProcessor {
    shared: Arc<SharedState>,
    watchdog: Watchdog,
    host: String,
}

impl ActionProcessor {
    /// A processor for the job whose state is `shared`, on the meter at `host`.
    pub fn new(shared: Arc<SharedState>, host: &str) -> Self {
        Self {
            shared,
            watchdog: Watchdog::new(),
            host: host.to_owned(),
        }
    }

    /// The job's watchdogs.
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Apply an action produced by the monitor of `origin`.
    pub fn process(&mut self, origin: &str, action: Action) {
        let shared = &self.shared;

        if !shared.is_allowed(origin) {
            shared.log(format!("[SUPPRESS][{origin}] {action}"));
            return;
        }

        match action {
            Action::StartWatch(watch) => {
                shared.log(format!(
                    "[{origin}] watch start {} ({:.1}s)",
                    watch.key,
                    watch.timeout.as_secs_f64()
                ));
                self.watchdog
                    .start(Deadline::from_watch(&watch, Instant::now()));
            }
            Action::CancelWatch { key } => {
                shared.log(format!("[{origin}] watch cancel {key}"));
                self.watchdog.cancel(&key);
            }
            Action::MarkSuccess { device, message } => {
                shared.log(format!("[{device}] success: {message}"));
                shared.set_device_result(&device, DeviceResult::Pass);
                shared.success.set();
            }
            Action::MetaUpdate { device, data } => {
                debug!(%device, ?data, "Metadata");
                shared.merge_meta(data);
            }
            Action::ProgressUpdate {
                program,
                current_cycle,
                total_cycles,
                ip,
            } => {
                let ip = ip.unwrap_or_else(|| self.host.clone());
                shared.broadcast_progress(&ip, &program, current_cycle, total_cycles);
            }
        }
    }

    /// Apply everything queued from outside the listener, oldest first.
    pub fn drain_pending(&mut self) {
        for (origin, action) in self.shared.take_pending() {
            self.process(&origin, action);
        }
    }

    /// Turn expired watches into faults and apply them.
    ///
    /// The device under test is blamed if there is one,
    /// else the device the watch was armed for.
    /// Any critical fault stops the job.
    pub fn poll_watchdog(&mut self, now: Instant) -> Vec<Fault> {
        let faults = self.watchdog.poll_expired(now);

        for fault in &faults {
            self.shared.log(format!("[FAULT] {}: {}", fault.device, fault.message));

            let device = self
                .shared
                .current_device()
                .unwrap_or_else(|| fault.device.clone());
            self.shared.set_device_result(&device, DeviceResult::Fail);
        }

        if faults
            .iter()
            .any(|fault| fault.severity == Severity::Critical)
        {
            warn!(meter = %self.host, "Critical fault, stopping job");
            self.shared.stop.set();
        }

        faults
    }
}

/// Where a listener is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Opening the log stream.
    Connecting,

    /// Dispatching lines.
    Streaming,

    /// Winding down, the stream is being released.
    Draining,

    /// Done.
    Closed,
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ListenerState::Connecting => "connecting",
            ListenerState::Streaming => "streaming",
            ListenerState::Draining => "draining",
            ListenerState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// See the module level docs.
pub struct Listener {
    processor: ActionProcessor,
    monitors: Vec<Box<dyn Monitor>>,
    shared: Arc<SharedState>,
    host: String,
    user: String,
    save_logs: bool,
    poll_interval: Duration,
    state: ListenerState,
    connected: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("host", &self.host)
            .field(
                "monitors",
                &self.monitors.iter().map(|m| m.id()).collect::<Vec<_>>(),
            )
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// A listener for the meter at `host`, dispatching to `monitors`.
    pub fn new(
        shared: Arc<SharedState>,
        host: &str,
        user: &str,
        monitors: Vec<Box<dyn Monitor>>,
    ) -> Self {
        Self {
            processor: ActionProcessor::new(shared.clone(), host),
            monitors,
            shared,
            host: host.to_owned(),
            user: user.to_owned(),
            save_logs: true,
            poll_interval: Duration::from_millis(50),
            state: ListenerState::Connecting,
            connected: None,
        }
    }

    /// Be told once the log is open.
    /// The sender is dropped instead if it can't be opened.
    pub fn on_connected(mut self, tx: oneshot::Sender<()>) -> Self {
        self.connected = Some(tx);
        self
    }

    /// Whether lines go into the job log. On by default.
    pub fn save_logs(mut self, save: bool) -> Self {
        self.save_logs = save;
        self
    }

    /// How long to wait for a line before checking watchdogs and flags anyway.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn transition(&mut self, state: ListenerState) {
        debug!(from = %self.state, to = %state, "Listener");
        self.state = state;
    }

    /// Handle a single raw line.
    pub fn dispatch(&mut self, line: &str) {
        let Some(event) = classifier::classify(line) else {
            return;
        };

        if self.save_logs && !event.is_noise() {
            self.shared.log(event.human());
        }

        self.fan_out(&event);
    }

    fn fan_out(&mut self, event: &LogEvent) {
        for monitor in &mut self.monitors {
            if !monitor.interested(&event.message) {
                continue;
            }

            match monitor.handle(event) {
                Ok(actions) => {
                    let origin = monitor.id().to_owned();
                    for action in actions {
                        self.processor.process(&origin, action);
                    }
                }
                Err(e) => {
                    warn!(monitor = monitor.id(), %e, "Monitor failed, skipping event");
                    self.shared
                        .log(format!("[{}] handle() error: {e}", monitor.id()));
                }
            }
        }
    }

    /// Dispatch lines until told to stop.
    ///
    /// Losing the stream while the job still needs it stops the job.
    async fn stream(&mut self, mut lines: LogStream) -> Result<()> {
        self.transition(ListenerState::Streaming);
        let shared = self.shared.clone();
        let mut lost = None;

        loop {
            self.processor.drain_pending();

            if shared.stop.is_set() || shared.end_listener.is_set() {
                break;
            }

            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        // Actions queued meanwhile go first, a monitor may answer them.
                        self.processor.drain_pending();
                        self.dispatch(&line);
                    }
                    Some(Err(e)) => lost = Some(format!("Log stream failed: {e}")),
                    None => lost = Some("Log stream ended".to_owned()),
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shared.stop.wait() => {}
                _ = shared.end_listener.wait() => {}
            }

            self.processor.poll_watchdog(Instant::now());

            if lost.is_some() {
                break;
            }
        }

        self.transition(ListenerState::Draining);

        let dropped = shared.take_pending().len();
        if dropped > 0 {
            debug!(dropped, "Discarding actions queued after the end");
        }

        // Releases the stream, killing whatever produced it.
        drop(lines);
        for monitor in self.monitors.drain(..) {
            drop(monitor);
        }

        let result = match lost {
            Some(problem) if !shared.stop.is_set() && !shared.end_listener.is_set() => {
                warn!(host = %self.host, %problem, "Lost the log, stopping job");
                shared.log(format!("{problem}, stopping job"));
                shared.stop.set();
                Err(Error::Transport(format!("{}: {problem}", self.host)))
            }
            Some(problem) => {
                shared.log(problem);
                Ok(())
            }
            None => Ok(()),
        };

        shared.flush_logs();
        result
    }

    /// Open the log and run until the job stops or the listener is told to end.
    ///
    /// If the log can't be opened, or is lost while the job runs, the job is stopped and the error returned.
    pub async fn run(mut self, transport: &dyn LogTransport) -> Result<()> {
        self.transition(ListenerState::Connecting);

        let lines = match transport.open(&self.host, &self.user).await {
            Ok(lines) => lines,
            Err(e) => {
                self.shared.log(format!("Could not open log stream: {e}"));
                self.shared.stop.set();
                self.transition(ListenerState::Closed);
                return Err(e);
            }
        };
        self.shared.log(format!("Connected to {}", self.host));
        if let Some(tx) = self.connected.take() {
            // Nobody waiting is fine.
            let _ = tx.send(());
        }
        info!(host = %self.host, monitors = self.monitors.len(), "Listening");

        let streamed = self.stream(lines).await;

        self.transition(ListenerState::Closed);
        self.shared.log("End of listener loop");

        streamed
    }
}
