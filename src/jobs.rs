//! Jobs: one supervised test run on one meter at a time.
//!
//! The [`JobRegistry`] owns everything jobs need, and a slot per meter.
//! Starting a job spawns a task which runs the listener and the program's routine side by side,
//! then reconciles the results once the routine returns.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::{Error, Result},
    events::{Events, Topic},
    listener::Listener,
    meter::{device_module, Meter, SshMeter},
    monitor::{self, MonitorContext},
    program::{self, Kwargs, MonitorSource, Outcome, ProgramContext, ProgramDef},
    robot::RobotEvents,
    shared::{DeviceResult, JobResult, JobStatus, SharedState},
    store::{DirectoryStore, JobRecord, JobStore, MemoryStore},
    transport::LogTransport,
};

/// Whether a meter can take a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeterStatus {
    /// Idle.
    Ready,

    /// A job is running.
    Busy,
}

impl Display for MeterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeterStatus::Ready => write!(f, "ready"),
            MeterStatus::Busy => write!(f, "busy"),
        }
    }
}

/// A point in time view of a meter's job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusReport {
    /// Which meter.
    pub meter_id: String,

    /// See [`JobStatus`].
    pub status: JobStatus,

    /// `None` while running.
    pub result: Option<JobResult>,

    /// What went wrong, if the routine failed.
    pub last_error: Option<String>,

    /// The program running or last run.
    pub current_program: Option<String>,
}

impl JobStatusReport {
    /// An example report.
    pub fn example() -> Self {
        Self {
            meter_id: "192.168.137.32".into(),
            status: JobStatus::Finished,
            result: Some(JobResult::Pass),
            last_error: None,
            current_program: Some("cycle_print".into()),
        }
    }
}

#[derive(Debug)]
struct JobSlot {
    meter: Arc<dyn Meter>,
    shared: Arc<SharedState>,
    status: watch::Sender<MeterStatus>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    events: Events,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn LogTransport>,
    robot: Option<Arc<dyn RobotEvents>>,
    meters: Mutex<HashMap<String, Arc<dyn Meter>>>,
    slots: Mutex<HashMap<String, Arc<JobSlot>>>,
}

/// See the module level docs.
///
/// Cheap to clone, clones share the same meters and jobs.
#[derive(Debug, Clone)]
pub struct JobRegistry(Arc<Inner>);

impl JobRegistry {
    /// A registry without meters, see [`JobRegistry::add_meter`].
    pub fn new(
        config: Config,
        events: Events,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn LogTransport>,
        robot: Option<Arc<dyn RobotEvents>>,
    ) -> Self {
        Self(Arc::new(Inner {
            config,
            events,
            store,
            transport,
            robot,
            meters: Mutex::default(),
            slots: Mutex::default(),
        }))
    }

    /// A registry for the configured meters, controlled over ssh.
    pub fn from_config(config: Config, events: Events) -> Self {
        let store: Arc<dyn JobStore> = match &config.store_dir {
            Some(dir) => Arc::new(DirectoryStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };
        let transport = Arc::new(config.transport.clone());
        let meters = config.meters.clone();

        let registry = Self::new(config, events, store, transport, None);
        for meter in meters {
            registry.add_meter(Arc::new(SshMeter::new(meter)));
        }

        registry
    }

    /// Make a meter available for jobs.
    pub fn add_meter(&self, meter: Arc<dyn Meter>) {
        debug!(meter = meter.id(), "Adding meter");
        self.0
            .meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meter.id().to_owned(), meter);
    }

    /// The meter with the given id.
    pub fn meter(&self, meter_id: &str) -> Result<Arc<dyn Meter>> {
        self.0
            .meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(meter_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchMeter(meter_id.to_owned()))
    }

    /// The observer sink.
    pub fn events(&self) -> &Events {
        &self.0.events
    }

    fn existing_slot(&self, meter_id: &str) -> Option<Arc<JobSlot>> {
        self.0
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(meter_id)
            .cloned()
    }

    fn slot(&self, meter: &Arc<dyn Meter>) -> Arc<JobSlot> {
        self.0
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(meter.id().to_owned())
            .or_insert_with(|| {
                Arc::new(JobSlot {
                    meter: meter.clone(),
                    shared: Arc::new(SharedState::new(
                        meter.id(),
                        self.0.events.clone(),
                        self.0.config.flush_policy(),
                    )),
                    status: watch::Sender::new(MeterStatus::Ready),
                })
            })
            .clone()
    }

    fn broadcast_status(&self, meter_id: &str, status: MeterStatus, msg: &str) {
        self.0.events.broadcast(
            Topic::Status,
            json!({"ip": meter_id, "status": status, "msg": msg}),
        );
    }

    /// The job state of a meter, if it ever had a job.
    pub fn shared(&self, meter_id: &str) -> Option<Arc<SharedState>> {
        self.existing_slot(meter_id).map(|slot| slot.shared.clone())
    }

    /// Whether the meter can take a job.
    pub fn meter_status(&self, meter_id: &str) -> MeterStatus {
        self.existing_slot(meter_id)
            .map(|slot| *slot.status.borrow())
            .unwrap_or(MeterStatus::Ready)
    }

    /// Start a program on a meter.
    ///
    /// Rejected if the meter is busy, unknown or the program doesn't exist.
    /// Otherwise the job runs in the background, see [`JobRegistry::wait`].
    pub fn start_job(&self, meter_id: &str, program_name: &str, kwargs: Kwargs) -> (bool, String) {
        let meter = match self.meter(meter_id) {
            Ok(meter) => meter,
            Err(e) => return (false, e.to_string()),
        };

        let Ok(program) = program::lookup(program_name) else {
            return (false, format!("unknown program `{program_name}`"));
        };

        let slot = self.slot(&meter);

        let shared = slot.shared.clone();

        // Stops only see a busy meter once its job is running, so none are lost to the reset.
        let accepted = slot.status.send_if_modified(|status| {
            if *status != MeterStatus::Ready {
                return false;
            }

            shared.reset();
            shared.update_job(|job| {
                job.status = JobStatus::Running;
                job.current_program = Some(program_name.to_owned());
            });
            *status = MeterStatus::Busy;
            true
        });
        if !accepted {
            return (false, "job already running".into());
        }

        let logfile = self.0.config.save_logs.then(|| {
            let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
            self.0
                .config
                .log_dir
                .join(format!("[{}]{ts}-{program_name}.log", meter.hostname()))
        });
        shared.set_logfile(logfile);

        shared.log(format!(
            "STARTING JOB: {program_name} on {}",
            meter.hostname()
        ));
        shared.log(format!("Arguments: {}", serde_json::Value::Object(kwargs.clone())));

        self.broadcast_status(meter_id, MeterStatus::Busy, "");

        match program.device {
            Some(device) => {
                shared.set_current_device(Some(device));
                shared.set_device_result(device, DeviceResult::Running);
                shared.set_allowed([device], &format!("Start job {program_name}"));
            }
            None => shared.set_allowed(
                Vec::<String>::new(),
                &format!("Start job {program_name} (no monitors expected)"),
            ),
        }

        info!(meter = meter_id, program = program_name, "Starting job");

        let registry = self.clone();
        let span = info_span!("job", meter = meter_id, program = program_name);
        tokio::spawn(
            async move {
                registry.run_job(slot, program, kwargs).await;
            }
            .instrument(span),
        );

        (true, "started".into())
    }

    async fn run_routine(
        &self,
        slot: &JobSlot,
        program: &ProgramDef,
        kwargs: &mut Kwargs,
    ) -> Result<Outcome> {
        let config = &self.0.config;
        let shared = &slot.shared;
        let meter = &slot.meter;

        let (specs, source) = program::resolve_monitors(program, kwargs, &config.programs)?;
        if source == MonitorSource::Arguments {
            shared.log(format!(
                "Using override monitors for {}: {:?}",
                program.name,
                specs.iter().map(|spec| spec.kind()).collect::<Vec<_>>()
            ));
        }

        let context = MonitorContext {
            meter: meter.info(),
            shared: shared.clone(),
            robot: self.0.robot.clone(),
        };
        let monitors = specs
            .iter()
            .map(|spec| monitor::build(spec, &context))
            .collect::<Result<Vec<_>>>()?;

        let (connected_tx, connected_rx) = oneshot::channel();
        let listener = Listener::new(shared.clone(), meter.host(), meter.user(), monitors)
            .save_logs(config.save_logs)
            .poll_interval(config.poll_interval())
            .on_connected(connected_tx);

        let transport = self.0.transport.clone();
        let listener_task = tokio::spawn(
            async move { listener.run(transport.as_ref()).await }.instrument(info_span!("listener")),
        );
        let abort_listener = listener_task.abort_handle();

        // Dropped without a word if the log could not be opened, and the job is stopped then.
        let _ = connected_rx.await;

        let ctx = ProgramContext {
            meter: meter.clone(),
            shared: shared.clone(),
            kwargs: kwargs.clone(),
            min_delays: config.min_delays,
            poll_interval: config.poll_interval(),
        };
        let outcome = if shared.stop.is_set() {
            Ok(Outcome::Aborted)
        } else {
            let routine = program.routine.clone();
            let routine_task = tokio::spawn(
                async move { routine.run(&ctx).await }.instrument(info_span!("routine")),
            );

            match routine_task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%e, "Routine task failed");
                    shared.log(format!("Routine crashed: {e}"));
                    Err(Error::Routine(e.to_string()))
                }
            }
        };

        shared.end_listener.set();
        let listened =
            match tokio::time::timeout(config.listener_join_timeout(), listener_task).await {
                Ok(Ok(listened)) => listened,
                Ok(Err(e)) => {
                    warn!(%e, "Listener task failed");
                    Ok(())
                }
                Err(_) => {
                    warn!("Listener did not stop in time, aborting it");
                    abort_listener.abort();
                    Ok(())
                }
            };

        // A routine error says more than the listener's.
        let outcome = outcome?;
        listened?;

        Ok(outcome)
    }

    async fn run_job(&self, slot: Arc<JobSlot>, program: ProgramDef, mut kwargs: Kwargs) {
        let shared = slot.shared.clone();
        let meter = slot.meter.clone();
        let meter_id = meter.id().to_owned();

        let outcome = self.run_routine(&slot, &program, &mut kwargs).await;

        let stopped = shared.stop.is_set();
        let result = match &outcome {
            Ok(_) if !stopped => JobResult::Pass,
            _ => JobResult::Fail,
        };

        shared.update_job(|job| {
            job.result = Some(result);
            match &outcome {
                // The user's word is final.
                _ if job.status == JobStatus::Cancelled => {}
                Ok(_) => {
                    job.status = JobStatus::Finished;
                    job.last_error = None;
                }
                Err(e) => {
                    job.status = JobStatus::Error;
                    job.last_error = Some(e.to_string());
                }
            }
        });

        match &outcome {
            Ok(outcome) => {
                debug!(?outcome, "Routine returned");
                shared.log(format!("JOB FINISHED: {}", result.to_string().to_uppercase()));
            }
            Err(e) => {
                warn!(%e, "Job failed");
                shared.log(format!("JOB CRASHED: {e}"));
            }
        }
        shared.flush_logs();

        if let Some(device) = program.device {
            if matches!(
                shared.device_result(device),
                None | Some(DeviceResult::Running)
            ) {
                let device_result = match result {
                    JobResult::Pass => DeviceResult::Pass,
                    JobResult::Fail => DeviceResult::Fail,
                };
                shared.set_device_result(device, device_result);
            }
        }
        shared.set_current_device(None);

        self.0.events.broadcast(
            Topic::Devices,
            json!({"ip": meter_id, "results": shared.device_results()}),
        );

        shared.set_extra("kwargs", serde_json::Value::Object(kwargs));
        self.job_done(&slot, result).await;

        if let Err(e) = meter.beep(3).await {
            warn!(%e, "Could not beep");
        }

        slot.status.send_replace(MeterStatus::Ready);
        self.broadcast_status(&meter_id, MeterStatus::Ready, "");
        info!(%result, "Job done");
    }

    async fn job_done(&self, slot: &JobSlot, result: JobResult) {
        let shared = &slot.shared;
        let meter = &slot.meter;
        let job = shared.job();
        let results = shared.device_results();

        let overall = if results.values().any(|r| *r == DeviceResult::Fail) {
            JobResult::Fail
        } else {
            result
        };

        let info = meter.info();
        let device_results = results
            .iter()
            .map(|(device, status)| {
                let fw = device_module(device)
                    .flatten()
                    .and_then(|module| info.firmware(module));
                (device.clone(), json!({"status": status, "fw": fw}))
            })
            .collect::<BTreeMap<_, _>>();

        let meta = shared.device_meta();
        let extras = shared.extras();
        let program = job.current_program.clone().unwrap_or_default();

        shared.log("=== JOB SUMMARY ===");
        shared.log(format!(
            "Overall Result: {}",
            overall.to_string().to_uppercase()
        ));
        shared.log(format!("Program: {program}"));
        shared.log(format!("Device Results: {}", json!(results)));
        shared.log(format!("Device Metadata: {}", serde_json::Value::Object(meta.clone())));
        shared.log(format!("Extras: {}", serde_json::Value::Object(extras.clone())));
        shared.log(format!(
            "Last Error: {}",
            job.last_error.as_deref().unwrap_or("none")
        ));
        shared.log("=== END OF JOB ===");
        shared.flush_logs();

        let record = JobRecord {
            name: program,
            status: overall,
            data: json!({
                "kwargs": extras.get("kwargs").cloned().unwrap_or_default(),
                "results": device_results,
                "device_meta": meta,
                "last_error": job.last_error,
            }),
        };

        self.0.events.broadcast(
            Topic::Job,
            json!({"ip": meter.id(), "job": &record}),
        );

        let Some(db_id) = meter.db_id() else {
            debug!("Meter has no database id, job not stored");
            return;
        };

        if let Err(e) = self.0.store.insert(db_id, record, shared.log_text()).await {
            warn!(%e, "Could not store job");
            shared.log(format!("Could not store job: {e}"));
        }
    }

    /// Stop a meter's job.
    ///
    /// Stopping twice, or stopping an idle meter, is fine.
    /// Returns false only for unknown meters.
    pub async fn stop_job(&self, meter_id: &str) -> bool {
        let Ok(meter) = self.meter(meter_id) else {
            return false;
        };

        let slot = self.slot(&meter);
        let shared = &slot.shared;

        if *slot.status.borrow() == MeterStatus::Ready {
            self.broadcast_status(
                meter_id,
                MeterStatus::Ready,
                "tried stopping a non busy meter",
            );
            return true;
        }

        let cancelled = shared.update_job(|job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Cancelled;
                true
            } else {
                false
            }
        });

        shared.stop.set();

        if cancelled {
            info!(meter = meter_id, "Job cancelled");
            shared.log("JOB CANCELLED BY USER");
            shared.flush_logs();

            if let Err(e) = meter.beep(3).await {
                warn!(%e, "Could not beep");
            }
        }

        true
    }

    /// The job state of a meter.
    /// Meters which never had a job are idle.
    pub fn job_status(&self, meter_id: &str) -> JobStatusReport {
        let job = self
            .existing_slot(meter_id)
            .map(|slot| slot.shared.job())
            .unwrap_or_default();

        JobStatusReport {
            meter_id: meter_id.to_owned(),
            status: job.status,
            result: job.result,
            last_error: job.last_error,
            current_program: job.current_program,
        }
    }

    /// Wait until the meter is ready for a job.
    pub async fn wait(&self, meter_id: &str) {
        let Some(slot) = self.existing_slot(meter_id) else {
            return;
        };

        let mut status = slot.status.subscribe();
        // The sender lives in the slot, which we hold.
        let _ = status.wait_for(|status| *status == MeterStatus::Ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{meter::MeterInfo, mock::{MockMeter, MockTransport}};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry() -> (JobRegistry, Arc<MockMeter>) {
        let config = Config {
            save_logs: false,
            min_delays: false,
            poll_interval_ms: 5,
            ..Default::default()
        };

        let registry = JobRegistry::new(
            config,
            Events::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MockTransport::new()),
            None,
        );
        let meter = Arc::new(MockMeter::new("10.0.0.1", MeterInfo::default()));
        registry.add_meter(meter.clone());

        (registry, meter)
    }

    #[tokio::test]
    async fn unknown_things_are_rejected() {
        let (registry, _) = registry();

        let (accepted, message) = registry.start_job("10.9.9.9", "dummy", Kwargs::new());
        assert!(!accepted);
        assert!(message.contains("10.9.9.9"));

        let (accepted, message) = registry.start_job("10.0.0.1", "solitaire", Kwargs::new());
        assert!(!accepted);
        assert!(message.starts_with("unknown program"));

        assert!(!registry.stop_job("10.9.9.9").await);
    }

    #[tokio::test]
    async fn idle_meter() {
        let (registry, _) = registry();

        let status = registry.job_status("10.0.0.1");
        assert_eq!(status.status, JobStatus::Idle);
        assert_eq!(status.result, None);

        assert!(registry.stop_job("10.0.0.1").await);
        assert_eq!(registry.meter_status("10.0.0.1"), MeterStatus::Ready);
    }

    #[tokio::test]
    async fn stop_right_after_start_is_kept() {
        let (registry, meter) = registry();

        let (accepted, _) = registry.start_job("10.0.0.1", "cycle_print", Kwargs::new());
        assert!(accepted);
        assert_eq!(registry.job_status("10.0.0.1").status, JobStatus::Running);

        assert!(registry.stop_job("10.0.0.1").await);
        assert!(registry.shared("10.0.0.1").unwrap().stop.is_set());

        tokio::time::timeout(Duration::from_secs(5), registry.wait("10.0.0.1"))
            .await
            .unwrap();

        let status = registry.job_status("10.0.0.1");
        assert_eq!(status.status, JobStatus::Cancelled);
        assert_eq!(status.result, Some(JobResult::Fail));
        assert!(meter.triggers().is_empty());
    }

    #[tokio::test]
    async fn dummy_job() {
        let (registry, meter) = registry();

        let (accepted, message) = registry.start_job("10.0.0.1", "dummy", Kwargs::new());
        assert!(accepted, "{message}");

        tokio::time::timeout(Duration::from_secs(5), registry.wait("10.0.0.1"))
            .await
            .unwrap();

        let status = registry.job_status("10.0.0.1");
        assert_eq!(status.status, JobStatus::Finished);
        assert_eq!(status.result, Some(JobResult::Pass));
        assert_eq!(status.current_program.as_deref(), Some("dummy"));
        assert_eq!(meter.beeps(), vec![3]);
    }
}
