//! Test programs: the routines a job runs against a meter, and which monitors watch them.
//!
//! A routine drives the meter while the listener watches the log.
//! Routines don't decide pass or fail themselves,
//! they return once the work is done or the job is stopped.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    meter::Meter,
    monitor::{
        KeypadConfig, ModemConfig, MonitorSpec, NfcConfig, PrinterConfig, RobotKeypadConfig,
    },
    shared::{DeviceResult, SharedState},
};

/// Job arguments.
pub type Kwargs = serde_json::Map<String, Value>;

/// How a routine ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Ran to the end.
    Completed,

    /// Returned early because the job was stopped.
    Aborted,
}

/// Everything a routine gets to work with.
#[derive(Debug, Clone)]
pub struct ProgramContext {
    /// The meter under test.
    pub meter: Arc<dyn Meter>,

    /// The job's shared state.
    pub shared: Arc<SharedState>,

    /// The job's arguments.
    pub kwargs: Kwargs,

    /// Whether routines hold their minimum delays regardless of arguments.
    /// Meters need them, tests don't.
    pub min_delays: bool,

    /// How often waiting routines check the job's signals.
    pub poll_interval: Duration,
}

impl ProgramContext {
    /// A number from the arguments. Numeric strings are accepted.
    pub fn number(&self, key: &str) -> Result<Option<f64>> {
        let bad = || Error::Routine(format!("argument `{key}` must be a number"));

        match self.kwargs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(bad),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| bad()),
            Some(_) => Err(bad()),
        }
    }

    /// A count from the arguments.
    pub fn count(&self, key: &str, default: u32) -> Result<u32> {
        match self.number(key)? {
            None => Ok(default),
            Some(n) if n >= 0.0 && n <= f64::from(u32::MAX) => Ok(n as u32),
            Some(n) => Err(Error::Routine(format!(
                "argument `{key}` must be a count, got {n}"
            ))),
        }
    }

    /// A duration in seconds from the arguments.
    pub fn seconds(&self, key: &str, default: f64) -> Result<Duration> {
        let value = self.number(key)?.unwrap_or(default);

        Duration::try_from_secs_f64(value).map_err(|_| {
            Error::Routine(format!(
                "argument `{key}` must be a non-negative number of seconds, got {value}"
            ))
        })
    }

    /// Whether this is running as part of a larger program.
    /// Sub-tests don't report their own progress.
    pub fn subtest(&self) -> bool {
        self.kwargs
            .get("subtest")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn held(&self, delay: Duration, minimum: Duration) -> Duration {
        if self.min_delays {
            delay.max(minimum)
        } else {
            delay
        }
    }

    /// Sleep, unless the job is stopped first.
    pub async fn pause(&self, duration: Duration) -> Outcome {
        tokio::select! {
            _ = self.shared.stop.wait() => Outcome::Aborted,
            _ = tokio::time::sleep(duration) => {
                if self.shared.stop.is_set() {
                    Outcome::Aborted
                } else {
                    Outcome::Completed
                }
            }
        }
    }

    fn progress(&self, program: &str, current: u32, total: u32) {
        if !self.subtest() {
            self.shared
                .broadcast_progress(self.meter.host(), program, current, total);
        }
    }

    /// Sub-tests see the job's arguments, so delays can be tuned for the whole run.
    fn for_subtest(&self, count: u32) -> Self {
        let mut kwargs = self.kwargs.clone();
        kwargs.insert("count".into(), json!(count));
        kwargs.insert("subtest".into(), json!(true));

        Self {
            kwargs,
            ..self.clone()
        }
    }
}

/// A test routine.
#[async_trait]
pub trait Program: Send + Sync + Debug {
    /// Run against the context's meter.
    ///
    /// Errors are failures of the routine itself, e.g. the meter could not be reached.
    /// A stopped job is not an error, see [`Outcome::Aborted`].
    async fn run(&self, ctx: &ProgramContext) -> Result<Outcome>;
}

/// What ended a [`wait_for_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// A monitor reported success.
    Success,

    /// The job was stopped.
    Stopped,

    /// Neither happened in time.
    TimedOut,
}

/// Wait for the job to succeed or stop, checking every `poll` for at most `max`.
pub async fn wait_for_outcome(shared: &SharedState, poll: Duration, max: Duration) -> Wait {
    let deadline = Instant::now() + max;

    loop {
        if shared.stop.is_set() {
            return Wait::Stopped;
        }
        if shared.success.is_set() {
            return Wait::Success;
        }

        let now = Instant::now();
        if now >= deadline {
            return Wait::TimedOut;
        }

        tokio::select! {
            _ = shared.stop.wait() => {},
            _ = shared.success.wait() => {},
            _ = tokio::time::sleep(poll.min(deadline - now)) => {},
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Step {
    trigger: &'static str,
    delay_key: &'static str,
    default_delay_s: f64,
    min_delay_s: f64,
}

impl Step {
    const fn new(
        trigger: &'static str,
        delay_key: &'static str,
        default_delay_s: f64,
        min_delay_s: f64,
    ) -> Self {
        Self {
            trigger,
            delay_key,
            default_delay_s,
            min_delay_s,
        }
    }
}

/// Trigger a device `count` times, waiting after each step.
///
/// Arguments: `count`, and the per-step delays (`delay`, or `delay_on`/`delay_off` for the modem).
#[derive(Debug, Clone)]
pub struct Cycle {
    device: &'static str,
    default_count: u32,
    steps: Vec<Step>,
    settle: bool,
}

impl Cycle {
    /// Print tickets. A ticket takes up to 8 seconds.
    pub fn printer() -> Self {
        Self {
            device: "printer",
            default_count: 3,
            steps: vec![Step::new("printer", "delay", 8.0, 8.0)],
            settle: true,
        }
    }

    /// Pulse the coin shutter.
    pub fn coin_shutter() -> Self {
        Self {
            device: "coin shutter",
            default_count: 3,
            steps: vec![Step::new("coin shutter", "delay", 0.1, 0.0)],
            settle: false,
        }
    }

    /// Power the NFC reader on and off.
    pub fn nfc() -> Self {
        Self {
            device: "nfc",
            default_count: 3,
            steps: vec![
                Step::new("nfc on", "delay", 7.0, 7.0),
                Step::new("nfc off", "delay", 7.0, 7.0),
            ],
            settle: false,
        }
    }

    /// Read a card once.
    pub fn nfc_read() -> Self {
        Self {
            device: "nfc",
            default_count: 1,
            steps: vec![Step::new("nfc read", "delay", 7.0, 7.0)],
            settle: false,
        }
    }

    /// Connect and disconnect the modem.
    pub fn modem() -> Self {
        Self {
            device: "modem",
            default_count: 3,
            steps: vec![
                Step::new("modem on", "delay_on", 30.0, 30.0),
                Step::new("modem off", "delay_off", 25.0, 25.0),
            ],
            settle: false,
        }
    }

    /// Walk through the meter's screens.
    pub fn screen() -> Self {
        Self {
            device: "screen test",
            default_count: 1,
            steps: vec![Step::new("screen test", "delay", 5.0, 0.0)],
            settle: false,
        }
    }

    /// The cycle for a device of a multi-device run.
    pub fn for_device(device: &str) -> Option<Self> {
        Some(match device {
            "printer" => Self::printer(),
            "coin shutter" => Self::coin_shutter(),
            "nfc" => Self::nfc(),
            "modem" => Self::modem(),
            "screen test" => Self::screen(),
            _ => return None,
        })
    }
}

#[async_trait]
impl Program for Cycle {
    async fn run(&self, ctx: &ProgramContext) -> Result<Outcome> {
        let count = ctx.count("count", self.default_count)?;
        let delays = self
            .steps
            .iter()
            .map(|step| {
                let delay = ctx.seconds(step.delay_key, step.default_delay_s)?;
                Ok(ctx.held(delay, Duration::from_secs_f64(step.min_delay_s)))
            })
            .collect::<Result<Vec<_>>>()?;

        for i in 1..=count {
            ctx.shared
                .log(format!("{} {} {i}/{count}", ctx.meter.host(), self.device));
            ctx.progress(self.device, i, count);

            for (step, delay) in self.steps.iter().zip(&delays) {
                ctx.meter.trigger(step.trigger).await?;

                if ctx.pause(*delay).await == Outcome::Aborted {
                    return Ok(Outcome::Aborted);
                }
            }
        }

        // Give the last step time to show up in the log.
        if self.settle {
            if let Some(delay) = delays.last() {
                return Ok(ctx.pause(*delay).await);
            }
        }

        Ok(Outcome::Completed)
    }
}

/// Start a device's test on the meter, then wait for its monitor to report success.
///
/// If nothing happens within `max_duration_s` (default 300) the job is stopped.
#[derive(Debug, Clone)]
pub struct WaitForSuccess {
    device: &'static str,
}

impl WaitForSuccess {
    /// Waits on the given device's test.
    pub fn new(device: &'static str) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Program for WaitForSuccess {
    async fn run(&self, ctx: &ProgramContext) -> Result<Outcome> {
        let max = ctx.seconds("max_duration_s", 300.0)?;

        ctx.shared
            .log(format!("{} {} 1/1", ctx.meter.host(), self.device));
        ctx.progress(self.device, 1, 1);

        ctx.meter.trigger(self.device).await?;

        match wait_for_outcome(&ctx.shared, ctx.poll_interval, max).await {
            Wait::Success => Ok(Outcome::Completed),
            Wait::Stopped => Ok(Outcome::Aborted),
            Wait::TimedOut => {
                ctx.shared.log(format!(
                    "{} not done within {:.0}s",
                    self.device,
                    max.as_secs_f64()
                ));
                ctx.shared.stop.set();
                Ok(Outcome::Aborted)
            }
        }
    }
}

/// The devices of a full run, in order.
pub const ALL_DEVICES: [&str; 5] = ["coin shutter", "nfc", "modem", "printer", "screen test"];

// Devices with a monitor. Anything else runs with nothing allowed.
const MONITORED: [&str; 4] = ["printer", "coin shutter", "nfc", "modem"];

/// Burn-in: run every device's cycle, several times over.
///
/// Arguments: `numBurnCycles` (default 1), `numBurnDelay` seconds between them (default 10),
/// and a count per device keyed by device name (default 0, not tested).
#[derive(Debug, Clone, Default)]
pub struct CycleAll;

impl CycleAll {
    async fn run_device(&self, ctx: &ProgramContext, device: &str, count: u32) -> Result<Outcome> {
        let shared = &ctx.shared;

        if count == 0 {
            shared.set_device_result(device, DeviceResult::NotApplicable);
            return Ok(Outcome::Completed);
        }

        shared.set_current_device(Some(device));
        if MONITORED.contains(&device) {
            shared.set_allowed([device], &format!("Running {device} subtest"));
        } else {
            shared.set_allowed(
                Vec::<String>::new(),
                &format!("Running {device} (no monitors expected)"),
            );
        }

        let finish = |result: DeviceResult| {
            shared.set_device_result(device, result);
            shared.set_current_device(None);
            shared.set_allowed(Vec::<String>::new(), &format!("Finished {device} subtest"));
        };

        let Some(routine) = Cycle::for_device(device) else {
            finish(DeviceResult::NotApplicable);
            return Ok(Outcome::Completed);
        };

        if !ctx.meter.has_module(device) {
            finish(DeviceResult::Missing);
            return Ok(Outcome::Completed);
        }

        shared.set_device_result(device, DeviceResult::Running);

        let outcome = routine.run(&ctx.for_subtest(count)).await;

        // A warning fault has already failed the device without stopping the job.
        let failed = shared.device_result(device) == Some(DeviceResult::Fail);
        let result = match &outcome {
            Ok(Outcome::Completed) if !failed && !shared.stop.is_set() => DeviceResult::Pass,
            _ => DeviceResult::Fail,
        };
        finish(result);

        outcome
    }
}

#[async_trait]
impl Program for CycleAll {
    async fn run(&self, ctx: &ProgramContext) -> Result<Outcome> {
        let burn_cycles = ctx.count("numBurnCycles", 1)?;
        let burn_delay = ctx.seconds("numBurnDelay", 10.0)?;
        let settle = ctx.held(Duration::ZERO, Duration::from_millis(500));

        let counts = ALL_DEVICES
            .iter()
            .map(|device| ctx.count(device, 0))
            .collect::<Result<Vec<_>>>()?;

        ctx.shared
            .set_device_results(ALL_DEVICES, DeviceResult::Pending);

        for i in 1..=burn_cycles {
            ctx.shared
                .log(format!("{} cycle_all {i}/{burn_cycles}", ctx.meter.host()));
            ctx.shared
                .broadcast_progress(ctx.meter.host(), "burn-in", i, burn_cycles);

            for (device, count) in ALL_DEVICES.iter().zip(&counts) {
                // Devices not reached stay pending.
                if ctx.shared.stop.is_set() {
                    return Ok(Outcome::Aborted);
                }

                if self.run_device(ctx, device, *count).await? == Outcome::Aborted {
                    return Ok(Outcome::Aborted);
                }

                if ctx.pause(settle).await == Outcome::Aborted {
                    return Ok(Outcome::Aborted);
                }
            }

            if ctx.pause(burn_delay).await == Outcome::Aborted {
                return Ok(Outcome::Aborted);
            }
        }

        Ok(ctx.pause(settle).await)
    }
}

/// Does nothing but log its arguments.
#[derive(Debug, Clone, Default)]
pub struct Dummy;

#[async_trait]
impl Program for Dummy {
    async fn run(&self, ctx: &ProgramContext) -> Result<Outcome> {
        info!(kwargs = ?ctx.kwargs, "Dummy program");
        ctx.shared
            .log(format!("Dummy program, arguments: {}", Value::Object(ctx.kwargs.clone())));
        Ok(Outcome::Completed)
    }
}

/// Every program by its canonical name.
pub const PROGRAMS: [&str; 10] = [
    "cycle_print",
    "cycle_coin_shutter",
    "cycle_meter_ui",
    "cycle_nfc",
    "cycle_modem",
    "cycle_all",
    "test_keypad",
    "test_nfc_read",
    "test_robot_keypad",
    "dummy",
];

const ALIASES: [(&str, &str); 8] = [
    ("printer", "cycle_print"),
    ("coin shutter", "cycle_coin_shutter"),
    ("screen test", "cycle_meter_ui"),
    ("nfc", "cycle_nfc"),
    ("modem", "cycle_modem"),
    ("all tests", "cycle_all"),
    ("keypad", "test_keypad"),
    ("nfc_read", "test_nfc_read"),
];

/// The canonical name of a program or alias.
///
/// ```
/// use meter_eol::program::canonical;
///
/// assert_eq!(canonical("all tests"), Some("cycle_all"));
/// assert_eq!(canonical("cycle_all"), Some("cycle_all"));
/// assert_eq!(canonical("solitaire"), None);
/// ```
pub fn canonical(name: &str) -> Option<&'static str> {
    PROGRAMS
        .into_iter()
        .find(|program| *program == name)
        .or_else(|| {
            ALIASES
                .into_iter()
                .find(|(alias, _)| *alias == name)
                .map(|(_, program)| program)
        })
}

/// A program: its routine, what it tests and which monitors watch it.
#[derive(Debug, Clone)]
pub struct ProgramDef {
    /// The canonical name.
    pub name: &'static str,

    /// The device under test, if the program tests a single one.
    /// Its monitor is allowed from the start of the job.
    pub device: Option<&'static str>,

    /// The routine.
    pub routine: Arc<dyn Program>,

    /// The monitors to run unless overridden.
    pub monitors: Vec<MonitorSpec>,
}

fn nfc_monitor() -> NfcConfig {
    NfcConfig {
        timeout_on_s: 6.0,
        timeout_off_s: 3.0,
    }
}

fn modem_monitor() -> ModemConfig {
    ModemConfig {
        connect_timeout_s: 25.0,
        disconnect_timeout_s: 20.0,
    }
}

fn printer_monitor() -> PrinterConfig {
    PrinterConfig { timeout_s: 8.0 }
}

/// Look up a program by name or alias.
pub fn lookup(name: &str) -> Result<ProgramDef> {
    let canonical = canonical(name).ok_or_else(|| Error::UnknownProgram(name.to_owned()))?;

    let (device, routine, monitors): (_, Arc<dyn Program>, _) = match canonical {
        "cycle_print" => (
            Some("printer"),
            Arc::new(Cycle::printer()),
            vec![MonitorSpec::Printer(printer_monitor())],
        ),
        "cycle_coin_shutter" => (Some("coin shutter"), Arc::new(Cycle::coin_shutter()), vec![]),
        "cycle_meter_ui" => (Some("screen test"), Arc::new(Cycle::screen()), vec![]),
        "cycle_nfc" => (
            Some("nfc"),
            Arc::new(Cycle::nfc()),
            vec![MonitorSpec::Nfc(nfc_monitor())],
        ),
        "cycle_modem" => (
            Some("modem"),
            Arc::new(Cycle::modem()),
            vec![MonitorSpec::Modem(modem_monitor())],
        ),
        "cycle_all" => (
            None,
            Arc::new(CycleAll),
            vec![
                MonitorSpec::Nfc(nfc_monitor()),
                MonitorSpec::Modem(modem_monitor()),
                MonitorSpec::Printer(printer_monitor()),
            ],
        ),
        "test_keypad" => (
            Some("keypad"),
            Arc::new(WaitForSuccess::new("keypad")),
            vec![MonitorSpec::Keypad(KeypadConfig::default())],
        ),
        "test_nfc_read" => (
            Some("nfc"),
            Arc::new(Cycle::nfc_read()),
            vec![MonitorSpec::NfcRead(nfc_monitor())],
        ),
        "test_robot_keypad" => (
            Some("robot_keypad"),
            Arc::new(WaitForSuccess::new("robot_keypad")),
            vec![MonitorSpec::RobotKeypad(RobotKeypadConfig::default())],
        ),
        _ => (None, Arc::new(Dummy), vec![]),
    };

    Ok(ProgramDef {
        name: canonical,
        device,
        routine,
        monitors,
    })
}

/// Where a job's monitors came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSource {
    /// The job's `monitors` argument.
    Arguments,

    /// The configuration's program overrides.
    Config,

    /// The program table.
    Program,
}

/// The monitors for a job.
///
/// A `monitors` argument wins, even when empty, and is removed from the arguments.
/// Then come configured overrides, then the program's own.
pub fn resolve_monitors(
    program: &ProgramDef,
    kwargs: &mut Kwargs,
    overrides: &BTreeMap<String, Vec<MonitorSpec>>,
) -> Result<(Vec<MonitorSpec>, MonitorSource)> {
    if let Some(list) = kwargs.remove("monitors") {
        return Ok((MonitorSpec::list_from_json(list)?, MonitorSource::Arguments));
    }

    if let Some(specs) = overrides.get(program.name) {
        debug!(program = program.name, "Configured monitors");
        return Ok((specs.clone(), MonitorSource::Config));
    }

    Ok((program.monitors.clone(), MonitorSource::Program))
}
