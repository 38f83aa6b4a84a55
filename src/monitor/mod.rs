//! Monitors turn classified log events into [`Action`]s.
//!
//! There is one monitor per kind of device.
//! A monitor is built fresh for every job and dropped when the job ends.

use std::{fmt::Display, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    actions::Action,
    classifier::LogEvent,
    error::{Error, Result},
    meter::MeterInfo,
    robot::RobotEvents,
    shared::SharedState,
};

pub mod keypad;
pub mod modem;
pub mod nfc;
pub mod printer;
pub mod robot_keypad;

pub use keypad::{KeypadConfig, KeypadMonitor};
pub use modem::{ModemConfig, ModemMonitor};
pub use nfc::{NfcConfig, NfcMonitor};
pub use printer::{PrinterConfig, PrinterMonitor};
pub use robot_keypad::{RobotKeypadConfig, RobotKeypadMonitor};

/// A per-device state machine over log events.
pub trait Monitor: Send {
    /// The device this monitor watches.
    /// Actions are checked against the allow-list using this.
    fn id(&self) -> &str;

    /// Cheap pre-filter.
    /// [`Monitor::handle`] is only called for messages this accepts.
    fn interested(&self, message: &str) -> bool;

    /// Advance the state machine.
    /// Must not block.
    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>>;
}

/// The kinds of monitors there are.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// See [`PrinterMonitor`].
    Printer,

    /// See [`NfcMonitor`].
    Nfc,

    /// Card reads. Also an [`NfcMonitor`].
    NfcRead,

    /// See [`ModemMonitor`].
    Modem,

    /// See [`KeypadMonitor`].
    Keypad,

    /// See [`RobotKeypadMonitor`].
    RobotKeypad,
}

impl MonitorKind {
    /// All kinds.
    pub const ALL: [MonitorKind; 6] = [
        MonitorKind::Printer,
        MonitorKind::Nfc,
        MonitorKind::NfcRead,
        MonitorKind::Modem,
        MonitorKind::Keypad,
        MonitorKind::RobotKeypad,
    ];

    /// The name used in programs and job arguments.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorKind::Printer => "printer",
            MonitorKind::Nfc => "nfc",
            MonitorKind::NfcRead => "nfc_read",
            MonitorKind::Modem => "modem",
            MonitorKind::Keypad => "keypad",
            MonitorKind::RobotKeypad => "robot_keypad",
        }
    }

    /// Look up a kind by name.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| Error::UnknownMonitor(name.to_owned()))
    }
}

impl Display for MonitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which monitor to run, and its settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorSpec {
    /// See [`PrinterMonitor`].
    Printer(PrinterConfig),

    /// See [`NfcMonitor`].
    Nfc(NfcConfig),

    /// See [`MonitorKind::NfcRead`].
    NfcRead(NfcConfig),

    /// See [`ModemMonitor`].
    Modem(ModemConfig),

    /// See [`KeypadMonitor`].
    Keypad(KeypadConfig),

    /// See [`RobotKeypadMonitor`].
    RobotKeypad(RobotKeypadConfig),
}

fn settings<T: for<'de> Deserialize<'de>>(kind: MonitorKind, config: serde_json::Value) -> Result<T> {
    // `null` means "all defaults".
    let config = match config {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };

    serde_json::from_value(config).map_err(|e| Error::BadMonitorConfig {
        monitor: kind.to_string(),
        problem: e.to_string(),
    })
}

impl MonitorSpec {
    /// The kind of monitor this describes.
    pub fn kind(&self) -> MonitorKind {
        match self {
            MonitorSpec::Printer(_) => MonitorKind::Printer,
            MonitorSpec::Nfc(_) => MonitorKind::Nfc,
            MonitorSpec::NfcRead(_) => MonitorKind::NfcRead,
            MonitorSpec::Modem(_) => MonitorKind::Modem,
            MonitorSpec::Keypad(_) => MonitorKind::Keypad,
            MonitorSpec::RobotKeypad(_) => MonitorKind::RobotKeypad,
        }
    }

    /// A monitor by name, with settings as found in job arguments.
    ///
    /// ```
    /// use meter_eol::monitor::{MonitorKind, MonitorSpec};
    ///
    /// let spec = MonitorSpec::from_json("printer", serde_json::json!({"timeout_s": 8.0})).unwrap();
    /// assert_eq!(spec.kind(), MonitorKind::Printer);
    /// ```
    pub fn from_json(name: &str, config: serde_json::Value) -> Result<Self> {
        let kind = MonitorKind::from_name(name)?;

        Ok(match kind {
            MonitorKind::Printer => Self::Printer(settings(kind, config)?),
            MonitorKind::Nfc => Self::Nfc(settings(kind, config)?),
            MonitorKind::NfcRead => Self::NfcRead(settings(kind, config)?),
            MonitorKind::Modem => Self::Modem(settings(kind, config)?),
            MonitorKind::Keypad => Self::Keypad(settings(kind, config)?),
            MonitorKind::RobotKeypad => Self::RobotKeypad(settings(kind, config)?),
        })
    }

    /// Parse a list of `[name, settings]` pairs, as found under a job's `monitors` argument.
    pub fn list_from_json(value: serde_json::Value) -> Result<Vec<Self>> {
        let bad = |problem: String| Error::BadMonitorConfig {
            monitor: "monitors".into(),
            problem,
        };

        let entries = match value {
            serde_json::Value::Null => return Ok(vec![]),
            serde_json::Value::Array(entries) => entries,
            other => return Err(bad(format!("expected a list, got `{other}`"))),
        };

        entries
            .into_iter()
            .map(|entry| match entry {
                serde_json::Value::String(name) => Self::from_json(&name, serde_json::Value::Null),
                serde_json::Value::Array(mut pair) if (1..=2).contains(&pair.len()) => {
                    let config = if pair.len() == 2 {
                        pair.pop().unwrap_or_default()
                    } else {
                        serde_json::Value::Null
                    };
                    match pair.pop() {
                        Some(serde_json::Value::String(name)) => Self::from_json(&name, config),
                        other => Err(bad(format!("expected a monitor name, got `{other:?}`"))),
                    }
                }
                other => Err(bad(format!("expected `[name, settings]`, got `{other}`"))),
            })
            .collect()
    }
}

/// What monitors may need besides their own settings.
#[derive(Clone)]
pub struct MonitorContext {
    /// The meter under test.
    pub meter: MeterInfo,

    /// The job's shared state.
    pub shared: Arc<SharedState>,

    /// Robot events, for robot assisted tests.
    pub robot: Option<Arc<dyn RobotEvents>>,
}

/// Build a monitor.
pub fn build(spec: &MonitorSpec, context: &MonitorContext) -> Result<Box<dyn Monitor>> {
    Ok(match spec {
        MonitorSpec::Printer(config) => Box::new(PrinterMonitor::new(config)?),
        MonitorSpec::Nfc(config) | MonitorSpec::NfcRead(config) => {
            Box::new(NfcMonitor::new(config)?)
        }
        MonitorSpec::Modem(config) => Box::new(ModemMonitor::new(config)?),
        MonitorSpec::Keypad(config) => Box::new(KeypadMonitor::new(config, &context.meter)?),
        MonitorSpec::RobotKeypad(config) => {
            let robot = context.robot.clone().ok_or_else(|| Error::BadMonitorConfig {
                monitor: MonitorKind::RobotKeypad.to_string(),
                problem: "no robot is available".into(),
            })?;

            Box::new(RobotKeypadMonitor::new(
                config,
                &context.meter,
                context.shared.clone(),
                robot,
            )?)
        }
    })
}

/// A timeout given in (possibly fractional) seconds.
pub(crate) fn seconds(kind: MonitorKind, name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| Error::BadMonitorConfig {
        monitor: kind.to_string(),
        problem: format!("`{name}` must be a non-negative number of seconds, got {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn names_round_trip() {
        for kind in MonitorKind::ALL {
            assert_eq!(MonitorKind::from_name(kind.name()).unwrap(), kind);
        }

        assert!(matches!(
            MonitorKind::from_name("toaster"),
            Err(Error::UnknownMonitor(_))
        ));
    }

    #[test]
    fn list_from_job_arguments() {
        let specs = MonitorSpec::list_from_json(json!([
            ["nfc", {"timeout_on_s": 6.0, "timeout_off_s": 5.0}],
            ["robot_keypad", {"buttons": ["1", "2"]}],
            "printer",
        ]))
        .unwrap();

        let kinds = specs.iter().map(MonitorSpec::kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![MonitorKind::Nfc, MonitorKind::RobotKeypad, MonitorKind::Printer]
        );

        match &specs[0] {
            MonitorSpec::Nfc(config) => assert_eq!(config.timeout_off_s, 5.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_list_is_allowed() {
        assert!(MonitorSpec::list_from_json(json!([])).unwrap().is_empty());
    }

    #[test]
    fn bad_settings() {
        let result = MonitorSpec::from_json("printer", json!({"timeout_s": "soon"}));

        assert!(matches!(result, Err(Error::BadMonitorConfig { .. })));
    }

    #[test]
    fn negative_timeout() {
        assert!(seconds(MonitorKind::Modem, "connect_timeout_s", -1.0).is_err());
        assert_eq!(
            seconds(MonitorKind::Modem, "connect_timeout_s", 0.5).unwrap(),
            Duration::from_millis(500)
        );
    }
}
