use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    monitor::{MonitorSpec, NfcConfig, PrinterConfig},
    shared::FlushPolicy,
    transport::CommandTransport,
};

/// A meter as described by a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeterConfig {
    /// How jobs refer to this meter. Usually its address.
    pub id: String,

    /// Where to reach it.
    pub host: String,

    /// Who to log in as.
    pub user: String,

    /// The meter's own name, used in log file names.
    pub hostname: String,

    /// E.g. `ms3`.
    pub meter_type: String,

    /// Firmware versions by module name.
    /// A module without a version (or `-----`) is missing.
    pub firmwares: BTreeMap<String, String>,

    /// Where job records go. Jobs are not stored without one.
    pub db_id: Option<i64>,

    /// Remote shell commands by device name, e.g. `"printer"` or `"modem on"`.
    /// `beep` may use a `{count}` placeholder.
    pub commands: BTreeMap<String, String>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: String::new(),
            user: "root".into(),
            hostname: String::new(),
            meter_type: String::new(),
            firmwares: BTreeMap::new(),
            db_id: None,
            commands: BTreeMap::new(),
        }
    }
}

/// The configuration used when running jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where job logs are written.
    pub log_dir: PathBuf,

    /// Whether job logs are kept at all.
    pub save_logs: bool,

    /// Where finished jobs are stored. In memory only if not set.
    pub store_dir: Option<PathBuf>,

    /// How long the listener waits for a line before checking on the job anyway.
    pub poll_interval_ms: u64,

    /// Write the job log to disk once this many lines are waiting.
    pub flush_lines: usize,

    /// Write the job log to disk at least this often.
    pub flush_interval_ms: u64,

    /// How long a finished job waits for its listener to let go of the log.
    pub listener_join_timeout_ms: u64,

    /// Whether routines hold their minimum delays.
    /// Printers, modems and NFC readers need time between cycles.
    pub min_delays: bool,

    /// How meter logs are tailed.
    pub transport: CommandTransport,

    /// The meters jobs can run on.
    pub meters: Vec<MeterConfig>,

    /// Monitors to use instead of a program's own, by program name.
    pub programs: BTreeMap<String, Vec<MonitorSpec>>,
}

impl Default for Config {
    fn default() -> Self {
        let flush = FlushPolicy::default();

        Self {
            log_dir: PathBuf::from("./logs"),
            save_logs: true,
            store_dir: None,
            poll_interval_ms: 50,
            flush_lines: flush.lines,
            flush_interval_ms: flush.interval.as_millis() as u64,
            listener_join_timeout_ms: 5000,
            min_delays: true,
            transport: CommandTransport::default(),
            meters: vec![],
            programs: BTreeMap::new(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents, and validate it.
    pub fn deserialize(input: &str) -> Result<Self> {
        let config = Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        let meter = MeterConfig {
            id: "192.168.137.32".into(),
            host: "192.168.137.32".into(),
            hostname: "meter-0042".into(),
            meter_type: "ms3".into(),
            firmwares: [
                ("PRINTER", "2.1.0"),
                ("KIOSK_NFC", "1.4.2"),
                ("MK7_XE910", "-----"),
                ("KBD_CONTROLLER", "3.0.1"),
            ]
            .into_iter()
            .map(|(module, version)| (module.to_owned(), version.to_owned()))
            .collect(),
            db_id: Some(42),
            commands: [
                ("printer", "ms3ctl print --test"),
                ("nfc on", "ms3ctl nfc on"),
                ("nfc off", "ms3ctl nfc off"),
                ("beep", "ms3ctl beep {count}"),
            ]
            .into_iter()
            .map(|(device, command)| (device.to_owned(), command.to_owned()))
            .collect(),
            ..Default::default()
        };

        let mut programs = BTreeMap::new();
        programs.insert(
            "cycle_nfc".to_owned(),
            vec![
                MonitorSpec::Nfc(NfcConfig {
                    timeout_on_s: 6.0,
                    timeout_off_s: 5.0,
                }),
                MonitorSpec::Printer(PrinterConfig { timeout_s: 10.0 }),
            ],
        );

        Self {
            store_dir: Some(PathBuf::from("./jobs")),
            meters: vec![meter],
            programs,
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self> {
        let s = std::fs::read_to_string(p)?;

        Self::deserialize(&s)
    }

    /// The meter with the given id, if configured.
    pub fn meter(&self, id: &str) -> Option<&MeterConfig> {
        self.meters.iter().find(|meter| meter.id == id)
    }

    /// See [`Config::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`Config::listener_join_timeout_ms`].
    pub fn listener_join_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_join_timeout_ms)
    }

    /// When job logs are flushed.
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            lines: self.flush_lines,
            interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    fn check_duplicate_meters(&self) -> Result<()> {
        let duplicates = self
            .meters
            .iter()
            .map(|meter| &meter.id)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Meter ids must be unique. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_flush_thresholds(&self) -> Result<()> {
        if self.flush_lines == 0 || self.flush_interval_ms == 0 {
            return Err(Error::BadConfig(format!(
                "Flush thresholds must be non-zero, got {} lines and {} ms",
                self.flush_lines, self.flush_interval_ms
            )));
        }

        Ok(())
    }

    fn check_programs(&self) -> Result<()> {
        let unknown = self
            .programs
            .keys()
            .filter(|name| crate::program::canonical(name) != Some(name.as_str()))
            .collect::<Vec<_>>();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Monitor overrides must use canonical program names. Not known: {unknown:?}"
            )))
        }
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<()> {
        self.check_duplicate_meters()?;
        self.check_flush_thresholds()?;
        self.check_programs()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn example_round_trip() {
        let c = Config::example();

        let serialized = c.serialize_pretty().unwrap();
        println!("{serialized}");

        assert_eq!(Config::deserialize(&serialized).unwrap(), c);
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    log_dir: "/var/log/eol",
    poll_interval_ms: 20,
    meters: [
        (
            id: "10.0.0.7",
            host: "10.0.0.7",
            meter_type: "ms2.5",
            firmwares: {
                "KBD_CONTROLLER": "1.0",
            },
            db_id: 7,
            commands: {
                "printer": "print-test",
            },
        ),
    ],
    programs: {
        "test_keypad": [
            keypad((inactivity_timeout_s: 20.0, layouts: ["1x6"], count: 2)),
        ],
    },
)
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert!(config.save_logs);

        let meter = config.meter("10.0.0.7").unwrap();
        assert_eq!(meter.user, "root");
        assert_eq!(meter.db_id, Some(7));

        assert_eq!(config.programs["test_keypad"].len(), 1);
    }

    #[test]
    fn bad_config_duplicates() {
        let meter = |id: &str| MeterConfig {
            id: id.into(),
            ..Default::default()
        };

        let c = Config {
            meters: vec![meter("a"), meter("b"), meter("a")],
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("\"a\""));
        assert!(!err.contains("\"b\""));
    }

    #[test]
    fn bad_config_flush() {
        let c = Config {
            flush_lines: 0,
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("0 lines"));
    }

    #[test]
    fn bad_config_program_alias() {
        let mut programs = BTreeMap::new();
        programs.insert("printer".to_owned(), vec![]);

        let c = Config {
            programs,
            ..Default::default()
        };

        assert!(c.validate().is_err());
    }

    #[test]
    fn garbage() {
        assert!(matches!(
            Config::deserialize("(meters: 12)"),
            Err(Error::BadConfig(_))
        ));
    }
}
