//! The meter under test, as far as jobs and routines need it.

use std::{collections::BTreeMap, fmt::Debug, process::Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    config::MeterConfig,
    error::{Error, Result},
};

/// The firmware module behind a device, if the device has one.
/// `None` for devices every meter has.
pub fn device_module(device: &str) -> Option<Option<&'static str>> {
    match device.to_lowercase().as_str() {
        "printer" => Some(Some("PRINTER")),
        "coin shutter" => Some(Some("COIN_SHUTTER")),
        "nfc" => Some(Some("KIOSK_NFC")),
        "modem" => Some(Some("MK7_XE910")),
        "screen test" => Some(None),
        _ => None,
    }
}

/// What monitors need to know about a meter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeterInfo {
    /// E.g. `ms2.5`, `ms3` or `msx`.
    pub meter_type: String,

    /// Firmware versions by module name, e.g. `KIOSK_NFC`.
    pub firmwares: BTreeMap<String, String>,
}

impl MeterInfo {
    /// The firmware version of a module.
    /// Blank and dashed-out versions (`-----`) mean the module is missing.
    pub fn firmware(&self, module: &str) -> Option<&str> {
        self.firmwares
            .get(module)
            .map(|version| version.trim())
            .filter(|version| !version.is_empty() && !version.chars().all(|c| c == '-'))
    }

    /// Whether the meter has a module.
    pub fn has_firmware(&self, module: &str) -> bool {
        self.firmware(module).is_some()
    }

    /// Whether the meter has what it takes to test a device.
    /// Unknown devices are never present.
    pub fn has_device(&self, device: &str) -> bool {
        match device_module(device) {
            Some(Some(module)) => self.has_firmware(module),
            Some(None) => true,
            None => false,
        }
    }
}

/// Remote control of a meter.
#[async_trait]
pub trait Meter: Send + Sync + Debug {
    /// How jobs refer to this meter, usually its address.
    fn id(&self) -> &str;

    /// Where to reach it.
    fn host(&self) -> &str;

    /// Who to log in as.
    fn user(&self) -> &str;

    /// The meter's own name, used in log file names.
    fn hostname(&self) -> &str;

    /// See [`MeterInfo`].
    fn info(&self) -> MeterInfo;

    /// Where job records go. `None` means they are not stored.
    fn db_id(&self) -> Option<i64>;

    /// Whether the meter has a device, see [`MeterInfo::has_device`].
    fn has_module(&self, device: &str) -> bool {
        self.info().has_device(device)
    }

    /// Run a device's self-test once, e.g. print a ticket.
    async fn trigger(&self, device: &str) -> Result<()>;

    /// Sound the buzzer.
    async fn beep(&self, count: u32) -> Result<()>;
}

/// A meter controlled by running commands over `ssh`.
#[derive(Debug, Clone)]
pub struct SshMeter {
    config: MeterConfig,
}

impl SshMeter {
    /// A meter as configured.
    pub fn new(config: MeterConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command: &str) -> Result<()> {
        let target = format!("{}@{}", self.config.user, self.config.host);
        debug!(%target, command, "Running");

        let output = Command::new("ssh")
            .arg(&target)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Meter(format!("could not run ssh: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Meter(format!(
                "`{command}` on {target} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl Meter for SshMeter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn user(&self) -> &str {
        &self.config.user
    }

    fn hostname(&self) -> &str {
        &self.config.hostname
    }

    fn info(&self) -> MeterInfo {
        MeterInfo {
            meter_type: self.config.meter_type.clone(),
            firmwares: self.config.firmwares.clone(),
        }
    }

    fn db_id(&self) -> Option<i64> {
        self.config.db_id
    }

    async fn trigger(&self, device: &str) -> Result<()> {
        let command = self
            .config
            .commands
            .get(device)
            .ok_or_else(|| Error::Meter(format!("no command configured for `{device}`")))?;

        self.run(command).await
    }

    async fn beep(&self, count: u32) -> Result<()> {
        let Some(command) = self.config.commands.get("beep") else {
            warn!(meter = %self.config.id, "No beep command configured");
            return Ok(());
        };

        self.run(&command.replace("{count}", &count.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn info(firmwares: &[(&str, &str)]) -> MeterInfo {
        MeterInfo {
            meter_type: "ms3".into(),
            firmwares: firmwares
                .iter()
                .map(|(module, version)| (module.to_string(), version.to_string()))
                .collect(),
        }
    }

    #[test]
    fn missing_firmwares() {
        let meter = info(&[("PRINTER", " 1.2 "), ("KIOSK_NFC", "-----"), ("MK7_XE910", "")]);

        assert_eq!(meter.firmware("PRINTER"), Some("1.2"));
        assert!(!meter.has_firmware("KIOSK_NFC"));
        assert!(!meter.has_firmware("MK7_XE910"));
        assert!(!meter.has_firmware("COIN_SHUTTER"));
    }

    #[test]
    fn devices() {
        let meter = info(&[("PRINTER", "1.2")]);

        assert!(meter.has_device("printer"));
        assert!(meter.has_device("Screen Test"));
        assert!(!meter.has_device("nfc"));
        assert!(!meter.has_device("toaster"));
    }

    #[tokio::test]
    async fn trigger_without_command_fails() {
        let meter = SshMeter::new(MeterConfig::default());

        assert!(matches!(
            meter.trigger("printer").await,
            Err(Error::Meter(_))
        ));

        // No beep command is fine.
        meter.beep(3).await.unwrap();
    }
}
