use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

/// Identifies a device under test within a meter,
/// e.g. `"printer"`, `"nfc"` or `"coin shutter"`.
pub type DeviceId = String;

/// How bad it is when a watchdog expires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Stops the job.
    #[default]
    Critical,

    /// Fails the device but lets the job continue.
    Warning,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A watchdog expired before it was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    /// The device the watchdog was armed for.
    pub device: DeviceId,

    /// See [`Severity`].
    pub severity: Severity,

    /// What the monitor wanted said on expiry.
    pub message: String,
}

impl Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.device, self.message)
    }
}

/// Arm a watchdog.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWatch {
    /// The key used to cancel it later.
    pub key: String,

    /// How long until it fires.
    pub timeout: Duration,

    /// The device which is blamed on expiry.
    pub device: DeviceId,

    /// The [`Fault`] message on expiry.
    pub on_timeout_message: String,

    /// See [`Severity`].
    pub severity: Severity,
}

impl StartWatch {
    /// A critical watch.
    pub fn critical(key: &str, timeout: Duration, device: &str, on_timeout_message: &str) -> Self {
        Self {
            key: key.to_owned(),
            timeout,
            device: device.to_owned(),
            on_timeout_message: on_timeout_message.to_owned(),
            severity: Severity::Critical,
        }
    }
}

/// What monitors (and their background tasks) ask of the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Arm a watchdog.
    StartWatch(StartWatch),

    /// Disarm a watchdog if it is still pending.
    CancelWatch {
        /// See [`StartWatch::key`].
        key: String,
    },

    /// The device passed.
    MarkSuccess {
        /// Which device.
        device: DeviceId,

        /// Why.
        message: String,
    },

    /// Merge into the job's free-form metadata.
    MetaUpdate {
        /// The device reporting.
        device: DeviceId,

        /// Entries to merge.
        data: serde_json::Map<String, serde_json::Value>,
    },

    /// Forwarded to progress observers, no effect on control flow.
    ProgressUpdate {
        /// The program (or device) making progress.
        program: String,

        /// Where we are.
        current_cycle: u32,

        /// Where we're going.
        total_cycles: u32,

        /// The meter. If `None` the listener's host is used.
        ip: Option<String>,
    },
}

impl Action {
    /// Shorthand for [`Action::CancelWatch`].
    pub fn cancel(key: &str) -> Self {
        Self::CancelWatch {
            key: key.to_owned(),
        }
    }

    /// The device this action names, if any.
    /// Cancels and progress updates are attributed to whoever emitted them.
    pub fn device(&self) -> Option<&str> {
        match self {
            Action::StartWatch(watch) => Some(&watch.device),
            Action::MarkSuccess { device, .. } | Action::MetaUpdate { device, .. } => Some(device),
            Action::CancelWatch { .. } | Action::ProgressUpdate { .. } => None,
        }
    }
}

impl From<StartWatch> for Action {
    fn from(watch: StartWatch) -> Self {
        Self::StartWatch(watch)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::StartWatch(watch) => write!(
                f,
                "watch start {} ({:.1}s)",
                watch.key,
                watch.timeout.as_secs_f64()
            ),
            Action::CancelWatch { key } => write!(f, "watch cancel {key}"),
            Action::MarkSuccess { message, .. } => write!(f, "success: {message}"),
            Action::MetaUpdate { data, .. } => {
                write!(f, "meta: {}", serde_json::Value::Object(data.clone()))
            }
            Action::ProgressUpdate {
                current_cycle,
                total_cycles,
                ..
            } => write!(f, "progress: {current_cycle}/{total_cycles}"),
        }
    }
}
