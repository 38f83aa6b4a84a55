//! Checks that the modem connects and disconnects when told to.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{seconds, Monitor, MonitorKind};
use crate::{
    actions::{Action, StartWatch},
    classifier::LogEvent,
    error::Result,
};

static COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bMODEM:\s*SendRemote:\s*CMD\.(?P<cmd>CONNECT|DISCONNECT)\b")
        .expect("modem command pattern is valid")
});

static CONNECTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstate=S4_CONNECTED\b").expect("connected pattern is valid")
});

static IDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bstate=S1_IDLE\b").expect("idle pattern is valid"));

/// Settings for [`ModemMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModemConfig {
    /// How long connecting may take.
    pub connect_timeout_s: f64,

    /// How long disconnecting may take.
    pub disconnect_timeout_s: f64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            connect_timeout_s: 20.0,
            disconnect_timeout_s: 10.0,
        }
    }
}

/// Tracks connect and disconnect commands independently.
/// At most one of each is outstanding.
#[derive(Debug)]
pub struct ModemMonitor {
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    connect_key: Option<String>,
    disconnect_key: Option<String>,
}

impl ModemMonitor {
    const ID: &'static str = "modem";

    /// A new monitor.
    pub fn new(config: &ModemConfig) -> Result<Self> {
        let kind = MonitorKind::Modem;

        Ok(Self {
            connect_timeout: seconds(kind, "connect_timeout_s", config.connect_timeout_s)?,
            disconnect_timeout: seconds(kind, "disconnect_timeout_s", config.disconnect_timeout_s)?,
            connect_key: None,
            disconnect_key: None,
        })
    }

    // Arm under a fresh key, cancelling whatever was outstanding in this slot.
    fn arm(
        slot: &mut Option<String>,
        key: String,
        timeout: Duration,
        on_timeout: String,
    ) -> Vec<Action> {
        let mut actions = vec![];

        if let Some(previous) = slot.replace(key.clone()) {
            actions.push(Action::cancel(&previous));
        }

        debug!(%key, "Arming");
        actions.push(StartWatch::critical(&key, timeout, Self::ID, &on_timeout).into());
        actions
    }

    fn confirm(slot: &mut Option<String>) -> Vec<Action> {
        match slot.take() {
            Some(key) => {
                debug!(%key, "Confirmed, cancelling");
                vec![Action::cancel(&key)]
            }
            None => vec![],
        }
    }
}

impl Monitor for ModemMonitor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn interested(&self, message: &str) -> bool {
        message.to_lowercase().contains("modem")
    }

    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>> {
        let message = &event.message;
        let ts = event.epoch_seconds();

        if let Some(captures) = COMMAND.captures(message) {
            let actions = if captures["cmd"].eq_ignore_ascii_case("CONNECT") {
                Self::arm(
                    &mut self.connect_key,
                    format!("{}:connect:{ts}", Self::ID),
                    self.connect_timeout,
                    format!(
                        "Modem failed to reach CONNECTED within {:.1}s",
                        self.connect_timeout.as_secs_f64()
                    ),
                )
            } else {
                Self::arm(
                    &mut self.disconnect_key,
                    format!("{}:disconnect:{ts}", Self::ID),
                    self.disconnect_timeout,
                    format!(
                        "Modem failed to reach DISCONNECTED/IDLE within {:.1}s",
                        self.disconnect_timeout.as_secs_f64()
                    ),
                )
            };

            return Ok(actions);
        }

        if CONNECTED.is_match(message) {
            return Ok(Self::confirm(&mut self.connect_key));
        }

        if IDLE.is_match(message) {
            return Ok(Self::confirm(&mut self.disconnect_key));
        }

        Ok(vec![])
    }
}
