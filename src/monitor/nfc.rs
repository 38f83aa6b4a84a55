//! Checks that the NFC reader powers on and off when asked to.
//!
//! Requests come from the terminal as either `EMV_POWER` or `CARD_READ_INST`,
//! the reader confirms with `EMV_POWER_REPLY`.
//! Meters of different generations use different payload widths for the reply,
//! see [`PowerState::from_reply`].

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

static REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)GENERIC_TERMINAL\.\S*->KIOSK_NFC\.\S*\s+(?:APPLICATION_MSG\s+)?(?P<verb>EMV_POWER|CARD_READ_INST)\b.*?\bD=(?P<payload>[0-9A-Fa-f ]+)",
    )
    .expect("nfc request pattern is valid")
});

static REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bEMV_POWER_REPLY\b.*?\bD=(?P<payload>[0-9A-Fa-f ]+)")
        .expect("nfc reply pattern is valid")
});

/// Whether the reader is (asked to be) powered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Powered.
    On,

    /// Not powered.
    Off,
}

fn tokens(payload: &str) -> Vec<String> {
    payload
        .split_whitespace()
        .map(|token| token.to_uppercase())
        .collect()
}

impl PowerState {
    /// Decode a request payload.
    ///
    /// `EMV_POWER`: `01 01` is on, `01 00` is off.
    /// `CARD_READ_INST`: `00 02` is on, `00 05` is off.
    pub fn from_request(verb: &str, payload: &str) -> Option<Self> {
        let tokens = tokens(payload);
        let (first, second) = match tokens.as_slice() {
            [first, second, ..] => (first.as_str(), second.as_str()),
            _ => return None,
        };

        match (verb.to_uppercase().as_str(), first, second) {
            ("EMV_POWER", "01", "01") => Some(Self::On),
            ("EMV_POWER", "01", "00") => Some(Self::Off),
            ("CARD_READ_INST", "00", "02") => Some(Self::On),
            ("CARD_READ_INST", "00", "05") => Some(Self::Off),
            _ => None,
        }
    }

    /// Decode an `EMV_POWER_REPLY` payload.
    ///
    /// Two bytes: `01 00` is on, `00 00` is off.
    /// Four or more bytes: the first is the module (`01`), the second the state.
    ///
    /// ```
    /// use meter_eol::monitor::nfc::PowerState;
    ///
    /// assert_eq!(PowerState::from_reply("01 00"), Some(PowerState::On));
    /// assert_eq!(PowerState::from_reply("01 00 00 00"), Some(PowerState::Off));
    /// ```
    pub fn from_reply(payload: &str) -> Option<Self> {
        let tokens = tokens(payload);

        match tokens.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["01", "00"] => Some(Self::On),
            ["00", "00"] => Some(Self::Off),
            [_, _] => None,
            ["01", "01", _, ..] => Some(Self::On),
            ["01", "00", _, ..] => Some(Self::Off),
            _ => None,
        }
    }
}

/// Settings for [`NfcMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NfcConfig {
    /// How long powering on may take.
    pub timeout_on_s: f64,

    /// How long powering off may take.
    pub timeout_off_s: f64,
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            timeout_on_s: 6.0,
            timeout_off_s: 3.0,
        }
    }
}

/// Arms a watch per power request, cancelled by the matching reply.
#[derive(Debug)]
pub struct NfcMonitor {
    timeout_on: Duration,
    timeout_off: Duration,
    on_key: Option<String>,
    off_key: Option<String>,
}

impl NfcMonitor {
    const ID: &'static str = "nfc";

    /// A new monitor.
    pub fn new(config: &NfcConfig) -> Result<Self> {
        let kind = MonitorKind::Nfc;

        Ok(Self {
            timeout_on: seconds(kind, "timeout_on_s", config.timeout_on_s)?,
            timeout_off: seconds(kind, "timeout_off_s", config.timeout_off_s)?,
            on_key: None,
            off_key: None,
        })
    }

    fn arm(&mut self, state: PowerState, ts: i64) -> Action {
        let (slot, timeout, purpose, wording) = match state {
            PowerState::On => (&mut self.on_key, self.timeout_on, "on", "ON"),
            PowerState::Off => (&mut self.off_key, self.timeout_off, "off", "OFF"),
        };

        let key = format!("{}:{purpose}:{ts}", Self::ID);
        debug!(%key, "Power {wording} requested, arming");
        *slot = Some(key.clone());

        StartWatch::critical(
            &key,
            timeout,
            Self::ID,
            &format!(
                "NFC failed to power {wording} within {:.1}s",
                timeout.as_secs_f64()
            ),
        )
        .into()
    }

    fn confirm(&mut self, state: PowerState) -> Vec<Action> {
        let slot = match state {
            PowerState::On => &mut self.on_key,
            PowerState::Off => &mut self.off_key,
        };

        match slot.take() {
            Some(key) => {
                debug!(%key, "Confirmed, cancelling");
                vec![Action::cancel(&key)]
            }
            None => vec![],
        }
    }
}

impl Monitor for NfcMonitor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn interested(&self, message: &str) -> bool {
        let message = message.to_lowercase();

        ["kiosk_nfc", "emv_power", "card_read_inst"]
            .iter()
            .any(|needle| message.contains(needle))
    }

    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>> {
        let message = &event.message;

        if let Some(captures) = REQUEST.captures(message) {
            let verb = &captures["verb"];
            let payload = &captures["payload"];

            return Ok(match PowerState::from_request(verb, payload) {
                Some(state) => vec![self.arm(state, event.epoch_seconds())],
                None => {
                    debug!(verb, payload = payload.trim(), "Request not understood");
                    vec![]
                }
            });
        }

        if let Some(captures) = REPLY.captures(message) {
            return Ok(match PowerState::from_reply(&captures["payload"]) {
                Some(state) => self.confirm(state),
                None => vec![],
            });
        }

        Ok(vec![])
    }
}
