//! Checks that every key of the meter's keypads gets pressed.
//!
//! A person presses the keys while this watches the log.
//! Any gap in activity longer than the inactivity timeout fails the test.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{seconds, Monitor, MonitorKind};
use crate::{
    actions::{Action, StartWatch},
    classifier::LogEvent,
    error::Result,
    meter::MeterInfo,
};

/// The keys of each known keypad layout.
pub const KEY_LAYOUTS: [(&str, &[&str]); 3] = [
    ("1x6", &["help", "up", "down", "cancel", "accept", "max"]),
    (
        "1x7",
        &["help", "up", "down", "cancel", "accept", "max", "center"],
    ),
    (
        "6x7",
        &[
            "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "A", "B", "C", "D", "E", "F", "G",
            "H", "I", "J", "K", "L", "M", "N", "O", "P", "Q", "R", "S", "T", "U", "V", "W", "X",
            "Y", "Z", "ASTERISK", "POUND", "BACK", "ENTER",
        ],
    ),
];

/// The keys of a layout, if known.
pub fn layout_keys(layout: &str) -> Option<&'static [&'static str]> {
    KEY_LAYOUTS
        .iter()
        .find(|(name, _)| *name == layout)
        .map(|(_, keys)| *keys)
}

/// The keypad layouts a meter has, going by its firmware inventory.
pub fn layouts_for_meter(meter: &MeterInfo) -> Vec<String> {
    let meter_type = meter.meter_type.to_lowercase();
    let mut layouts = vec![];

    if meter.has_firmware("KEY_PAD_2") {
        layouts.push("6x7".to_owned());
    }
    if meter.has_firmware("KBD_CONTROLLER") {
        match meter_type.as_str() {
            "ms2.5" => layouts.push("1x6".to_owned()),
            "ms3" => layouts.push("1x7".to_owned()),
            _ => {}
        }
    }

    layouts
}

static KEY_PRESSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)KEY_PRESSED:\s*(?P<key>[^,]+),\s*isAutoRepeat=(?P<ar>true|false),\s*from\s+(?P<src>\S+)",
    )
    .expect("key pressed pattern is valid")
});

const ALLOWED_SOURCES: [&str; 2] = ["KEY_PAD_2", "KBD_CONTROLLER"];

/// Key names are compared trimmed and upper case.
pub(crate) fn normalize(key: &str) -> String {
    key.trim().to_uppercase()
}

/// A key press as seen in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyPress {
    pub(crate) key: String,
    pub(crate) auto_repeat: bool,
    pub(crate) source: String,
}

impl KeyPress {
    /// Parse a `KEY_PRESSED` line.
    pub(crate) fn parse(message: &str) -> Option<Self> {
        let captures = KEY_PRESSED.captures(message)?;

        Some(Self {
            key: normalize(&captures["key"]),
            auto_repeat: captures["ar"].eq_ignore_ascii_case("true"),
            source: normalize(&captures["src"]),
        })
    }

    /// Whether this came from one of the meter's keypads.
    pub(crate) fn from_keypad(&self) -> bool {
        ALLOWED_SOURCES.contains(&self.source.as_str())
    }
}

/// Counts presses of a set of expected keys.
#[derive(Debug, Clone)]
pub(crate) struct KeyTally {
    expected: BTreeSet<String>,
    required: u32,
    seen: BTreeMap<String, u32>,
}

impl KeyTally {
    pub(crate) fn new(expected: impl IntoIterator<Item = String>, required: u32) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            required: required.max(1),
            seen: BTreeMap::new(),
        }
    }

    pub(crate) fn expects(&self, key: &str) -> bool {
        self.expected.contains(key)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    /// Count a press, returning how many times the key has been seen.
    pub(crate) fn count(&mut self, key: &str) -> u32 {
        let seen = self.seen.entry(key.to_owned()).or_default();
        *seen = seen.saturating_add(1);
        *seen
    }

    pub(crate) fn required(&self) -> u32 {
        self.required
    }

    fn satisfied(&self, key: &str) -> bool {
        self.seen.get(key).copied().unwrap_or_default() >= self.required
    }

    /// Whether all of `keys` have been pressed enough.
    pub(crate) fn all_satisfied<'a>(&self, mut keys: impl Iterator<Item = &'a String>) -> bool {
        keys.all(|key| self.satisfied(key))
    }

    /// Never complete when nothing is expected.
    pub(crate) fn complete(&self) -> bool {
        !self.is_empty() && self.all_satisfied(self.expected.iter())
    }

    /// Presses counted towards completion, out of the total needed.
    pub(crate) fn progress(&self) -> (u32, u32) {
        let keys = u32::try_from(self.expected.len()).unwrap_or(u32::MAX);
        let total = keys.saturating_mul(self.required);
        let done = self
            .expected
            .iter()
            .map(|key| self.seen.get(key).copied().unwrap_or_default().min(self.required))
            .fold(0u32, u32::saturating_add);

        (done, total)
    }

    /// Keys still short of presses, for logging.
    pub(crate) fn missing(&self) -> String {
        let missing = self
            .expected
            .iter()
            .filter(|key| !self.satisfied(key))
            .map(|key| {
                format!(
                    "{key}({}/{})",
                    self.seen.get(key).copied().unwrap_or_default(),
                    self.required
                )
            })
            .collect::<Vec<_>>();

        let mut summary = missing.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
        if missing.len() > 8 {
            summary.push_str(" ...");
        }
        summary
    }
}

/// Settings for [`KeypadMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeypadConfig {
    /// Longest allowed pause between key presses.
    pub inactivity_timeout_s: f64,

    /// Which layouts to test. Empty means the meter's own, see [`layouts_for_meter`].
    pub layouts: Vec<String>,

    /// How often each key must be pressed.
    pub count: u32,
}

impl Default for KeypadConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_s: 15.0,
            layouts: vec![],
            count: 1,
        }
    }
}

/// See the module level docs.
#[derive(Debug)]
pub struct KeypadMonitor {
    timeout: Duration,
    layouts: BTreeMap<String, BTreeSet<String>>,
    layouts_done: BTreeSet<String>,
    tally: KeyTally,
    gap_key: Option<String>,
    succeeded: bool,
}

impl KeypadMonitor {
    const ID: &'static str = "keypad";

    /// A new monitor for the given meter.
    pub fn new(config: &KeypadConfig, meter: &MeterInfo) -> Result<Self> {
        let timeout = seconds(
            MonitorKind::Keypad,
            "inactivity_timeout_s",
            config.inactivity_timeout_s,
        )?;

        let names = if config.layouts.is_empty() {
            layouts_for_meter(meter)
        } else {
            config.layouts.clone()
        };

        let mut layouts = BTreeMap::new();
        for name in names {
            match layout_keys(&name) {
                Some(keys) => {
                    layouts.insert(name, keys.iter().map(|key| normalize(key)).collect());
                }
                None => warn!(layout = %name, "Unknown keypad layout, skipping"),
            }
        }

        let tally = KeyTally::new(layouts.values().flatten().cloned(), config.count);

        info!(meter_type = %meter.meter_type, layouts = ?layouts.keys().collect::<Vec<_>>(), "Keypad test");
        if tally.is_empty() {
            warn!("No expected keys for this meter, only the inactivity watch will run");
        }

        Ok(Self {
            timeout,
            layouts,
            layouts_done: BTreeSet::new(),
            tally,
            gap_key: None,
            succeeded: false,
        })
    }

    fn cancel_gap(&mut self) -> Option<Action> {
        self.gap_key.take().map(|key| Action::cancel(&key))
    }

    fn arm_gap(&mut self, ts: i64) -> Vec<Action> {
        let mut actions = self.cancel_gap().into_iter().collect::<Vec<_>>();

        let key = format!("{}:gap:{ts}", Self::ID);
        self.gap_key = Some(key.clone());

        actions.push(
            StartWatch::critical(
                &key,
                self.timeout,
                Self::ID,
                &format!("No keypad activity for {:.0}s", self.timeout.as_secs_f64()),
            )
            .into(),
        );
        actions
    }
}

impl Monitor for KeypadMonitor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn interested(&self, message: &str) -> bool {
        message.to_lowercase().contains("key_pressed:")
    }

    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>> {
        let Some(press) = KeyPress::parse(&event.message) else {
            return Ok(vec![]);
        };

        if !press.from_keypad() {
            debug!(source = %press.source, "Ignoring key from elsewhere");
            return Ok(vec![]);
        }
        if press.auto_repeat {
            debug!(key = %press.key, "Ignoring auto-repeat");
            return Ok(vec![]);
        }
        if self.succeeded {
            return Ok(vec![]);
        }

        let mut actions = self.arm_gap(event.epoch_seconds());

        if !self.tally.expects(&press.key) {
            debug!(key = %press.key, "Key not required");
            return Ok(actions);
        }

        let seen = self.tally.count(&press.key);
        let (current_cycle, total_cycles) = self.tally.progress();
        debug!(
            key = %press.key,
            "#{seen}/{}, missing: {}",
            self.tally.required(),
            self.tally.missing()
        );

        actions.push(Action::ProgressUpdate {
            program: Self::ID.into(),
            current_cycle,
            total_cycles,
            ip: None,
        });

        let newly_done = self
            .layouts
            .iter()
            .filter(|(name, keys)| {
                !self.layouts_done.contains(*name) && self.tally.all_satisfied(keys.iter())
            })
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for layout in newly_done {
            info!(%layout, "Layout completed");
            self.layouts_done.insert(layout);

            let mut data = serde_json::Map::new();
            data.insert("layouts_done".into(), json!(self.layouts_done));
            actions.push(Action::MetaUpdate {
                device: Self::ID.into(),
                data,
            });
        }

        if self.tally.complete() {
            info!("All required keys pressed");
            self.succeeded = true;
            actions.extend(self.cancel_gap());
            actions.push(Action::MarkSuccess {
                device: Self::ID.into(),
                message: "All required keypad presses observed".into(),
            });
        }

        Ok(actions)
    }
}
