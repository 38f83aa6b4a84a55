//! Checks that every button the robot presses shows up in the meter's log.
//!
//! Log lines are handled like the [`KeypadMonitor`](super::KeypadMonitor) does.
//! Besides that, a background task follows the robot's own events:
//! when the robot starts pressing a button a per-button watch is armed,
//! which only the meter seeing that key press cancels.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use super::{
    keypad::{normalize, KeyPress, KeyTally},
    seconds, Monitor, MonitorKind,
};
use crate::{
    actions::{Action, StartWatch},
    classifier::LogEvent,
    error::{Error, Result},
    meter::MeterInfo,
    robot::{ButtonAction, ButtonPress, RobotEvents},
    shared::SharedState,
};

const ID: &str = "robot_keypad";

/// The buttons a robot can press on a meter, going by its firmware inventory.
///
/// The round keypad's `center` is left out, pressing it resets the meter's display.
pub fn default_buttons(meter: &MeterInfo) -> Vec<String> {
    let mut buttons = vec![];

    if meter.has_firmware("KEY_PAD_2") {
        buttons.extend(
            [
                "1", "2", "3", "4", "5", "ASTERISK", "6", "7", "8", "9", "0", "POUND", "A", "B",
                "C", "D", "E", "F", "G", "H", "I", "J", "K", "L", "M", "N", "O", "P", "Q", "R",
                "S", "T", "U", "V", "W", "X", "BACK", "Y", "Z", "ENTER",
            ]
            .map(String::from),
        );
    }

    let meter_type = meter.meter_type.to_lowercase();
    if meter.has_firmware("KBD_CONTROLLER") && (meter_type == "ms2.5" || meter_type == "ms3") {
        buttons.extend(["help", "up", "down", "cancel", "accept", "max"].map(String::from));
    }

    buttons
}

/// Settings for [`RobotKeypadMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RobotKeypadConfig {
    /// The buttons the robot will press. Empty means [`default_buttons`].
    pub buttons: Vec<String>,

    /// How often each button must be seen.
    pub count: u32,

    /// Longest allowed pause between key presses in the log.
    pub inactivity_timeout_s: f64,

    /// How long the meter may take to log a press once the robot starts pressing.
    pub per_button_timeout_s: f64,

    /// Whether auto-repeat presses are ignored.
    pub ignore_repeats: bool,

    /// How often robot events are polled.
    pub poll_interval_ms: u64,
}

impl Default for RobotKeypadConfig {
    fn default() -> Self {
        Self {
            buttons: vec![],
            count: 1,
            inactivity_timeout_s: 30.0,
            per_button_timeout_s: 20.0,
            ignore_repeats: true,
            poll_interval_ms: 300,
        }
    }
}

type ButtonWatches = Arc<Mutex<HashMap<String, String>>>;

/// Disarm a button's watch, if armed.
///
/// Both the poller and the log side queue their button watch actions while holding the lock,
/// so the listener always sees a watch started before it is cancelled.
fn disarm(watches: &ButtonWatches, shared: &SharedState, button: &str) -> bool {
    let mut watches = watches.lock().unwrap_or_else(PoisonError::into_inner);

    match watches.remove(button) {
        Some(key) => {
            shared.queue_action(ID, Action::cancel(&key));
            true
        }
        None => false,
    }
}

/// Follows the robot's events, queueing actions with the listener.
struct RobotPoller {
    robot: Arc<dyn RobotEvents>,
    shared: Arc<SharedState>,
    watches: ButtonWatches,
    expected: Vec<String>,
    timeout: Duration,
}

impl RobotPoller {
    fn check_events(&self) {
        while let Some(ButtonPress {
            button_name,
            action,
        }) = self.robot.try_take_button_press()
        {
            let button = normalize(&button_name);
            if !self.expected.contains(&button) {
                debug!(%button_name, "Ignoring unexpected button");
                continue;
            }

            match action {
                ButtonAction::Pressing => {
                    debug!(%button_name, "Robot started pressing, arming");

                    let key = format!(
                        "{ID}:button:{button}:{}",
                        chrono::Utc::now().timestamp_millis()
                    );

                    let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(dangling) = watches.insert(button, key.clone()) {
                        self.shared.queue_action(ID, Action::cancel(&dangling));
                    }

                    self.shared.queue_action(
                        ID,
                        StartWatch::critical(
                            &key,
                            self.timeout,
                            ID,
                            &format!(
                                "Robot pressing '{button_name}' but the meter did not see this button pressed in the logs within {:.1}s",
                                self.timeout.as_secs_f64()
                            ),
                        )
                        .into(),
                    );
                }
                ButtonAction::Pressed {
                    pressed: Some(false),
                } => {
                    debug!(%button_name, "Robot failed to press, disarming");
                    disarm(&self.watches, &self.shared, &button);
                }
                ButtonAction::Pressed { .. } => {
                    // The meter's log will cancel the watch.
                    debug!(%button_name, "Robot pressed, waiting for the meter");
                }
            }
        }
    }

    async fn run(self, poll_interval: Duration, cancel: CancellationToken) {
        debug!("Started");

        loop {
            if self.shared.stop.is_set() || self.shared.end_listener.is_set() {
                break;
            }

            self.check_events();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.stop.wait() => break,
                _ = self.shared.end_listener.wait() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        debug!("Exited");
    }
}

/// See the module level docs.
///
/// Must be created within a tokio runtime.
/// Dropping the monitor ends its background task.
pub struct RobotKeypadMonitor {
    timeout: Duration,
    ignore_repeats: bool,
    tally: KeyTally,
    watches: ButtonWatches,
    shared: Arc<SharedState>,
    gap_key: Option<String>,
    succeeded: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RobotKeypadMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotKeypadMonitor")
            .field("tally", &self.tally)
            .field("gap_key", &self.gap_key)
            .field("succeeded", &self.succeeded)
            .finish_non_exhaustive()
    }
}

impl RobotKeypadMonitor {
    /// A new monitor, and its background task.
    pub fn new(
        config: &RobotKeypadConfig,
        meter: &MeterInfo,
        shared: Arc<SharedState>,
        robot: Arc<dyn RobotEvents>,
    ) -> Result<Self> {
        let kind = MonitorKind::RobotKeypad;
        let timeout = seconds(kind, "inactivity_timeout_s", config.inactivity_timeout_s)?;
        let per_button = seconds(kind, "per_button_timeout_s", config.per_button_timeout_s)?;

        let buttons = if config.buttons.is_empty() {
            default_buttons(meter)
        } else {
            config.buttons.clone()
        };

        let expected = buttons
            .iter()
            .map(|button| normalize(button))
            .filter(|button| !button.is_empty())
            .collect::<Vec<_>>();

        if expected.is_empty() {
            return Err(Error::BadMonitorConfig {
                monitor: kind.to_string(),
                problem: "at least one button must be provided".into(),
            });
        }

        info!(
            buttons = expected.len(),
            count = config.count.max(1),
            "Robot keypad test"
        );

        let watches = ButtonWatches::default();
        let cancel = CancellationToken::new();

        let poller = RobotPoller {
            robot,
            shared: shared.clone(),
            watches: watches.clone(),
            expected: expected.clone(),
            timeout: per_button,
        };
        tokio::spawn(
            poller
                .run(Duration::from_millis(config.poll_interval_ms), cancel.clone())
                .instrument(tracing::info_span!("robot poller")),
        );

        Ok(Self {
            timeout,
            ignore_repeats: config.ignore_repeats,
            tally: KeyTally::new(expected, config.count),
            watches,
            shared,
            gap_key: None,
            succeeded: false,
            cancel,
        })
    }

    /// End the background task. Also done on drop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn arm_gap(&mut self, ts: i64) -> Vec<Action> {
        let mut actions = vec![];
        if let Some(previous) = self.gap_key.take() {
            actions.push(Action::cancel(&previous));
        }

        let key = format!("{ID}:gap:{ts}");
        self.gap_key = Some(key.clone());

        actions.push(
            StartWatch::critical(
                &key,
                self.timeout,
                ID,
                &format!("No keypad activity for {:.0}s", self.timeout.as_secs_f64()),
            )
            .into(),
        );
        actions
    }
}

impl Drop for RobotKeypadMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Monitor for RobotKeypadMonitor {
    fn id(&self) -> &str {
        ID
    }

    fn interested(&self, message: &str) -> bool {
        message.to_lowercase().contains("key_pressed:")
    }

    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>> {
        let Some(press) = KeyPress::parse(&event.message) else {
            return Ok(vec![]);
        };

        if self.ignore_repeats && press.auto_repeat {
            debug!(key = %press.key, "Ignoring auto-repeat");
            return Ok(vec![]);
        }
        if !press.from_keypad() || self.succeeded {
            return Ok(vec![]);
        }

        let mut actions = self.arm_gap(event.epoch_seconds());

        if !self.tally.expects(&press.key) {
            return Ok(actions);
        }

        let seen = self.tally.count(&press.key);
        debug!(key = %press.key, "#{seen}/{}", self.tally.required());

        if disarm(&self.watches, &self.shared, &press.key) {
            debug!(key = %press.key, "Meter confirmed the robot's press");
        }

        if self.tally.complete() {
            info!("All buttons seen");
            self.succeeded = true;
            if let Some(gap) = self.gap_key.take() {
                actions.push(Action::cancel(&gap));
            }
            actions.push(Action::MarkSuccess {
                device: ID.into(),
                message: "All keys successfully pressed by robot".into(),
            });
        }

        Ok(actions)
    }
}
