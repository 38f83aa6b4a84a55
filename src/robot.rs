//! Events from the robot that presses a meter's buttons.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// What the robot did to a button.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ButtonAction {
    /// The robot started pressing.
    Pressing,

    /// The robot is done pressing.
    Pressed {
        /// Whether the robot thinks it managed to.
        /// Absent means it did not say.
        #[serde(default)]
        pressed: Option<bool>,
    },
}

/// A `button_press` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonPress {
    /// The button as the robot names it.
    pub button_name: String,

    /// See [`ButtonAction`].
    #[serde(flatten)]
    pub action: ButtonAction,
}

/// A source of robot events.
pub trait RobotEvents: Send + Sync + std::fmt::Debug {
    /// Take the oldest button press not yet taken, if any. Must not block.
    fn try_take_button_press(&self) -> Option<ButtonPress>;
}

/// Robot events kept in memory, fed by whoever talks to the robot.
///
/// Only the most recent events are kept.
#[derive(Debug)]
pub struct RobotEventQueue {
    events: Mutex<VecDeque<ButtonPress>>,
    capacity: usize,
}

impl Default for RobotEventQueue {
    fn default() -> Self {
        Self::new(15)
    }
}

impl RobotEventQueue {
    /// A queue keeping at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Add a button press. The oldest is dropped if full.
    pub fn push(&self, press: ButtonPress) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        if events.len() >= self.capacity {
            if let Some(dropped) = events.pop_front() {
                warn!(?dropped, "Robot event queue full, dropping oldest");
            }
        }
        events.push_back(press);
    }

    /// Add an event as the robot sends it, e.g.
    /// `{"type": "event", "event": "button_press", "data": {"button_name": "1", "action": "pressing"}}`.
    ///
    /// Events other than button presses are ignored.
    pub fn push_message(&self, message: &serde_json::Value) -> Result<()> {
        if message["type"] != "event" || message["event"] != "button_press" {
            debug!(%message, "Not a button press");
            return Ok(());
        }

        let press = serde_json::from_value(message["data"].clone())
            .map_err(|e| Error::Robot(format!("bad button press `{message}`: {e}")))?;
        self.push(press);

        Ok(())
    }

    /// Forget all events.
    pub fn flush(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// How many events are waiting.
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RobotEvents for RobotEventQueue {
    fn try_take_button_press(&self) -> Option<ButtonPress> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
