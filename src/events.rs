use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::broadcast;
use tracing::debug;

/// What an event is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// A meter became busy or ready.
    Status,

    /// Per-device results of a job.
    Devices,

    /// Progress through a test program.
    Progress,

    /// A job's record once it is done.
    Job,
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Status => write!(f, "status"),
            Topic::Devices => write!(f, "devices"),
            Topic::Progress => write!(f, "progress"),
            Topic::Job => write!(f, "job"),
        }
    }
}

/// An event, and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampedEvent {
    /// See [`Topic`].
    pub topic: Topic,

    /// Free-form payload for observers.
    pub payload: serde_json::Value,

    /// When the event happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TimestampedEvent {
    /// Create a new event stamped now.
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            payload,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Display for TimestampedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.topic, self.payload)
    }
}

#[derive(Debug)]
struct Inner {
    log: Mutex<VecDeque<TimestampedEvent>>,
    log_size: usize,
    tx: broadcast::Sender<TimestampedEvent>,
}

/// An event logger and broadcaster.
///
/// Fire and forget: nobody has to be listening.
/// Cheap to clone, all clones share the same channel and log.
#[derive(Debug, Clone)]
pub struct Events(Arc<Inner>);

impl Default for Events {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Events {
    /// Create a new events handler.
    /// It will keep a log of at most `log_size` events.
    /// It may be subscribed to to receive any events it sees.
    pub fn new(log_size: usize) -> Self {
        let (tx, _) = broadcast::channel(256);

        Self(Arc::new(Inner {
            log: Mutex::new(VecDeque::new()),
            log_size,
            tx,
        }))
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.0.tx.subscribe()
    }

    /// Send an event. This will append it to the log and broadcast it to any subscribers.
    pub fn send_event(&self, event: TimestampedEvent) {
        debug!(%event, "Broadcasting event");

        {
            let mut log = self.0.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.push_front(event.clone());

            // Truncate removes from the back, which means older events are split off first.
            log.truncate(self.0.log_size);
        }

        // No receivers is fine.
        let _ = self.0.tx.send(event);
    }

    /// Send a payload under some topic. See [`Events::send_event`].
    pub fn broadcast(&self, topic: Topic, payload: serde_json::Value) {
        self.send_event(TimestampedEvent::new(topic, payload))
    }

    /// The most recent events, newest first.
    pub fn recent(&self) -> Vec<TimestampedEvent> {
        self.0
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
