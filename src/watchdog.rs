//! Cancelable timeouts keyed by opaque strings.
//!
//! Deadlines live in a min-heap.
//! Cancelling only forgets the key; the heap entry goes stale and is
//! discarded when it is eventually popped.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use tokio::time::Instant;

use crate::actions::{DeviceId, Fault, Severity, StartWatch};

/// A pending timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deadline {
    /// When it fires.
    pub when: Instant,

    /// See [`StartWatch::key`].
    pub key: String,

    /// See [`StartWatch::device`].
    pub device: DeviceId,

    /// See [`StartWatch::on_timeout_message`].
    pub message: String,

    /// See [`Severity`].
    pub severity: Severity,
}

impl Deadline {
    /// The deadline a watch describes, counting from `now`.
    pub fn from_watch(watch: &StartWatch, now: Instant) -> Self {
        Self {
            when: now + watch.timeout,
            key: watch.key.clone(),
            device: watch.device.clone(),
            message: watch.on_timeout_message.clone(),
            severity: watch.severity,
        }
    }

    fn into_fault(self) -> Fault {
        Fault {
            device: self.device,
            severity: self.severity,
            message: self.message,
        }
    }
}

// Ordered by time, ties broken by arming order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    when: Instant,
    generation: u64,
    key: String,
}

/// The watchdog registry.
#[derive(Debug, Default)]
pub struct Watchdog {
    heap: BinaryHeap<Reverse<HeapEntry>>,

    // key -> (generation, deadline).
    // A heap entry whose generation does not match is stale.
    active: HashMap<String, (u64, Deadline)>,

    generation: u64,
}

impl Watchdog {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline.
    ///
    /// Callers cancel a key before re-arming it. If they don't,
    /// the newest deadline for the key wins.
    pub fn start(&mut self, deadline: Deadline) {
        self.generation += 1;

        self.heap.push(Reverse(HeapEntry {
            when: deadline.when,
            generation: self.generation,
            key: deadline.key.clone(),
        }));
        self.active
            .insert(deadline.key.clone(), (self.generation, deadline));
    }

    /// Disarm a deadline. A no-op for unknown or already fired keys.
    /// Returns whether something was disarmed.
    pub fn cancel(&mut self, key: &str) -> bool {
        self.active.remove(key).is_some()
    }

    /// Whether the key is armed.
    pub fn is_armed(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// How many deadlines are armed.
    pub fn armed(&self) -> usize {
        self.active.len()
    }

    /// Pop every deadline at or before `now`.
    /// Cancelled ones are discarded, the rest become [`Fault`]s in deadline order.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Fault> {
        let mut faults = vec![];

        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.when > now {
                break;
            }

            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };

            let is_current = self
                .active
                .get(&entry.key)
                .map_or(false, |(generation, _)| *generation == entry.generation);

            if is_current {
                if let Some((_, deadline)) = self.active.remove(&entry.key) {
                    faults.push(deadline.into_fault());
                }
            }
        }

        faults
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.active.clear();
    }
}
