//! Mocks, useful to run jobs without a meter.
//!
//! [`MockTransport`] is a loopback: lines sent to a host's mock log
//! come out of any stream opened for that host.
//! [`MockMeter`] records what it was asked to do.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, trace, warn};

use crate::{
    error::{Error, Result},
    meter::{Meter, MeterInfo},
    transport::{LogStream, LogTransport},
};

type MockLine = std::result::Result<String, Error>;

/// See the module level docs.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    logs: Arc<Mutex<HashMap<String, broadcast::Sender<MockLine>>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

impl MockTransport {
    /// A transport with no logs yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, host: &str) -> broadcast::Sender<MockLine> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_owned())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Put text on a host's log. Several lines are split up.
    ///
    /// Lines sent while nobody is tailing are lost, like on a real meter.
    pub fn send(&self, host: &str, text: &str) {
        let sender = self.sender(host);

        for line in text.lines() {
            match sender.send(Ok(line.to_owned())) {
                Ok(listeners) => trace!("Sent line to {listeners} listener(s)"),
                Err(_) => trace!(host, "Nobody tailing"),
            }
        }
    }

    /// End every stream open for a host, like a dropped connection.
    /// Streams opened later work again.
    pub fn hang_up(&self, host: &str) {
        info!(host, "Hanging up mock log");
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host);
    }

    /// Make every stream open for a host yield an error.
    pub fn fail(&self, host: &str, problem: &str) {
        // Nobody tailing is fine.
        let _ = self
            .sender(host)
            .send(Err(Error::Transport(problem.to_owned())));
    }

    /// How many streams are open for a host.
    pub fn listeners(&self, host: &str) -> usize {
        self.sender(host).receiver_count()
    }

    /// Wait until someone tails the host's log.
    pub async fn wait_for_listener(&self, host: &str) {
        while self.listeners(host) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Make opening a host's log fail.
    pub fn set_unreachable(&self, host: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_owned());
    }
}

#[async_trait]
impl LogTransport for MockTransport {
    async fn open(&self, host: &str, user: &str) -> Result<LogStream> {
        if self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(host)
        {
            return Err(Error::Transport(format!("{user}@{host} is unreachable")));
        }

        info!(host, "Tailing mock log");
        let stream = BroadcastStream::new(self.sender(host).subscribe()).filter_map(|item| async move {
            match item {
                Ok(line) => Some(line),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Mock log lagging, lost {n} line(s)");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// See the module level docs.
pub struct MockMeter {
    id: String,
    hostname: String,
    info: MeterInfo,
    db_id: Option<i64>,
    triggers: Mutex<Vec<String>>,
    beeps: Mutex<Vec<u32>>,
    on_trigger: Mutex<Option<TriggerHook>>,
}

impl std::fmt::Debug for MockMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMeter")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("db_id", &self.db_id)
            .finish_non_exhaustive()
    }
}

impl MockMeter {
    /// A meter at `id` with the given modules.
    pub fn new(id: &str, info: MeterInfo) -> Self {
        Self {
            id: id.to_owned(),
            hostname: format!("mock-{id}"),
            info,
            db_id: None,
            triggers: Mutex::default(),
            beeps: Mutex::default(),
            on_trigger: Mutex::default(),
        }
    }

    /// Store job records under this id.
    pub fn with_db_id(mut self, db_id: i64) -> Self {
        self.db_id = Some(db_id);
        self
    }

    /// Run something on every trigger, e.g. put lines on a [`MockTransport`].
    /// An error fails the trigger.
    pub fn on_trigger(&self, f: impl Fn(&str) -> Result<()> + Send + 'static) {
        *self
            .on_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    /// Devices triggered so far, in order.
    pub fn triggers(&self) -> Vec<String> {
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Beeps so far, one entry per call.
    pub fn beeps(&self) -> Vec<u32> {
        self.beeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type TriggerHook = Box<dyn Fn(&str) -> Result<()> + Send>;

#[async_trait]
impl Meter for MockMeter {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self) -> &str {
        &self.id
    }

    fn user(&self) -> &str {
        "mock"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn info(&self) -> MeterInfo {
        self.info.clone()
    }

    fn db_id(&self) -> Option<i64> {
        self.db_id
    }

    async fn trigger(&self, device: &str) -> Result<()> {
        trace!(device, "Mock trigger");
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(device.to_owned());

        match &*self
            .on_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(hook) => hook(device),
            None => Ok(()),
        }
    }

    async fn beep(&self, count: u32) -> Result<()> {
        self.beeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn loopback() {
        let mock = MockTransport::new();
        let mut rx = mock.open("meter", "root").await.unwrap();

        mock.send("meter", "Hi");

        assert_eq!(rx.next().await.unwrap().unwrap(), "Hi");
    }

    #[tokio::test]
    async fn lines_before_open_are_lost() {
        let mock = MockTransport::new();

        mock.send("meter", "early");
        let mut rx = mock.open("meter", "root").await.unwrap();
        mock.send("meter", "late");

        assert_eq!(rx.next().await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn newlines_are_split_up() {
        let mock = MockTransport::new();
        let mut rx = mock.open("meter", "root").await.unwrap();

        mock.send(
            "meter",
            "This is a
message with a newline
or two.",
        );

        for line in ["This is a", "message with a newline", "or two."] {
            assert_eq!(rx.next().await.unwrap().unwrap(), line);
        }
    }

    #[tokio::test]
    async fn hosts_are_separate() {
        let mock = MockTransport::new();
        let mut a = mock.open("a", "root").await.unwrap();
        let _b = mock.open("b", "root").await.unwrap();

        assert_eq!(mock.listeners("b"), 1);

        mock.send("b", "for b");
        mock.send("a", "for a");

        assert_eq!(a.next().await.unwrap().unwrap(), "for a");
    }

    #[tokio::test]
    async fn hang_up_ends_streams() {
        let mock = MockTransport::new();
        let mut rx = mock.open("meter", "root").await.unwrap();

        mock.send("meter", "last words");
        mock.hang_up("meter");

        assert_eq!(rx.next().await.unwrap().unwrap(), "last words");
        assert!(rx.next().await.is_none());
        assert_eq!(mock.listeners("meter"), 0);
    }

    #[tokio::test]
    async fn failures_reach_the_stream() {
        let mock = MockTransport::new();
        let mut rx = mock.open("meter", "root").await.unwrap();

        mock.fail("meter", "broken pipe");

        assert!(matches!(rx.next().await, Some(Err(Error::Transport(_)))));
    }

    #[tokio::test]
    async fn unreachable() {
        let mock = MockTransport::new();
        mock.set_unreachable("meter");

        assert!(matches!(
            mock.open("meter", "root").await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn meter_records() {
        let meter = MockMeter::new("10.0.0.1", MeterInfo::default());
        meter.on_trigger(|device| {
            if device == "modem" {
                Err(Error::Meter("no modem".into()))
            } else {
                Ok(())
            }
        });

        meter.trigger("printer").await.unwrap();
        assert!(meter.trigger("modem").await.is_err());
        meter.beep(3).await.unwrap();

        assert_eq!(meter.triggers(), vec!["printer", "modem"]);
        assert_eq!(meter.beeps(), vec![3]);
    }
}
