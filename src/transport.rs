use std::{fmt::Debug, pin::Pin};

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;

/// The codec splitting a byte stream into log lines.
pub mod lines;

/// Tailing a log by running a command.
pub mod command;

pub use command::CommandTransport;
pub use lines::LogLineCodec;

/// A live log line stream. Infinite unless the remote end goes away.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Somewhere to get a meter's live system log from.
#[async_trait]
pub trait LogTransport: Send + Sync + Debug {
    /// Start tailing the log of the meter at `host`, logging in as `user`.
    ///
    /// Only lines logged after this returns are expected on the stream.
    async fn open(&self, host: &str, user: &str) -> Result<LogStream>;
}
