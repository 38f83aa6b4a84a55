use std::{
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use super::{LogLineCodec, LogStream, LogTransport};
use crate::error::{Error, Result};

/// Runs a command which prints the meter's log, one line at a time, e.g.
/// `ssh {user}@{host} journalctl -u MS3_Platform.service -f -n0 -o json`.
///
/// `{host}` and `{user}` in the arguments are filled in on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTransport {
    /// The program to run.
    pub program: String,

    /// Its arguments.
    pub args: Vec<String>,
}

impl Default for CommandTransport {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
            args: [
                "-o",
                "BatchMode=yes",
                "{user}@{host}",
                "journalctl",
                "-u",
                "MS3_Platform.service",
                "-f",
                "-n0",
                "-o",
                "json",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl CommandTransport {
    /// The arguments with placeholders filled in.
    pub fn args_for(&self, host: &str, user: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{host}", host).replace("{user}", user))
            .collect()
    }
}

/// The lines a child process prints.
/// The child is killed when this is dropped.
struct ChildLines {
    _child: Child,
    lines: FramedRead<ChildStdout, LogLineCodec>,
}

impl Stream for ChildLines {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.lines).poll_next(cx)
    }
}

#[async_trait]
impl LogTransport for CommandTransport {
    async fn open(&self, host: &str, user: &str) -> Result<LogStream> {
        let args = self.args_for(host, user);
        info!(program = %self.program, ?args, "Tailing log");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("could not start `{}`: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("no stdout from log command".into()))?;

        debug!(pid = ?child.id(), "Log command running");

        Ok(Box::pin(ChildLines {
            _child: child,
            lines: FramedRead::new(stdout, LogLineCodec::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn placeholders() {
        let transport = CommandTransport::default();

        let args = transport.args_for("10.0.0.7", "root");

        assert!(args.contains(&"root@10.0.0.7".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lines_from_a_command() {
        let transport = CommandTransport {
            program: "sh".into(),
            args: vec!["-c".into(), "echo first {host}; echo second".into()],
        };

        let lines = transport
            .open("meter", "root")
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(lines, vec!["first meter", "second"]);
    }

    #[tokio::test]
    async fn missing_program() {
        let transport = CommandTransport {
            program: "surely-this-program-does-not-exist".into(),
            args: vec![],
        };

        assert!(matches!(
            transport.open("meter", "root").await,
            Err(Error::Transport(_))
        ));
    }
}
