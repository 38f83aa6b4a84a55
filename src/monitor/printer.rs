//! Checks that every print request gets a ticket reply in time.

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

static PRINT_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)IPSBusDevSendPrintMessageVA").expect("print request pattern is valid")
});

static TICKET_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)PRINT_TICKET_REPLY:.*result=([A-Z]+)").expect("ticket reply pattern is valid")
});

static STATUS_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)PRINTER_STATUS_REPLY:").expect("status reply pattern is valid")
});

/// Settings for [`PrinterMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrinterConfig {
    /// How long a ticket may take.
    pub timeout_s: f64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self { timeout_s: 8.0 }
    }
}

/// Arms a watch when a ticket is sent to the printer,
/// and cancels it when the printer replies.
///
/// A `PENDING` reply counts as a failure and faults immediately.
#[derive(Debug)]
pub struct PrinterMonitor {
    timeout: Duration,
    job_key: Option<String>,
}

impl PrinterMonitor {
    const ID: &'static str = "printer";

    /// A new monitor.
    pub fn new(config: &PrinterConfig) -> Result<Self> {
        Ok(Self {
            timeout: seconds(MonitorKind::Printer, "timeout_s", config.timeout_s)?,
            job_key: None,
        })
    }
}

impl Monitor for PrinterMonitor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn interested(&self, message: &str) -> bool {
        message.to_lowercase().contains("print")
    }

    fn handle(&mut self, event: &LogEvent) -> Result<Vec<Action>> {
        let message = &event.message;

        if PRINT_REQUEST.is_match(message) {
            let key = format!("{}:{}", Self::ID, event.epoch_seconds());
            debug!(%key, "Print requested, arming");
            self.job_key = Some(key.clone());

            return Ok(vec![StartWatch::critical(
                &key,
                self.timeout,
                Self::ID,
                &format!("Print timed out after {:.1}s", self.timeout.as_secs_f64()),
            )
            .into()]);
        }

        if let Some(captures) = TICKET_REPLY.captures(message) {
            // Replies nobody asked for are none of our business.
            let Some(key) = self.job_key.clone() else {
                return Ok(vec![]);
            };

            let result = captures[1].to_uppercase();
            let mut actions = vec![Action::cancel(&key)];

            match result.as_str() {
                "SUCCEEDED" => debug!(%key, "Ticket printed"),
                "PENDING" => {
                    debug!(%key, "Ticket pending, faulting now");
                    actions.push(
                        StartWatch::critical(
                            &format!("{}:fail:{}", Self::ID, event.epoch_seconds()),
                            Duration::ZERO,
                            Self::ID,
                            "Printer returned PENDING (failure).",
                        )
                        .into(),
                    );
                }
                other => debug!(%key, result = other, "Unknown ticket result"),
            }

            return Ok(actions);
        }

        if STATUS_REPLY.is_match(message) {
            // Status replies don't affect any watch.
            return Ok(vec![]);
        }

        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn printer() -> PrinterMonitor {
        PrinterMonitor::new(&PrinterConfig::default()).unwrap()
    }

    fn start_key(actions: &[Action]) -> String {
        match &actions[0] {
            Action::StartWatch(watch) => watch.key.clone(),
            other => panic!("expected a watch, got {other:?}"),
        }
    }

    #[test]
    fn interest() {
        let p = printer();

        assert!(p.interested("IPSBusDevSendPrintMessageVA: ..."));
        assert!(p.interested("PRINT_TICKET_REPLY: result=SUCCEEDED"));
        assert!(!p.interested("MODEM: SendRemote: CMD.CONNECT"));
    }

    #[test]
    fn request_then_success_cancels() {
        let mut p = printer();

        let actions = p
            .handle(&LogEvent::now("IPSBusDevSendPrintMessageVA: sending"))
            .unwrap();
        assert_eq!(actions.len(), 1);
        let key = start_key(&actions);
        assert!(key.starts_with("printer:"));

        let actions = p
            .handle(&LogEvent::now("PRINT_TICKET_REPLY: id=3 result=SUCCEEDED"))
            .unwrap();
        assert_eq!(actions, vec![Action::cancel(&key)]);
    }

    #[test]
    fn pending_faults_immediately() {
        let mut p = printer();

        let key = start_key(
            &p.handle(&LogEvent::now("IPSBusDevSendPrintMessageVA"))
                .unwrap(),
        );

        let actions = p
            .handle(&LogEvent::now("PRINT_TICKET_REPLY: result=PENDING"))
            .unwrap();

        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], Action::cancel(&key));
        match &actions[1] {
            Action::StartWatch(watch) => {
                assert_eq!(watch.timeout, Duration::ZERO);
                assert!(watch.key.starts_with("printer:fail:"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_result_only_cancels() {
        let mut p = printer();

        let key = start_key(
            &p.handle(&LogEvent::now("IPSBusDevSendPrintMessageVA"))
                .unwrap(),
        );

        let actions = p
            .handle(&LogEvent::now("PRINT_TICKET_REPLY: result=JAMMED"))
            .unwrap();

        assert_eq!(actions, vec![Action::cancel(&key)]);
    }

    #[test]
    fn reply_without_request_is_ignored() {
        let mut p = printer();

        assert!(p
            .handle(&LogEvent::now("PRINT_TICKET_REPLY: result=SUCCEEDED"))
            .unwrap()
            .is_empty());
        assert!(p
            .handle(&LogEvent::now("PRINTER_STATUS_REPLY: paper=ok"))
            .unwrap()
            .is_empty());
    }
}
