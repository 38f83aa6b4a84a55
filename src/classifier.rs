//! Turns raw lines from a meter's system log into [`LogEvent`]s.
//!
//! Two formats are understood.
//! The journal's JSON export (one object per line) is tried first,
//! then a syslog style `Mon DD HH:MM:SS host MS3[pid]: message` line.
//! Anything else is dropped.

use std::fmt::Display;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+\s+\d+\s+\d+:\d+:\d+)\s+(\S+)\s+MS3\[\d+\]:\s*(.*)")
        .expect("syslog pattern is valid")
});

// Recurring chatter which is never interesting in a job log.
static NOISE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^WebKitLib:WebKitSetURL:\d+: URL=http://127\.0\.0\.1:8005/UIPage\.php",
        r"^WebKitLib:WebKitRefresh:\d+: Refresh",
        r"^MS3Queue:MS3QGetAndProcessMessage:\d+: Got type=(?:IPSBUS|TIMER|SAGENT)",
        r"^MS3Queue:MS3QGetAndProcessMessage:.*Unhandled message: IPSBUS",
        r"^TimerLib:TimerSetTimer:\d+: Set ref=",
        r"^TimerLib:sTimerWorkerThread:\d+: Expired ref=",
        r"^UXAppUtils:UXLog:\d+: *-> *UXAppDrawDisplay",
        r"^UXAppUtils:UXLog:\d+: *<- *UXMeterInvalidateAppDisplay",
        r"^UXAppUtils:UXLog:\d+: *<- *UXMeterGetTime:",
        r"^MS3:sSigThreadMain:\d+: Caught signal 17 \(Child exited\)",
        r"^MS3:sSigThreadMain:\d+: Caught and ignore SIGCHLD",
    ])
    .expect("noise patterns are valid")
});

/// A single classified line of the meter's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    /// When the meter logged the line.
    pub timestamp: DateTime<Utc>,

    /// The payload, with any log source prefix stripped.
    pub message: String,

    /// The line as it arrived.
    pub raw_line: String,

    /// The host which produced the line, if known.
    pub source_host: String,
}

impl Display for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.human())
    }
}

impl LogEvent {
    /// A new event stamped with the current time.
    pub fn now(message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.to_owned(),
            raw_line: message.to_owned(),
            source_host: String::new(),
        }
    }

    /// Seconds since the epoch at which the line was logged.
    /// Monitors use this to build watch keys.
    pub fn epoch_seconds(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// The form written to job logs: the message on a single line.
    pub fn human(&self) -> String {
        self.message.replace('\n', " ").trim().to_owned()
    }

    /// Whether this is recurring chatter which should not be persisted.
    /// Noisy events are still handed to monitors.
    pub fn is_noise(&self) -> bool {
        NOISE.is_match(self.message.trim())
    }
}

#[derive(Debug, Deserialize)]
struct JournalRecord {
    #[serde(rename = "__REALTIME_TIMESTAMP", default)]
    realtime_timestamp: Option<serde_json::Value>,

    #[serde(rename = "_HOSTNAME", default)]
    hostname: Option<serde_json::Value>,

    #[serde(rename = "MESSAGE", default)]
    message: Option<serde_json::Value>,
}

// journald writes fields that aren't valid UTF-8 as arrays of bytes.
fn as_text(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Array(items)) => {
            let bytes = items
                .iter()
                .filter_map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Vec<_>>();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => String::new(),
    }
}

fn from_micros(value: Option<serde_json::Value>) -> Option<DateTime<Utc>> {
    let micros = match value? {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };

    Utc.timestamp_micros(micros).single()
}

// Syslog dates carry no year, assume the current one.
fn from_syslog_date(date: &str) -> Option<DateTime<Utc>> {
    let date = date.split_whitespace().collect::<Vec<_>>().join(" ");
    let with_year = format!("{} {date}", Utc::now().year());

    NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn classify_json(line: &str) -> Option<LogEvent> {
    let record = serde_json::from_str::<JournalRecord>(line).ok()?;

    Some(LogEvent {
        timestamp: from_micros(record.realtime_timestamp).unwrap_or_else(Utc::now),
        message: as_text(record.message),
        raw_line: line.to_owned(),
        source_host: as_text(record.hostname),
    })
}

fn classify_syslog(line: &str) -> Option<LogEvent> {
    let captures = SYSLOG_LINE.captures(line)?;

    Some(LogEvent {
        timestamp: from_syslog_date(&captures[1]).unwrap_or_else(Utc::now),
        message: captures[3].to_owned(),
        raw_line: line.to_owned(),
        source_host: captures[2].to_owned(),
    })
}

/// Classify a raw line.
/// Returns `None` if the line is in neither known format, which is not an error.
pub fn classify(line: &str) -> Option<LogEvent> {
    let line = line.trim_end_matches(['\r', '\n']);

    classify_json(line).or_else(|| classify_syslog(line))
}
