use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// No test program by that name (or alias) exists.
    #[error("Unknown program: `{0}`")]
    UnknownProgram(String),

    /// No monitor kind by that name exists.
    #[error("Unknown monitor: `{0}`")]
    UnknownMonitor(String),

    /// No meter with that id is configured.
    #[error("The meter `{0}` does not exist")]
    NoSuchMeter(String),

    /// The configuration is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A monitor could not be built from the given settings.
    #[error("Bad monitor configuration for `{monitor}`: {problem}")]
    BadMonitorConfig {
        /// Which monitor.
        monitor: String,

        /// What is wrong with it.
        problem: String,
    },

    /// A monitor failed to handle an event.
    #[error("Monitor `{monitor}` failed: {problem}")]
    Monitor {
        /// Which monitor.
        monitor: String,

        /// What went wrong.
        problem: String,
    },

    /// The log stream could not be opened or broke while reading.
    #[error("Log transport problem: {0}")]
    Transport(String),

    /// The meter's control channel failed.
    #[error("Meter control problem: {0}")]
    Meter(String),

    /// The robot sent something we don't understand.
    #[error("Robot problem: {0}")]
    Robot(String),

    /// Persisting a job failed.
    #[error("Could not store job: {0}")]
    Store(String),

    /// A test routine failed.
    #[error("Routine failed: {0}")]
    Routine(String),

    /// Underlying IO problem.
    #[error("IO problem: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl Error {
    /// Turn into the inner bad configuration message, if that's what this is.
    pub fn try_into_bad_config(self) -> std::result::Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, Error>;
