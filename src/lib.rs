#![deny(missing_docs)]

//! This crate runs end-of-line tests of payment meters.
//!
//! A job runs a test program against one meter.
//! While the program's routine drives the meter (print a ticket, power the NFC reader, ...),
//! the meter's system log is tailed and every line is classified.
//! Monitors, one per kind of device, follow the log and arm watchdogs when the meter
//! is asked to do something, and cancel them once it reports having done it.
//! A watchdog which expires fails the device, and a critical one stops the job.
//!
//! Only one job may run per meter.
//! The meter's log is shared by all its devices, so an allow-list decides whose monitors
//! get to act at any moment.

/// The actions monitors ask for, and the faults expired watchdogs raise.
pub mod actions;

/// Log line classification.
pub mod classifier;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Events for observers: status, results and progress.
pub mod events;

/// Starting, stopping and supervising jobs.
pub mod jobs;

/// The per-job log listener.
pub mod listener;

/// Logging/tracing setup.
pub mod logging;

/// The meters under test.
pub mod meter;

/// Mocked meters and logs.
pub mod mock;

/// Per-device log monitors.
pub mod monitor;

/// Test programs.
pub mod program;

/// Robot events.
pub mod robot;

/// Per-job shared state.
pub mod shared;

/// Job persistence.
pub mod store;

/// Getting a meter's live log.
pub mod transport;

/// Cancelable timeouts.
pub mod watchdog;
