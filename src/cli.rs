use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    classifier,
    config::Config,
    error::{Error, Result},
    jobs::JobStatusReport,
    program::Kwargs,
};

/// The command line interface for meter EOL.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Log debug output too
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a program on a configured meter and wait for the result.
    Run {
        /// The meter's id, as configured.
        meter: String,

        /// The program, e.g. `cycle_print` or `all tests`.
        program: String,

        /// Job arguments as a JSON object, e.g. `{"count": 2}`.
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// Classify the lines of a saved log, marking noise.
    Classify {
        /// The log file.
        file: PathBuf,
    },
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON job status.
    JobStatus,
}

/// Parse job arguments given on the command line.
pub fn parse_kwargs(kwargs: Option<&str>) -> Result<Kwargs> {
    let Some(kwargs) = kwargs else {
        return Ok(Kwargs::new());
    };

    match serde_json::from_str(kwargs) {
        Ok(serde_json::Value::Object(kwargs)) => Ok(kwargs),
        Ok(other) => Err(Error::BadConfig(format!(
            "job arguments must be a JSON object, got `{other}`"
        ))),
        Err(e) => Err(Error::BadConfig(format!("job arguments are not JSON: {e}"))),
    }
}

/// Print an example.
pub fn handle_example(example: Examples) -> Result<()> {
    match example {
        Examples::Config => println!("{}", Config::example().serialize_pretty()?),
        Examples::JobStatus => println!(
            "{}",
            serde_json::to_string_pretty(&JobStatusReport::example())
                .map_err(|e| Error::BadConfig(e.to_string()))?
        ),
    }

    Ok(())
}

/// Classify a saved log, one line of output per parsed line.
pub fn classify_text(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(classifier::classify)
        .map(|event| {
            let marker = if event.is_noise() { "noise" } else { "     " };
            format!("{marker} {} {}", event.source_host, event)
        })
        .collect()
}
