use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use meter_eol::{
    cli::{self, Commands},
    config::Config,
    events::Events,
    jobs::JobRegistry,
    logging,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    let (meter, program, kwargs) = match cli.command {
        Commands::Examples(example) => {
            cli::handle_example(example)?;
            return Ok(());
        }
        Commands::Classify { file } => {
            let text = std::fs::read_to_string(file)?;
            for line in cli::classify_text(&text) {
                println!("{line}");
            }
            return Ok(());
        }
        Commands::Run {
            meter,
            program,
            kwargs,
        } => (meter, program, cli::parse_kwargs(kwargs.as_deref())?),
    };

    let config = if let Some(config_path) = cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    let stdout_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    logging::init(stdout_level, Some((Level::DEBUG, config.log_dir.clone()))).await;
    debug!(?config, "Using config");

    let registry = JobRegistry::from_config(config, Events::default());
    let mut events = registry.events().subscribe();

    let (accepted, message) = registry.start_job(&meter, &program, kwargs);
    if !accepted {
        return Err(eyre!("Job not started: {message}"));
    }

    let done = registry.wait(&meter);
    tokio::pin!(done);

    loop {
        tokio::select! {
            _ = &mut done => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, stopping the job");
                registry.stop_job(&meter).await;
            }
            event = events.recv() => match event {
                Ok(event) => info!(%event),
                Err(RecvError::Lagged(n)) => warn!("Missed {n} event(s)"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&registry.job_status(&meter))?
    );

    logging::shutdown();

    Ok(())
}
