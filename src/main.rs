//! CLI entry point for saxsctrl.
//!
//! ```bash
//! # Connect every enabled instrument and log notifications until Ctrl-C
//! saxsctrl --config config/saxsctrl.toml run
//!
//! # Validate the configuration and list the instruments it defines
//! saxsctrl check
//!
//! # One JSON object per log line, no colors
//! saxsctrl --log-format json --no-color run
//! ```

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use saxs_core::{DriverRegistry, Marshaler};
use saxsctrl::config::{self, ApplicationConfig, LogFormat, SaxsConfig};
use saxsctrl::logging::{self, TracingConfig};
use saxsctrl::station::{self, log_event, Station};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on draining notifications after all instruments are gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "saxsctrl")]
#[command(about = "SAXS instrument communication layer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = config::DEFAULT_PATH)]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log span open and close events
    #[arg(long)]
    log_spans: bool,

    /// Disable colored log output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the enabled instruments and log their notifications
    Run,
    /// Validate the configuration
    Check,
    /// List the available driver kinds
    Kinds,
}

impl Cli {
    /// Logging setup from the `[application]` table and the command-line
    /// overrides.
    fn tracing_config(&self, application: &ApplicationConfig) -> Result<TracingConfig> {
        let setup = TracingConfig::from_config(application)?
            .with_span_events(self.log_spans)
            .with_ansi(!self.no_color);
        Ok(match self.log_format {
            Some(format) => setup.with_format(format),
            None => setup,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = station::registry();

    if let Commands::Kinds = cli.command {
        for kind in registry.list_factories() {
            println!("{kind}");
        }
        return Ok(());
    }

    let config = SaxsConfig::load_from(&cli.config)?;
    logging::init(cli.tracing_config(&config.application)?)?;
    config.validate(&registry)?;

    match cli.command {
        Commands::Check => {
            for instrument in &config.instruments {
                let state = if instrument.enabled { "enabled" } else { "disabled" };
                println!(
                    "{:<16} {:<10} {:<24} {state}",
                    instrument.id, instrument.kind, instrument.connection.address
                );
            }
            println!("Configuration OK");
            Ok(())
        }
        Commands::Run => run(&config, &registry).await,
        Commands::Kinds => Ok(()),
    }
}

async fn run(config: &SaxsConfig, registry: &DriverRegistry) -> Result<()> {
    tracing::info!(name = %config.application.name, "Starting");
    let (marshaler, run_loop) = Marshaler::channel();
    let station = Station::build(config, registry, &marshaler).context("Failed to build station")?;
    drop(marshaler);
    station.subscribe_all(log_event);

    // Notifications are consumed on a single task for the whole session
    let consumer = tokio::spawn(run_loop.run());

    let failures = station.connect_all().await;
    let connected = station.instruments().len() - failures.len();
    tracing::info!(connected, failed = failures.len(), "Instruments connected");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    station.disconnect_all().await;
    drop(station);
    if tokio::time::timeout(DRAIN_TIMEOUT, consumer).await.is_err() {
        tracing::warn!("Notification queue did not drain in time");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_overrides_logging() {
        let cli = Cli::try_parse_from([
            "saxsctrl",
            "--log-format",
            "json",
            "--log-spans",
            "--no-color",
            "check",
        ])
        .unwrap();
        let setup = cli.tracing_config(&ApplicationConfig::default()).unwrap();
        assert_eq!(setup.format, LogFormat::Json);
        assert!(setup.with_span_events);
        assert!(!setup.with_ansi);
    }

    #[test]
    fn test_configured_logging_kept_without_overrides() {
        let cli = Cli::try_parse_from(["saxsctrl", "run"]).unwrap();
        let application = ApplicationConfig {
            log_format: LogFormat::Compact,
            ..ApplicationConfig::default()
        };
        let setup = cli.tracing_config(&application).unwrap();
        assert_eq!(setup.format, LogFormat::Compact);
        assert!(!setup.with_span_events);
        assert!(setup.with_ansi);
    }
}
