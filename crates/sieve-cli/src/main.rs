//! Sieve CLI entrypoint.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod handlers;
mod output;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "sieve")]
#[command(author, version, about = "Change-scoped CI job gating", long_about = None)]
struct Cli {
    /// Log format (overrides config)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

/// Logs go to stderr so reports on stdout stay machine-readable.
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = CliConfig::load()?;
    init_tracing(cli.log_format.unwrap_or(config.log_format));

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan {
            path,
            event,
            format,
        } => handlers::plan(&config, &path, event, format)?,
        Commands::Run { path, event, run } => {
            return handlers::run(&config, &path, event, run).await;
        }
        Commands::Listen { path, run } => return handlers::listen(&config, &path, run).await,
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
