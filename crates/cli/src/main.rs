//! Load fleet CLI
//!
//! Sets up, starts, stops and tears down the load agents of a project.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{check, fleet, status};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Load fleet CLI
#[derive(Parser)]
#[command(name = "fleet")]
#[command(author, version, about = "Orchestrates distributed load-testing agents", long_about = None)]
pub struct Cli {
    /// Project file (JSON)
    #[arg(long, short, env = "FLEET_PROJECT", default_value = "fleet.json")]
    pub project: PathBuf,

    /// Settings file (defaults to ./fleet.toml, then ~/.config/fleet/fleet.toml)
    #[arg(long, env = "FLEET_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate clusterables and provision their load agents
    Setup {
        /// Also set up inactive clusterables
        #[arg(long)]
        force: bool,
    },

    /// Bring agents up and start load generation
    Start,

    /// Stop load generation
    Stop {
        /// Release agent machines after stopping
        #[arg(long)]
        suspend: bool,
    },

    /// Abort load generation
    Abort,

    /// Destroy every load agent and clean up credentials
    Terminate,

    /// Remove every fleet artifact from the cloud accounts in use
    Purge,

    /// Show clusterables, agents and the current execution cycle
    Status,

    /// Verify a machine has the required runtime and tool versions
    Check {
        /// Machine address
        host: String,

        /// Login user
        #[arg(long, default_value = "ubuntu")]
        user: String,

        /// Identity file
        #[arg(long, short, default_value = "server.pem")]
        identity: PathBuf,

        /// SSH port
        #[arg(long, default_value_t = 22)]
        port: u16,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let settings = config::load_settings(cli.settings.as_deref())?;
    let project = config::load_project(&cli.project)?;
    let runtime = config::FleetRuntime::build(settings, project)?;

    match cli.command {
        Commands::Setup { force } => fleet::setup(&runtime, force, cli.format).await?,
        Commands::Start => fleet::start(&runtime, cli.format).await?,
        Commands::Stop { suspend } => fleet::stop(&runtime, suspend, cli.format).await?,
        Commands::Abort => fleet::abort(&runtime, cli.format).await?,
        Commands::Terminate => fleet::terminate(&runtime).await?,
        Commands::Purge => fleet::purge(&runtime, cli.format).await?,
        Commands::Status => status::show_status(&runtime, cli.format).await?,
        Commands::Check {
            host,
            user,
            identity,
            port,
        } => check::check_machine(&runtime, &host, &user, &identity, port).await?,
    }

    Ok(())
}
