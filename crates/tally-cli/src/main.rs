use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally_cli::commands::{reset, run, status, totals, users};
use tally_cli::{Cli, Commands, Config};

/// Load config and ensure the database's parent directory exists.
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so command output on stdout stays clean
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Some(Commands::Run) => {
            let config = load_config(cli.config.as_deref())?;
            run::run(&config)?;
        }
        Some(Commands::Totals(args)) => {
            let config = load_config(cli.config.as_deref())?;
            totals::run(&mut out, args, &config)?;
        }
        Some(Commands::Reset(args)) => {
            let config = load_config(cli.config.as_deref())?;
            reset::run(&mut out, args, &config)?;
        }
        Some(Commands::Users) => {
            let config = load_config(cli.config.as_deref())?;
            users::run(&mut out, &config)?;
        }
        Some(Commands::Status) => {
            let config = load_config(cli.config.as_deref())?;
            status::run(&mut out, &config)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
