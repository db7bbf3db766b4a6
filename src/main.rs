//! QuData Compute Agent - confidential-instance custody on leased hosts
//!
//! The agent provisions, supervises and forcibly destroys a single
//! isolated container workload, guards the host Docker socket through a
//! local authorization broker, and wipes customer data on tamper,
//! heartbeat loss or central command.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use qudata_agent::config::Configuration;
use qudata_agent::supervise::launcher;

#[derive(Parser)]
#[command(name = "qudata-agent")]
#[command(about = "QuData compute-host agent")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Mode arguments, e.g. `type=agent`
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("qudata_agent={}", log_level).into()),
        )
        .init();

    let mode = cli
        .args
        .iter()
        .filter_map(|arg| arg.split_once('='))
        .find(|(key, _)| *key == "type")
        .map(|(_, value)| value);

    match mode {
        Some("agent") => {
            info!("Starting QuData agent v{}", env!("CARGO_PKG_VERSION"));
            let config = Configuration::load(&cli.config)?;

            if let Err(e) = launcher::run(Arc::new(config)) {
                error!("Launcher error: {}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        _ => {
            eprintln!("Usage: qudata-agent [--config <path>] [--debug] type=agent");
            std::process::exit(1);
        }
    }
}
