mod cli;
mod commands;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use matchfan_core::Config;

use crate::cli::{CliArgs, Command};
use crate::commands::Backends;

fn load_config(args: &CliArgs) -> Config {
    let mut config = match &args.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    if let Some(backend) = &args.backend {
        config.store.backend = backend.to_lowercase();
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Before parsing so `.env` values feed clap's `env` fallbacks.
    matchfan_core::config::load_dotenv();
    let args = CliArgs::parse();

    let config = load_config(&args);
    config.log_summary();
    let backends = Backends::connect(config)
        .await
        .context("failed to initialise backends")?;

    match args.command {
        Command::Run => commands::run(&backends).await,
        Command::Fetch {
            player,
            force,
            timeout_secs,
        } => {
            let timeout = Duration::from_secs(timeout_secs);
            commands::fetch(&backends, player.handle(), force, timeout).await
        }
        Command::Status(player) => commands::status(&backends, player.handle()).await,
        Command::History { player, page } => {
            commands::history(&backends, player.handle(), page).await
        }
        Command::Sweep => commands::sweep(&backends).await,
    }
}
