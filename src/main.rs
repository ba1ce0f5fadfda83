use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use notifyd::bootstrap::{Server, StageRole};
use notifyd::config::Config;
use notifyd::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "notifyd")]
#[command(author, version, about = "Multi-channel notification pipeline daemon")]
struct Args {
    /// Path to config file (defaults + env vars when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stages to run in this process (repeatable)
    #[arg(long = "stage", value_name = "STAGE", default_values = ["all"])]
    stages: Vec<StageRole>,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    init_tracing(&config.telemetry)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stages = ?args.stages,
        broker = ?config.broker.backend,
        database = ?config.database.backend,
        cache = ?config.cache.backend,
        "starting notifyd"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let server = Server::new(config, args.stages);
    server.run().await?;

    Ok(())
}
