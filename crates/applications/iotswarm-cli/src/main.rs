//! `iotswarm` binary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iotswarm_cli::{
    commands, telemetry, AppConfig, AppContext, LiveOptions, SimulateOptions,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "iotswarm")]
#[command(version, about = "Simulate swarms of telemetry devices and forward live readings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulated device per site
    Simulate {
        /// TOML configuration file
        config: PathBuf,

        /// Maximum number of devices (0 for one per site)
        #[arg(short, long)]
        devices: Option<usize>,

        /// Cycles each device runs before stopping
        #[arg(short, long)]
        max_cycles: Option<u64>,

        /// Seconds between device cycles
        #[arg(short, long)]
        sleep_time: Option<u64>,

        /// Stop the whole swarm after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Swarm name used in logs
        #[arg(long)]
        name: Option<String>,
    },

    /// Forward readings newer than the stored checkpoints
    SendLiveData {
        /// TOML configuration file
        config: PathBuf,

        /// Table to upload; repeat for several, or `all`
        #[arg(short, long = "table")]
        tables: Vec<String>,

        /// Site to upload; repeat for several, or `all`
        #[arg(short, long = "site")]
        sites: Vec<String>,

        /// Hours to look back for pairs without a checkpoint
        #[arg(short, long)]
        fallback_hours: Option<u32>,

        /// Rows per payload; one value or one per table
        #[arg(short, long = "batch-size")]
        batch_sizes: Vec<usize>,

        /// Fetch and format without sending or checkpointing
        #[arg(long)]
        dry: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        /// TOML configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            devices,
            max_cycles,
            sleep_time,
            timeout,
            name,
        } => {
            let ctx = open(&config).await?;
            let options = SimulateOptions {
                devices,
                max_cycles,
                sleep_time: sleep_time.map(Duration::from_secs),
                timeout_secs: timeout,
                swarm_name: name,
            };

            let report = commands::simulate(&ctx, &options, ctrl_c()).await?;
            print!("{}", commands::render_swarm_report(&report));
        }
        Commands::SendLiveData {
            config,
            tables,
            sites,
            fallback_hours,
            batch_sizes,
            dry,
        } => {
            let ctx = open(&config).await?;
            let options = LiveOptions {
                tables,
                sites,
                fallback_hours,
                batch_sizes,
                dry_run: dry,
            };

            let report = commands::send_live_data(&ctx, &options, ctrl_c()).await?;
            print!("{}", commands::render_upload_report(&report));
        }
        Commands::ShowConfig { config } => {
            let config = AppConfig::load(&config)?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn open(path: &Path) -> Result<AppContext> {
    let config = AppConfig::load(path)?;
    telemetry::init_tracing(&config.log)?;
    info!(config = %path.display(), version = env!("CARGO_PKG_VERSION"), "Starting iotswarm");

    AppContext::from_config(config)
        .await
        .context("failed to initialise source and sink")
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the work finishes by itself
        std::future::pending::<()>().await;
    }
}
