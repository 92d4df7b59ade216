use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgd::config::AppConfig;
use imgd::context::AppContext;
use imgd::core::{diskdetect, pool::NbdPool};
use imgd::logging::{self, LogConfig};
use imgd::store::{RecordStore, SqliteStore};
use tracing::info;

#[derive(Parser)]
#[command(name = "imgd")]
#[command(about = "Whole-disk imaging backup node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the imaging node.
    Daemon,
    /// Print the disks and partitions this node can image.
    Disks,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Daemon => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Disks => run_disks().await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.log_json,
        verbose: config.verbose,
    });

    let store = SqliteStore::open(&config.database_path)
        .await
        .context("Failed to open the backup database")?;
    // jobs interrupted by an unclean shutdown are still marked running
    store.sweep_zombies(&config.node_name).await?;

    let pool = NbdPool::discover().context("Failed to enumerate nbd devices")?;
    let ctx = AppContext::new(config, Arc::new(store), pool);
    info!(
        node = %ctx.config.node_name,
        nbd_devices = ctx.pool.free_count(),
        "imaging node ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn run_disks() -> Result<()> {
    let disks = diskdetect::list_disks().await?;
    println!("{}", serde_json::to_string_pretty(&disks)?);
    Ok(())
}
