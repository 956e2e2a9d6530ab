use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use castsync_storage::PgStore;
use castsync_sync::{engine_from_config, maybe_build_scheduler, CycleOutcome, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "castsync")]
#[command(about = "Mirror a remote video-scheduling catalog into local storage")]
struct Cli {
    /// YAML config file; `CASTSYNC_*` variables still override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle.
    Sync,
    /// Create the database schema.
    Migrate,
    /// Run sync cycles on the configured cron until interrupted.
    Schedule,
    /// Print the cursor and collection hashes.
    Status,
    /// Clear the cursor and hashes so the next cycle re-syncs everything.
    ResetCursor,
    /// Run the orphan audit now, ignoring the daily throttle.
    Orphans,
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_yaml_file(path)?.with_overrides(|key| std::env::var(key).ok()),
        None => SyncConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = engine_from_config(&config).await?;
            let outcome = engine.run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let CycleOutcome::Failed { error, .. } = outcome {
                anyhow::bail!("sync cycle failed: {error}");
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, 1)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let engine = Arc::new(engine_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(engine, &config).await? else {
                anyhow::bail!("scheduler disabled; set CASTSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status => {
            let engine = engine_from_config(&config).await?;
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::ResetCursor => {
            let engine = engine_from_config(&config).await?;
            engine.reset_cursor().await?;
            println!("cursor reset; next sync starts from the beginning of the catalog");
        }
        Commands::Orphans => {
            let engine = engine_from_config(&config).await?;
            match engine.audit_orphans(true).await {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => anyhow::bail!("orphan audit could not list remote shows"),
            }
        }
    }

    Ok(())
}
