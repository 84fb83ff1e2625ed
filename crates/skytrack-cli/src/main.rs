use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skytrack_storage::BalloonStore;
use skytrack_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "skytrack-cli")]
#[command(about = "Balloon trajectory tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every missing hour once and exit.
    Sync,
    /// Apply the database schema.
    Migrate,
    /// Sync, install the hourly trigger and serve HTTP.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = skytrack_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} hours={} failed_hours={} points={}",
                summary.run_id, summary.hours_committed, summary.hours_failed, summary.points_stored
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = BalloonStore::connect(&config.database_url, config.balloon_slots)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            store.migrate().await.context("applying schema")?;
            store.close().await;
            println!("schema applied to {}", config.database_url);
        }
        Commands::Serve => skytrack_web::serve_from_env().await?,
    }

    Ok(())
}
