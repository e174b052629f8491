use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tix_storage::PgStore;
use tix_sync::{require_env, WRITE_DATABASE_URL_ENV};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tix-cli")]
#[command(about = "Resale ticket price tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Daily: walk the sitemap and upsert events in the target region.
    Discover {
        /// Fetch and extract without touching the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Hourly: record one price snapshot per ticket type for active events.
    Snapshot,
    /// Apply the schema and access policies.
    Migrate {
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Serve the read API with the public credential.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Discover { dry_run: false } => {
            let summary = tix_sync::run_discovery_from_env().await?;
            println!(
                "discover complete: run_id={} candidates={} admitted={} inserted={} updated={} skipped={} failed={}",
                summary.run_id,
                summary.candidates,
                summary.admitted,
                summary.inserted,
                summary.updated,
                summary.skipped_region,
                summary.fetch_failures + summary.upsert_failures
            );
            if let Some(err) = &summary.sitemap_error {
                eprintln!("sitemap unavailable: {err}");
            }
        }
        Commands::Discover { dry_run: true } => {
            let (summary, events) = tix_sync::run_discovery_dry_run().await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            println!(
                "dry run: run_id={} candidates={} admitted={} skipped={} failed={}",
                summary.run_id,
                summary.candidates,
                summary.admitted,
                summary.skipped_region,
                summary.fetch_failures
            );
        }
        Commands::Snapshot => {
            let summary = tix_sync::run_snapshots_from_env().await?;
            println!(
                "snapshot complete: run_id={} active={} priced={} unpriced={} inserted={} failed={}",
                summary.run_id,
                summary.active_events,
                summary.events_with_prices,
                summary.events_without_prices,
                summary.snapshots_inserted,
                summary.fetch_failures + summary.insert_failures
            );
        }
        Commands::Migrate { database_url } => {
            let database_url = match database_url {
                Some(url) => url,
                None => require_env(WRITE_DATABASE_URL_ENV)?,
            };
            let store = PgStore::connect(&database_url)
                .await
                .context("connecting for migrations")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            tix_web::serve_from_env().await?;
        }
    }

    Ok(())
}
