use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use feira_storage::PgPriceStore;
use feira_sync::{PriceSyncEngine, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "feira-cli")]
#[command(about = "Marketplace price-recommendation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations, start the scheduler when enabled, serve the API.
    Serve,
    /// Run one sync: bulletin first, web fallback when it underdelivers.
    Sync {
        /// Minimum bulletin yield before falling back.
        #[arg(long)]
        min: Option<usize>,
        /// Upsert instead of insert-if-absent on the fallback path.
        #[arg(long)]
        overwrite: bool,
    },
    /// Scrape the quotations table and print the raw items, no writes.
    CollectAgrolink,
    /// Extract and persist a specific bulletin PDF.
    ExtractPdf {
        #[arg(long)]
        url: Option<String>,
    },
    /// Apply pending database migrations and exit.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn build_engine(config: SyncConfig) -> Result<Arc<PriceSyncEngine>> {
    let store = PgPriceStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    let engine = PriceSyncEngine::with_default_sources(config, Arc::new(store))?;
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let engine = build_engine(config).await?;
            if let Some(scheduler) = engine.maybe_build_scheduler().await? {
                scheduler.start().await?;
                tracing::info!("daily sync scheduler started");
            }
            feira_web::serve(engine).await?;
        }
        Commands::Sync { min, overwrite } => {
            let engine = build_engine(config).await?;
            let outcome = engine.sync_once(min, Some(overwrite)).await?;
            println!(
                "sync complete: source={} collected={} written={}",
                outcome.source, outcome.collected, outcome.written
            );
        }
        Commands::CollectAgrolink => {
            let engine = build_engine(config).await?;
            let items = engine.collect_agrolink().await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::ExtractPdf { url } => {
            let engine = build_engine(config).await?;
            let extraction = engine.extract_ama(url.as_deref()).await?;
            println!(
                "extracted {} quotes dated {} from {} ({} written)",
                extraction.collected, extraction.date, extraction.source_url, extraction.written
            );
        }
        Commands::Migrate => {
            let store = PgPriceStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
