use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use catalog_migrator::coordination::{ChunkScheduler, ChunkStatus, Coordinator};
use catalog_migrator::util::env as env_util;

#[derive(Parser, Debug)]
#[command(name = "migrate_ctl", version, about = "Catalog migration operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Print the aggregated progress summary
    Progress,
    /// Dump every chunk's state, one line per chunk
    Chunks {
        /// Only show chunks with this status (pending/processing/completed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Delete the chunk map, migration state and every chunk lock
    Reset {
        /// Required confirmation; reset is unconditional and irreversible
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init();
    let cli = Cli::parse();

    env_util::preflight_check("migrate_ctl", &["REDIS_URL"], &["WORKER_ID"])?;
    let coordinator = Coordinator::connect(&env_util::redis_url()?).await?;
    let scheduler = ChunkScheduler::new(
        coordinator,
        env_util::worker_id(),
        env_util::env_parse("CHUNK_SIZE", 500u64),
        env_util::env_parse("LOCK_TTL_SECS", 120u64),
    );

    match cli.command {
        Commands::Progress => {
            let p = scheduler.get_progress().await?;
            println!(
                "chunks: {} total / {} pending / {} processing / {} completed",
                p.total_chunks, p.pending, p.processing, p.completed
            );
            println!(
                "records: {} processed, {} errors, {} duplicates skipped",
                p.totals.processed, p.totals.errors, p.totals.duplicates_skipped
            );
            println!(
                "writes: {} providers created, {} products created, {} products updated, {} histories filled, {} multimedia touched",
                p.totals.providers_created,
                p.totals.products_created,
                p.totals.products_updated,
                p.totals.histories_filled,
                p.totals.multimedia_created
            );
        }
        Commands::Chunks { status } => {
            let filter = match status.as_deref() {
                None => None,
                Some("pending") => Some(ChunkStatus::Pending),
                Some("processing") => Some(ChunkStatus::Processing),
                Some("completed") => Some(ChunkStatus::Completed),
                Some(other) => bail!("unknown status filter: {other}"),
            };
            for chunk in scheduler.load_chunks().await?.values() {
                if filter.map_or(false, |f| chunk.status != f) {
                    continue;
                }
                println!(
                    "chunk {:>6} [{:>8}, {:>8})  {:?}  worker={}  processed={}  errors={}",
                    chunk.chunk_id,
                    chunk.start_offset,
                    chunk.end_offset,
                    chunk.status,
                    chunk.worker_id.as_deref().unwrap_or("-"),
                    chunk.metrics.processed,
                    chunk.metrics.errors
                );
            }
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to reset without --yes");
            }
            scheduler.reset().await?;
            info!("coordination state deleted");
        }
    }
    Ok(())
}
