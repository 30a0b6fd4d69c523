use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use catalog_migrator::coordination::{ChunkScheduler, Coordinator};
use catalog_migrator::migrate::{
    HistoryGapFiller, MigrationDriver, MultimediaReconciler, ProductUpserter,
    ProviderReconciler, RunOutcome,
};
use catalog_migrator::resolve::ReferenceResolver;
use catalog_migrator::source::{select_reader, LegacyStore};
use catalog_migrator::store::Db;
use catalog_migrator::util::env as env_util;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // Tracing may not be initialized yet on the earliest failures.
            eprintln!("fatal: {e:#}");
            error!(error = %e, "worker exiting on fatal error");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    env_util::init_env();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init();

    env_util::preflight_check(
        "migrate_worker",
        &["PRODUCTS_DATABASE_URL", "REDIS_URL"],
        &[
            "OLD_DATABASE_URL",
            "LEGACY_DATABASE_URL",
            "WORKER_ID",
            "TEST_MODE",
            "CHUNK_SIZE",
            "LOCK_TTL_SECS",
            "SNAPSHOT_PATH",
        ],
    )?;

    let legacy_url = env_util::legacy_db_url()?;
    let products_url = env_util::products_db_url()?;
    let redis_url = env_util::redis_url()?;

    let legacy_db = Db::connect(
        "legacy",
        &legacy_url,
        env_util::env_parse("LEGACY_DB_MAX_CONNS", 3u32),
    )
    .await
    .context("connecting to legacy store")?;
    let target_db = Db::connect(
        "target",
        &products_url,
        env_util::env_parse("DB_MAX_CONNS", 5u32),
    )
    .await
    .context("connecting to target store")?;
    let coordinator = Coordinator::connect(&redis_url)
        .await
        .context("connecting to coordination service")?;

    let worker_id = env_util::worker_id();
    let chunk_size: u64 = env_util::env_parse("CHUNK_SIZE", 500u64);
    let lock_ttl_secs: u64 = env_util::env_parse("LOCK_TTL_SECS", 120u64);
    info!(worker_id = %worker_id, chunk_size, lock_ttl_secs, "worker starting");

    let scheduler = ChunkScheduler::new(coordinator, worker_id, chunk_size, lock_ttl_secs);
    let legacy_store = LegacyStore::new(legacy_db);
    let reader = select_reader(&legacy_store).await?;
    let resolver = Arc::new(ReferenceResolver::new(target_db.clone()));

    let providers = ProviderReconciler::new(target_db.clone(), resolver.clone());
    let products = ProductUpserter::new(target_db.clone(), resolver.clone());
    let histories = HistoryGapFiller::new(target_db.clone(), legacy_store.clone());
    let multimedia = MultimediaReconciler::new(target_db);

    let shutdown = Arc::new(AtomicBool::new(false));
    let exit_code = Arc::new(AtomicI32::new(130));
    spawn_signal_listener(shutdown.clone(), exit_code.clone())?;

    let mut driver = MigrationDriver::new(
        scheduler, reader, providers, products, histories, multimedia, shutdown,
    );

    match driver.execute().await? {
        RunOutcome::Completed => Ok(0),
        RunOutcome::Interrupted => {
            let code = exit_code.load(Ordering::Relaxed);
            info!(code, "worker interrupted by signal");
            Ok(code)
        }
    }
}

/// SIGINT/SIGTERM set the shutdown flag; the driver finishes the current
/// record, reverts the in-flight chunk, and the process exits 130/143.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>, exit_code: Arc<AtomicI32>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                exit_code.store(130, Ordering::Relaxed);
                info!("SIGINT received; finishing current record");
            }
            _ = sigterm.recv() => {
                exit_code.store(143, Ordering::Relaxed);
                info!("SIGTERM received; finishing current record");
            }
        }
        shutdown.store(true, Ordering::Relaxed);
    });
    Ok(())
}
