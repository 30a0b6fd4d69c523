//! Per-chunk control loop: lease a chunk, walk its records through
//! provider -> product -> histories -> multimedia, report counters, repeat
//! until every chunk is completed. Record-scoped failures are counted and
//! skipped; anything else reverts the chunk to `pending` for a retry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::coordination::{ChunkMetrics, ChunkScheduler, ChunkState, LeaseRenewer};
use crate::error::MigrateError;
use crate::migrate::history::HistoryGapFiller;
use crate::migrate::multimedia::MultimediaReconciler;
use crate::migrate::product::ProductUpserter;
use crate::migrate::provider::ProviderReconciler;
use crate::source::{SourceProduct, SourceRead};
use crate::util::env::{env_flag, env_parse};

/// Wait between polls when peers still hold unfinished chunks.
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Record cap applied when `TEST_MODE` is on.
const TEST_MODE_RECORD_CAP: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All chunks completed (or there was nothing to do).
    Completed,
    /// A shutdown signal arrived; the in-flight chunk was reverted.
    Interrupted,
}

pub struct MigrationDriver {
    scheduler: ChunkScheduler,
    reader: Arc<dyn SourceRead>,
    providers: ProviderReconciler,
    products: ProductUpserter,
    histories: HistoryGapFiller,
    multimedia: MultimediaReconciler,
    shutdown: Arc<AtomicBool>,
    /// Source ids already processed by this worker; short-circuits records
    /// seen twice in one run. Not a substitute for datastore idempotence.
    seen: HashSet<String>,
    max_retries: u32,
    retry_delay: Duration,
}

impl MigrationDriver {
    pub fn new(
        scheduler: ChunkScheduler,
        reader: Arc<dyn SourceRead>,
        providers: ProviderReconciler,
        products: ProductUpserter,
        histories: HistoryGapFiller,
        multimedia: MultimediaReconciler,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            scheduler,
            reader,
            providers,
            products,
            histories,
            multimedia,
            shutdown,
            seen: HashSet::new(),
            max_retries: env_parse("MAX_RETRIES", 3u32),
            retry_delay: Duration::from_secs(env_parse("RETRY_DELAY", 5u64)),
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Main worker loop. Returns once every chunk is completed, or as soon
    /// as a shutdown request has been honored.
    pub async fn execute(&mut self) -> Result<RunOutcome, MigrateError> {
        if self.scheduler.chunk_count().await? == 0 {
            let mut total = self.reader.count().await?;
            if env_flag("TEST_MODE", false) {
                let capped = total.min(TEST_MODE_RECORD_CAP);
                info!(total, capped, "TEST_MODE on; capping record count");
                total = capped;
            }
            let chunks = self.scheduler.initialize_chunks(total).await?;
            if chunks == 0 {
                info!("nothing to migrate; exiting");
                return Ok(RunOutcome::Completed);
            }
        }

        loop {
            if self.shutting_down() {
                return Ok(RunOutcome::Interrupted);
            }

            let Some(chunk) = self.next_chunk_with_retries().await? else {
                if self.scheduler.all_chunks_completed().await? {
                    self.on_complete().await?;
                    return Ok(RunOutcome::Completed);
                }
                info!("no leasable chunk; waiting for peers");
                sleep(IDLE_WAIT).await;
                continue;
            };

            let renewer = LeaseRenewer::spawn(self.scheduler.clone(), chunk.chunk_id);
            let result = self.process_chunk(&chunk).await;
            renewer.stop().await;

            match result {
                Ok((metrics, interrupted)) => {
                    if interrupted {
                        warn!(chunk_id = chunk.chunk_id, "shutdown mid-chunk; reverting to pending");
                        self.scheduler.mark_chunk_pending(chunk.chunk_id).await?;
                        return Ok(RunOutcome::Interrupted);
                    }
                    self.scheduler
                        .mark_chunk_completed(chunk.chunk_id, &metrics)
                        .await?;
                }
                Err(e) => {
                    error!(chunk_id = chunk.chunk_id, error = %e, "chunk processing failed; reverting to pending");
                    self.scheduler.mark_chunk_pending(chunk.chunk_id).await?;
                }
            }
        }
    }

    /// `get_next_chunk` with a bounded retry on coordination hiccups
    /// (`MAX_RETRIES` / `RETRY_DELAY`); anything persistent stays fatal.
    async fn next_chunk_with_retries(&self) -> Result<Option<ChunkState>, MigrateError> {
        let mut attempt = 0u32;
        loop {
            match self.scheduler.get_next_chunk().await {
                Ok(chunk) => return Ok(chunk),
                Err(MigrateError::CoordinationUnavailable(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "coordination read failed; retrying");
                    sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Walk one chunk. The bool is true when a shutdown interrupted the walk
    /// after the current record finished.
    #[instrument(skip(self, chunk), fields(chunk_id = chunk.chunk_id))]
    async fn process_chunk(
        &mut self,
        chunk: &ChunkState,
    ) -> Result<(ChunkMetrics, bool), MigrateError> {
        let take = chunk.end_offset.saturating_sub(chunk.start_offset);
        let records = self.reader.read(chunk.start_offset, take).await?;
        info!(
            chunk_id = chunk.chunk_id,
            records = records.len(),
            "processing chunk"
        );

        let mut metrics = ChunkMetrics::default();
        for record in records {
            if self.shutting_down() {
                return Ok((metrics, true));
            }
            if !self.seen.insert(record.source_id.clone()) {
                metrics.duplicates_skipped += 1;
                continue;
            }
            match self.migrate_record(&record).await {
                Ok(tally) => {
                    metrics.processed += 1;
                    if tally.provider_created {
                        metrics.providers_created += 1;
                    }
                    if tally.product_created {
                        metrics.products_created += 1;
                    } else {
                        metrics.products_updated += 1;
                    }
                    metrics.histories_filled += tally.histories_filled;
                    metrics.multimedia_created += tally.multimedia_touched;
                }
                Err(e) if e.is_record_scoped() => {
                    metrics.errors += 1;
                    warn!(
                        external_id = record.external_id.as_deref().unwrap_or("?"),
                        platform = record.platform_name.as_deref().unwrap_or("?"),
                        country = record.country_code.as_deref().unwrap_or("?"),
                        error = %e,
                        "record failed; continuing"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok((metrics, false))
    }

    /// Fixed per-record order: provider, product, histories, multimedia.
    async fn migrate_record(&self, record: &SourceProduct) -> Result<RecordTally, MigrateError> {
        let provider = self.providers.resolve(record).await?;
        let upsert = self.products.upsert(record, &provider.provider_id).await?;
        let filled = self.histories.fill(record, &upsert.product_id).await?;
        let media = self.multimedia.reconcile(record, &upsert.product_id).await?;

        Ok(RecordTally {
            provider_created: provider.created,
            product_created: upsert.created,
            histories_filled: filled,
            multimedia_touched: media,
        })
    }

    async fn on_complete(&self) -> Result<(), MigrateError> {
        let progress = self.scheduler.get_progress().await?;
        info!(
            chunks = progress.total_chunks,
            processed = progress.totals.processed,
            providers_created = progress.totals.providers_created,
            products_created = progress.totals.products_created,
            products_updated = progress.totals.products_updated,
            histories_filled = progress.totals.histories_filled,
            multimedia_created = progress.totals.multimedia_created,
            duplicates_skipped = progress.totals.duplicates_skipped,
            errors = progress.totals.errors,
            "migration complete"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordTally {
    provider_created: bool,
    product_created: bool,
    histories_filled: u64,
    multimedia_touched: u64,
}
