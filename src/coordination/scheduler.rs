//! Chunk scheduling over the coordination service.
//!
//! Persistent state is two key families: a hash `chunk_id -> JSON(ChunkState)`
//! and one TTL'd lock key per leased chunk whose value is the holder's worker
//! id. Mutual exclusion rests entirely on the atomic `SET NX EX` acquisition;
//! everything else is bookkeeping on top of it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::coordination::redis::Coordinator;
use crate::error::MigrateError;
use crate::util::env::env_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
}

/// Per-chunk counters, merged into the chunk entry at completion and
/// aggregated for progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub providers_created: u64,
    #[serde(default)]
    pub products_created: u64,
    #[serde(default)]
    pub products_updated: u64,
    #[serde(default)]
    pub histories_filled: u64,
    #[serde(default)]
    pub multimedia_created: u64,
    #[serde(default)]
    pub duplicates_skipped: u64,
    #[serde(default)]
    pub errors: u64,
}

impl ChunkMetrics {
    pub fn merge(&mut self, other: &ChunkMetrics) {
        self.processed += other.processed;
        self.providers_created += other.providers_created;
        self.products_created += other.products_created;
        self.products_updated += other.products_updated;
        self.histories_filled += other.histories_filled;
        self.multimedia_created += other.multimedia_created;
        self.duplicates_skipped += other.duplicates_skipped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkState {
    pub chunk_id: u64,
    pub start_offset: u64,
    pub end_offset: u64,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: ChunkMetrics,
}

/// Read-only progress summary across all chunks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub total_chunks: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub totals: ChunkMetrics,
}

/// Half-open `[start, end)` windows of `chunk_size` over `total` records.
pub fn partition(total: u64, chunk_size: u64) -> Vec<(u64, u64, u64)> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut out = Vec::new();
    let mut chunk_id = 0u64;
    let mut start = 0u64;
    while start < total {
        let end = (start + chunk_size).min(total);
        out.push((chunk_id, start, end));
        chunk_id += 1;
        start = end;
    }
    out
}

fn summarize(chunks: &BTreeMap<u64, ChunkState>) -> Progress {
    let mut p = Progress {
        total_chunks: chunks.len() as u64,
        ..Progress::default()
    };
    for c in chunks.values() {
        match c.status {
            ChunkStatus::Pending => p.pending += 1,
            ChunkStatus::Processing => p.processing += 1,
            ChunkStatus::Completed => p.completed += 1,
        }
        p.totals.merge(&c.metrics);
    }
    p
}

#[derive(Clone)]
pub struct ChunkScheduler {
    coord: Coordinator,
    worker_id: String,
    chunk_size: u64,
    lock_ttl_secs: u64,
    chunks_key: String,
    lock_prefix: String,
    state_key: String,
}

impl ChunkScheduler {
    pub fn new(coord: Coordinator, worker_id: String, chunk_size: u64, lock_ttl_secs: u64) -> Self {
        let prefix = env_opt("MIGRATION_KEY_PREFIX").unwrap_or_else(|| "product-migration".into());
        Self {
            coord,
            worker_id,
            chunk_size: chunk_size.max(1),
            lock_ttl_secs: lock_ttl_secs.max(1),
            chunks_key: format!("{prefix}:chunks"),
            lock_prefix: format!("{prefix}:chunk-lock:"),
            state_key: format!("{prefix}:state"),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lock_ttl_secs(&self) -> u64 {
        self.lock_ttl_secs
    }

    fn lock_key(&self, chunk_id: u64) -> String {
        format!("{}{}", self.lock_prefix, chunk_id)
    }

    /// Create the persistent chunk map. Callers check `chunk_count()` first
    /// and skip when non-empty; re-initializing an existing map would clobber
    /// progress.
    #[instrument(skip(self))]
    pub async fn initialize_chunks(&self, total: u64) -> Result<u64, MigrateError> {
        let windows = partition(total, self.chunk_size);
        if windows.is_empty() {
            info!(total, "no records to partition; chunk map left empty");
            return Ok(0);
        }
        let mut entries = Vec::with_capacity(windows.len());
        for (chunk_id, start_offset, end_offset) in &windows {
            let state = ChunkState {
                chunk_id: *chunk_id,
                start_offset: *start_offset,
                end_offset: *end_offset,
                status: ChunkStatus::Pending,
                worker_id: None,
                last_update: None,
                metrics: ChunkMetrics::default(),
            };
            entries.push((chunk_id.to_string(), serde_json::to_string(&state)?));
        }
        // Bounded write sizes; a 400k-record run at chunk_size 500 is 800 fields.
        for batch in entries.chunks(500) {
            self.coord.hash_set_many(&self.chunks_key, batch).await?;
        }
        info!(
            total,
            chunks = windows.len(),
            chunk_size = self.chunk_size,
            "chunk map initialized"
        );
        Ok(windows.len() as u64)
    }

    pub async fn chunk_count(&self) -> Result<u64, MigrateError> {
        self.coord.hash_len(&self.chunks_key).await
    }

    /// Full decoded chunk map, ordered by chunk id.
    pub async fn load_chunks(&self) -> Result<BTreeMap<u64, ChunkState>, MigrateError> {
        let raw = self.coord.hash_get_all(&self.chunks_key).await?;
        let mut out = BTreeMap::new();
        for (field, value) in raw {
            let state: ChunkState = serde_json::from_str(&value).map_err(|e| {
                MigrateError::CorruptState(format!("chunk entry {field} undecodable: {e}"))
            })?;
            out.insert(state.chunk_id, state);
        }
        Ok(out)
    }

    /// Lease the first available `pending` chunk. When none is leasable, a
    /// second pass re-homes `processing` entries whose lock key has expired
    /// (worker died without running its failure path) and retries those.
    #[instrument(skip(self))]
    pub async fn get_next_chunk(&self) -> Result<Option<ChunkState>, MigrateError> {
        let chunks = self.load_chunks().await?;

        for state in chunks.values() {
            if state.status != ChunkStatus::Pending {
                continue;
            }
            if let Some(leased) = self.try_lease(state).await? {
                return Ok(Some(leased));
            }
        }

        for state in chunks.values() {
            if state.status != ChunkStatus::Processing {
                continue;
            }
            if self.coord.exists(&self.lock_key(state.chunk_id)).await? {
                continue;
            }
            warn!(
                chunk_id = state.chunk_id,
                stale_worker = state.worker_id.as_deref().unwrap_or("?"),
                "processing chunk has no live lease; re-homing to pending"
            );
            let mut reverted = state.clone();
            reverted.status = ChunkStatus::Pending;
            reverted.worker_id = None;
            reverted.last_update = Some(Utc::now());
            self.store_chunk(&reverted).await?;
            if let Some(leased) = self.try_lease(&reverted).await? {
                return Ok(Some(leased));
            }
        }

        Ok(None)
    }

    async fn try_lease(&self, state: &ChunkState) -> Result<Option<ChunkState>, MigrateError> {
        let acquired = self
            .coord
            .set_nx_ex(
                &self.lock_key(state.chunk_id),
                &self.worker_id,
                self.lock_ttl_secs,
            )
            .await?;
        if !acquired {
            debug!(chunk_id = state.chunk_id, "lock held elsewhere; skipping");
            return Ok(None);
        }
        let mut leased = state.clone();
        leased.status = ChunkStatus::Processing;
        leased.worker_id = Some(self.worker_id.clone());
        leased.last_update = Some(Utc::now());
        self.store_chunk(&leased).await?;
        info!(
            chunk_id = leased.chunk_id,
            start_offset = leased.start_offset,
            end_offset = leased.end_offset,
            "chunk leased"
        );
        Ok(Some(leased))
    }

    /// Extend the lease TTL. Returns false if the lock key is gone, i.e. the
    /// lease already expired and the chunk is stealable.
    pub async fn renew_lock(&self, chunk_id: u64) -> Result<bool, MigrateError> {
        let renewed = self
            .coord
            .expire(&self.lock_key(chunk_id), self.lock_ttl_secs)
            .await?;
        if !renewed {
            warn!(chunk_id, "lease renewal found no lock key; lease lost");
        }
        Ok(renewed)
    }

    /// Merge the chunk's result counters, mark it completed, release the lock.
    #[instrument(skip(self, result))]
    pub async fn mark_chunk_completed(
        &self,
        chunk_id: u64,
        result: &ChunkMetrics,
    ) -> Result<(), MigrateError> {
        let mut state = self.fetch_chunk(chunk_id).await?;
        state.metrics.merge(result);
        state.status = ChunkStatus::Completed;
        state.last_update = Some(Utc::now());
        self.store_chunk(&state).await?;
        self.coord.del(&self.lock_key(chunk_id)).await?;
        info!(
            chunk_id,
            processed = state.metrics.processed,
            errors = state.metrics.errors,
            "chunk completed"
        );
        Ok(())
    }

    /// Revert a chunk to `pending` so another worker (or this one, later) can
    /// retry it, then release the lock.
    #[instrument(skip(self))]
    pub async fn mark_chunk_pending(&self, chunk_id: u64) -> Result<(), MigrateError> {
        let mut state = self.fetch_chunk(chunk_id).await?;
        state.status = ChunkStatus::Pending;
        state.worker_id = None;
        state.last_update = Some(Utc::now());
        self.store_chunk(&state).await?;
        self.coord.del(&self.lock_key(chunk_id)).await?;
        info!(chunk_id, "chunk reverted to pending");
        Ok(())
    }

    /// True iff the map is non-empty and every entry is completed.
    pub async fn all_chunks_completed(&self) -> Result<bool, MigrateError> {
        let chunks = self.load_chunks().await?;
        Ok(!chunks.is_empty()
            && chunks
                .values()
                .all(|c| c.status == ChunkStatus::Completed))
    }

    pub async fn get_progress(&self) -> Result<Progress, MigrateError> {
        let chunks = self.load_chunks().await?;
        Ok(summarize(&chunks))
    }

    /// Unconditionally delete all three key families.
    pub async fn reset(&self) -> Result<(), MigrateError> {
        self.coord.del(&self.chunks_key).await?;
        self.coord.del(&self.state_key).await?;
        let removed = self
            .coord
            .delete_matching(&format!("{}*", self.lock_prefix))
            .await?;
        info!(lock_keys_removed = removed, "coordination state reset");
        Ok(())
    }

    async fn fetch_chunk(&self, chunk_id: u64) -> Result<ChunkState, MigrateError> {
        let raw = self
            .coord
            .hash_get(&self.chunks_key, &chunk_id.to_string())
            .await?
            .ok_or_else(|| {
                MigrateError::CorruptState(format!("chunk {chunk_id} missing from chunk map"))
            })?;
        serde_json::from_str(&raw).map_err(|e| {
            MigrateError::CorruptState(format!("chunk entry {chunk_id} undecodable: {e}"))
        })
    }

    async fn store_chunk(&self, state: &ChunkState) -> Result<(), MigrateError> {
        let raw = serde_json::to_string(state)?;
        self.coord
            .hash_set(&self.chunks_key, &state.chunk_id.to_string(), &raw)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_total_exactly() {
        assert!(partition(0, 500).is_empty());

        let windows = partition(10, 3);
        assert_eq!(
            windows,
            vec![(0, 0, 3), (1, 3, 6), (2, 6, 9), (3, 9, 10)]
        );

        let windows = partition(1000, 500);
        assert_eq!(windows, vec![(0, 0, 500), (1, 500, 1000)]);
    }

    #[test]
    fn chunk_state_round_trips_with_flattened_metrics() {
        let state = ChunkState {
            chunk_id: 7,
            start_offset: 3500,
            end_offset: 4000,
            status: ChunkStatus::Processing,
            worker_id: Some("worker-abc".into()),
            last_update: Some(Utc::now()),
            metrics: ChunkMetrics {
                processed: 40,
                errors: 2,
                ..ChunkMetrics::default()
            },
        };
        let raw = serde_json::to_string(&state).unwrap();
        assert!(raw.contains("\"status\":\"processing\""));
        assert!(raw.contains("\"processed\":40"));

        let back: ChunkState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.chunk_id, 7);
        assert_eq!(back.status, ChunkStatus::Processing);
        assert_eq!(back.metrics.processed, 40);
        assert_eq!(back.metrics.errors, 2);
    }

    #[test]
    fn decodes_minimal_legacy_entry() {
        // Entries written before a counter existed must still decode.
        let raw = r#"{"chunk_id":0,"start_offset":0,"end_offset":500,"status":"pending"}"#;
        let state: ChunkState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.status, ChunkStatus::Pending);
        assert_eq!(state.metrics, ChunkMetrics::default());
        assert!(state.worker_id.is_none());
    }

    #[test]
    fn metrics_merge_is_field_wise() {
        let mut a = ChunkMetrics {
            processed: 10,
            products_created: 4,
            errors: 1,
            ..ChunkMetrics::default()
        };
        let b = ChunkMetrics {
            processed: 5,
            products_updated: 3,
            errors: 2,
            ..ChunkMetrics::default()
        };
        a.merge(&b);
        assert_eq!(a.processed, 15);
        assert_eq!(a.products_created, 4);
        assert_eq!(a.products_updated, 3);
        assert_eq!(a.errors, 3);
    }

    #[test]
    fn summarize_counts_statuses_and_totals() {
        let mut chunks = BTreeMap::new();
        for (id, status, processed) in [
            (0u64, ChunkStatus::Completed, 500u64),
            (1, ChunkStatus::Processing, 120),
            (2, ChunkStatus::Pending, 0),
        ] {
            chunks.insert(
                id,
                ChunkState {
                    chunk_id: id,
                    start_offset: id * 500,
                    end_offset: (id + 1) * 500,
                    status,
                    worker_id: None,
                    last_update: None,
                    metrics: ChunkMetrics {
                        processed,
                        ..ChunkMetrics::default()
                    },
                },
            );
        }
        let p = summarize(&chunks);
        assert_eq!(p.total_chunks, 3);
        assert_eq!(p.pending, 1);
        assert_eq!(p.processing, 1);
        assert_eq!(p.completed, 1);
        assert_eq!(p.totals.processed, 620);
    }

    #[test]
    fn empty_map_summarizes_to_zero() {
        let p = summarize(&BTreeMap::new());
        assert_eq!(p.total_chunks, 0);
        assert_eq!(p.completed, 0);
    }
}
