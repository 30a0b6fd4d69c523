//! Snapshot backend: a pre-exported JSON array of legacy products, loaded
//! fully on first use and cached for the lifetime of the process so every
//! chunk slices the same in-memory sequence.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::MigrateError;
use crate::source::{SourceProduct, SourceRead};

static SNAPSHOT: OnceCell<Arc<Vec<SourceProduct>>> = OnceCell::const_new();

pub struct SnapshotReader {
    records: Arc<Vec<SourceProduct>>,
}

impl SnapshotReader {
    /// Load (once per process) and wrap the snapshot at `path`.
    pub async fn open(path: &str) -> Result<Self, MigrateError> {
        let path = path.to_string();
        let records = SNAPSHOT
            .get_or_try_init(|| async move { load_snapshot(&path).await.map(Arc::new) })
            .await?
            .clone();
        Ok(Self { records })
    }
}

async fn load_snapshot(path: &str) -> Result<Vec<SourceProduct>, MigrateError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MigrateError::Configuration(format!("cannot read snapshot {path}: {e}")))?;

    let parsed: Value = serde_json::from_str(&raw)
        .map_err(|e| MigrateError::Configuration(format!("snapshot {path} is not JSON: {e}")))?;

    // Either a bare array or the same array wrapped in a one-field object.
    let entries = match parsed {
        Value::Array(items) => items,
        Value::Object(map) => match map.into_iter().next() {
            Some((_, Value::Array(items))) => items,
            _ => {
                return Err(MigrateError::Configuration(format!(
                    "snapshot {path} does not contain a product array"
                )))
            }
        },
        _ => {
            return Err(MigrateError::Configuration(format!(
                "snapshot {path} does not contain a product array"
            )))
        }
    };

    let total = entries.len();
    let mut records = Vec::with_capacity(total);
    let mut dropped_no_external_id = 0usize;
    let mut dropped_undecodable = 0usize;
    for entry in entries {
        match serde_json::from_value::<SourceProduct>(entry) {
            Ok(p) => {
                if p.external_id.as_deref().map_or(true, |v| v.trim().is_empty()) {
                    dropped_no_external_id += 1;
                    warn!(source_id = %p.source_id, "snapshot entry missing external_id; dropped");
                    continue;
                }
                records.push(p);
            }
            Err(e) => {
                dropped_undecodable += 1;
                warn!(error = %e, "undecodable snapshot entry; dropped");
            }
        }
    }

    info!(
        path,
        total,
        kept = records.len(),
        dropped_no_external_id,
        dropped_undecodable,
        "snapshot loaded"
    );
    Ok(records)
}

#[async_trait]
impl SourceRead for SnapshotReader {
    async fn count(&self) -> Result<u64, MigrateError> {
        Ok(self.records.len() as u64)
    }

    async fn read(&self, skip: u64, take: u64) -> Result<Vec<SourceProduct>, MigrateError> {
        let start = (skip as usize).min(self.records.len());
        let end = (start + take as usize).min(self.records.len());
        Ok(self.records[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TempFile(PathBuf);

    impl TempFile {
        fn with_contents(contents: &str) -> Self {
            static SEQ: AtomicUsize = AtomicUsize::new(0);
            let path = std::env::temp_dir().join(format!(
                "snapshot-test-{}-{}.json",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }

        fn path(&self) -> String {
            self.0.to_string_lossy().into_owned()
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[tokio::test]
    async fn loads_bare_array_and_drops_missing_external_id() {
        let file = TempFile::with_contents(
            r#"[
                {"source_id": "P1", "external_id": "X1", "platform_name": "dropi"},
                {"source_id": "P2", "platform_name": "dropi"},
                {"source_id": "P3", "external_id": "  ", "platform_name": "dropi"}
            ]"#,
        );
        let records = load_snapshot(&file.path()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id, "P1");
    }

    #[tokio::test]
    async fn unwraps_one_field_object() {
        let file =
            TempFile::with_contents(r#"{"products": [{"source_id": "P1", "external_id": "X1"}]}"#);
        let records = load_snapshot(&file.path()).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_array_payload() {
        let file = TempFile::with_contents(r#"{"count": 3}"#);
        assert!(matches!(
            load_snapshot(&file.path()).await,
            Err(MigrateError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_a_configuration_error() {
        let err = load_snapshot("/nonexistent/products.json")
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }
}
