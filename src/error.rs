//! Error taxonomy for the migration engine.
//!
//! Record-level failures (`ReferenceMissing`, `SourceDataMalformed`,
//! `TargetWriteConflict`) are caught inside the per-record pipeline, counted
//! and logged; everything else bubbles out of `process_chunk` and causes the
//! chunk to be reverted to `pending`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// Missing or invalid env var, unreadable snapshot file. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The coordination service cannot be reached. Fatal to the worker.
    #[error("coordination service unavailable: {0}")]
    CoordinationUnavailable(#[from] redis::RedisError),

    /// A required read-only reference row (country, platform-country,
    /// base-category) is absent from the target store.
    #[error("missing reference: {0}")]
    ReferenceMissing(String),

    /// Unparseable provider / gallery / category blob in a source record.
    #[error("malformed source data: {0}")]
    SourceDataMalformed(String),

    /// An insert violated a unique constraint in the target store.
    #[error("target write conflict: {0}")]
    TargetWriteConflict(sqlx::Error),

    /// Connection loss, timeout, or any other store-level failure. At the
    /// chunk level this releases the lease and re-queues the chunk.
    #[error("transient store error: {0}")]
    TransientStore(sqlx::Error),

    /// Invalid state persisted in the coordination service (e.g. a chunk
    /// entry that no longer deserializes).
    #[error("corrupt coordination state: {0}")]
    CorruptState(String),
}

impl MigrateError {
    /// Whether the error is scoped to a single record (counted, logged,
    /// skipped) as opposed to poisoning the whole chunk.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            MigrateError::ReferenceMissing(_)
                | MigrateError::SourceDataMalformed(_)
                | MigrateError::TargetWriteConflict(_)
        )
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            // Class 23 = integrity constraint violation (unique, not-null,
            // foreign-key). These are properties of the row, not the store,
            // so they stay record-scoped instead of poisoning the chunk.
            if db.code().is_some_and(|c| c.starts_with("23")) {
                return MigrateError::TargetWriteConflict(err);
            }
        }
        MigrateError::TransientStore(err)
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::SourceDataMalformed(err.to_string())
    }
}

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_scoped_classification() {
        assert!(MigrateError::ReferenceMissing("CO".into()).is_record_scoped());
        assert!(MigrateError::SourceDataMalformed("bad gallery".into()).is_record_scoped());
        assert!(!MigrateError::Configuration("missing REDIS_URL".into()).is_record_scoped());
        assert!(!MigrateError::CorruptState("chunk 7".into()).is_record_scoped());
    }

    #[test]
    fn json_errors_map_to_malformed_source() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            MigrateError::from(err),
            MigrateError::SourceDataMalformed(_)
        ));
    }
}
