//! Error taxonomy shared by every memory component.

use keepsake_types::{KindError, RecordId};
use thiserror::Error;

/// Errors that can arise from memory operations.
///
/// Only [`MemoryError::StorageUnavailable`] and
/// [`MemoryError::MalformedRecord`] are fatal for a primary write. The other
/// variants are produced by best-effort auxiliary steps and are logged by
/// their callers rather than surfaced.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The SQLite medium could not be reached or rejected the statement.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),
    /// The optional semantic index is missing, erroring, or timed out.
    #[error("semantic index unavailable: {0}")]
    IndexUnavailable(String),
    /// A record referenced by a relation or access update no longer exists.
    #[error("memory record {0} not found")]
    NotFound(RecordId),
    /// The record was rejected before reaching the store.
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KindError> for MemoryError {
    fn from(err: KindError) -> Self {
        MemoryError::MalformedRecord(err.to_string())
    }
}

impl MemoryError {
    /// Whether the error must be surfaced to the caller of a write rather
    /// than merely logged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoryError::StorageUnavailable(_)
                | MemoryError::MalformedRecord(_)
                | MemoryError::Serialization(_)
                | MemoryError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_errors_become_malformed_records() {
        let err: MemoryError = KindError::Empty.into();
        assert!(matches!(err, MemoryError::MalformedRecord(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn auxiliary_errors_are_not_fatal() {
        assert!(!MemoryError::NotFound(7).is_fatal());
        assert!(!MemoryError::IndexUnavailable("offline".into()).is_fatal());
        assert!(MemoryError::NotFound(7).to_string().contains('7'));
    }
}
