//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] relmap_codec::CodecError),

    /// The transaction handle is unknown or already finished.
    #[error("unknown or finished transaction: {tx}")]
    UnknownTransaction {
        /// The offending handle.
        tx: u64,
    },

    /// A write was rejected by the backend.
    #[error("write rejected for {entity}#{id}: {reason}")]
    WriteRejected {
        /// Entity type name of the rejected row.
        entity: String,
        /// Id of the rejected row.
        id: u64,
        /// Backend-reported reason.
        reason: String,
    },

    /// A commit was rejected by the backend.
    #[error("commit rejected for transaction {tx}: {reason}")]
    CommitRejected {
        /// The transaction that failed to commit.
        tx: u64,
        /// Backend-reported reason.
        reason: String,
    },

    /// The backend does not assign ids.
    ///
    /// Returned by [`crate::StorageBackend::assign_id`] on backends that
    /// expect the caller to generate ids (`ClientSequence` mode).
    #[error("backend does not assign ids")]
    IdAssignmentUnsupported,
}

impl StorageError {
    /// Creates a write rejected error.
    pub fn write_rejected(entity: impl Into<String>, id: u64, reason: impl Into<String>) -> Self {
        Self::WriteRejected {
            entity: entity.into(),
            id,
            reason: reason.into(),
        }
    }

    /// Creates a commit rejected error.
    pub fn commit_rejected(tx: u64, reason: impl Into<String>) -> Self {
        Self::CommitRejected {
            tx,
            reason: reason.into(),
        }
    }
}
