//! Error types for the relmap core.

use crate::types::{EntityId, EntityType};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core persistence operations.
///
/// `SchemaInconsistency` is fatal and only ever surfaces from schema
/// construction at startup. Everything else is returned to the caller of
/// the operation that detected it; the core never retries on its own.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage collaborator error.
    #[error("storage error: {0}")]
    Storage(#[from] relmap_storage::StorageError),

    /// Row codec error.
    #[error("codec error: {0}")]
    Codec(#[from] relmap_codec::CodecError),

    /// An id is already bound to a different in-memory instance.
    #[error("identity conflict: {entity}#{id} is already bound")]
    IdentityConflict {
        /// Entity type of the conflicting id.
        entity: EntityType,
        /// The conflicting id.
        id: EntityId,
    },

    /// The relationship graph is misdeclared. Detected at startup, fatal.
    #[error("schema inconsistency: {message}")]
    SchemaInconsistency {
        /// Description of the misdeclaration.
        message: String,
    },

    /// A proxy or entity was accessed outside a live session, or after its
    /// owner was removed or detached.
    #[error("stale reference access: {entity} (id {id:?})")]
    StaleReferenceAccess {
        /// Entity type of the stale reference.
        entity: EntityType,
        /// Id, when one had been assigned.
        id: Option<EntityId>,
    },

    /// An uncascaded relationship still references an entity scheduled for
    /// removal, or an inverse-side mutation was never reflected on the
    /// owning side.
    #[error("dangling reference: {entity} (id {id:?}) via relationship `{relation}`")]
    DanglingReference {
        /// Entity still referenced (or holding the unsynchronized state).
        entity: EntityType,
        /// Its id, when one had been assigned.
        id: Option<EntityId>,
        /// The relationship that blocks the flush.
        relation: String,
    },

    /// A flush could not complete. All in-memory and storage state has
    /// been rolled back to the pre-flush snapshot.
    #[error("flush failed on {entity} (id {id:?}): {source}")]
    FlushFailed {
        /// Entity type of the first offending entity.
        entity: EntityType,
        /// Its id, when one had been assigned.
        id: Option<EntityId>,
        /// Underlying cause.
        #[source]
        source: Box<CoreError>,
    },

    /// Lookup miss. Recoverable; the caller decides the response.
    #[error("not found: {entity}#{id}")]
    NotFound {
        /// Entity type searched.
        entity: EntityType,
        /// Id that was not found.
        id: EntityId,
    },

    /// A request shape failed boundary validation.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the violation.
        message: String,
    },

    /// Operation not permitted in the current entity or session state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an identity conflict error.
    #[must_use]
    pub fn identity_conflict(entity: EntityType, id: EntityId) -> Self {
        Self::IdentityConflict { entity, id }
    }

    /// Creates a schema inconsistency error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaInconsistency {
            message: message.into(),
        }
    }

    /// Creates a stale reference access error.
    #[must_use]
    pub fn stale(entity: EntityType, id: Option<EntityId>) -> Self {
        Self::StaleReferenceAccess { entity, id }
    }

    /// Creates a dangling reference error.
    pub fn dangling(entity: EntityType, id: Option<EntityId>, relation: impl Into<String>) -> Self {
        Self::DanglingReference {
            entity,
            id,
            relation: relation.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(entity: EntityType, id: EntityId) -> Self {
        Self::NotFound { entity, id }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Wraps a flush error with the offending entity.
    #[must_use]
    pub fn flush_failed(entity: EntityType, id: Option<EntityId>, source: CoreError) -> Self {
        Self::FlushFailed {
            entity,
            id,
            source: Box::new(source),
        }
    }
}
