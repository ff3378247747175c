//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};
use relmap_codec::Row;
use std::fmt;

/// How primary keys come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// The caller generates ids from its own per-type sequences before the
    /// first write.
    ClientSequence,
    /// The backend assigns ids via [`StorageBackend::assign_id`].
    StorageAssigned,
}

/// Handle for an open backend transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(u64);

impl TxHandle {
    /// Creates a handle from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// A row store consumed by the persistence core.
///
/// # Invariants
///
/// - `get_by_key` and `get_by_foreign_key` see committed state only
/// - writes and deletes buffered in a transaction become visible atomically
///   at `commit`; `rollback` discards them with no observable effect
/// - a handle passed to `commit` or `rollback` is finished and must be
///   rejected afterwards
///
/// # Implementors
///
/// - [`crate::MemoryBackend`] - in-memory reference implementation
pub trait StorageBackend: Send + Sync {
    /// Returns the id-generation mode of this backend.
    fn id_generation(&self) -> IdGeneration;

    /// Assigns the next id in `entity`'s namespace.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::IdAssignmentUnsupported`] on backends in
    /// `ClientSequence` mode.
    fn assign_id(&self, entity: &str) -> StorageResult<u64> {
        let _ = entity;
        Err(StorageError::IdAssignmentUnsupported)
    }

    /// Fetches a row by primary key.
    ///
    /// Returns `None` when no such row is committed.
    fn get_by_key(&self, entity: &str, id: u64) -> StorageResult<Option<Row>>;

    /// Fetches all committed rows of `entity` whose `fk_field` holds
    /// `fk_value`, ordered by id.
    fn get_by_foreign_key(&self, entity: &str, fk_field: &str, fk_value: u64)
        -> StorageResult<Vec<Row>>;

    /// Lists all committed rows of `entity`, ordered by id.
    fn scan(&self, entity: &str) -> StorageResult<Vec<Row>>;

    /// Begins a new transaction.
    fn begin(&self) -> StorageResult<TxHandle>;

    /// Buffers an insert-or-update of `row` in the transaction.
    fn write(&self, tx: TxHandle, row: &Row) -> StorageResult<()>;

    /// Buffers a delete of (entity, id) in the transaction.
    fn delete(&self, tx: TxHandle, entity: &str, id: u64) -> StorageResult<()>;

    /// Applies all buffered operations atomically and finishes the handle.
    fn commit(&self, tx: TxHandle) -> StorageResult<()>;

    /// Discards all buffered operations and finishes the handle.
    fn rollback(&self, tx: TxHandle) -> StorageResult<()>;
}
