//! In-memory storage backend.

use crate::backend::{IdGeneration, StorageBackend, TxHandle};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use relmap_codec::{decode_row, encode_row, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// A buffered operation inside an open transaction.
#[derive(Debug, Clone)]
enum PendingOp {
    /// Insert or update a row (stored pre-encoded).
    Write {
        entity: String,
        id: u64,
        bytes: Vec<u8>,
    },
    /// Delete a row.
    Delete { entity: String, id: u64 },
}

/// Fault-injection knobs, used by tests to exercise flush atomicity.
#[derive(Debug, Default)]
struct Faults {
    /// Remaining writes before the next write is rejected.
    fail_after_writes: Option<u32>,
    /// Reject the next commit.
    fail_next_commit: bool,
}

/// An in-memory storage backend.
///
/// Rows are stored as canonical CBOR bytes keyed by (entity, id), so scans
/// come back ordered by id. Writes and deletes are buffered per transaction
/// and applied atomically at commit; reads always see committed state only.
///
/// # Thread Safety
///
/// The backend is thread-safe and intended to be shared across sessions.
///
/// # Fault Injection
///
/// [`fail_after_writes`](MemoryBackend::fail_after_writes) and
/// [`fail_next_commit`](MemoryBackend::fail_next_commit) let tests force a
/// storage failure at a chosen point in a flush. A failed commit leaves the
/// transaction open so the caller can still roll it back.
#[derive(Debug)]
pub struct MemoryBackend {
    mode: IdGeneration,
    /// Committed rows: (entity, id) -> canonical bytes.
    committed: RwLock<BTreeMap<(String, u64), Vec<u8>>>,
    /// Open transactions and their buffered operations.
    pending: Mutex<HashMap<u64, Vec<PendingOp>>>,
    /// Per-entity id sequences (storage-assigned mode).
    next_ids: Mutex<HashMap<String, u64>>,
    next_tx: AtomicU64,
    faults: Mutex<Faults>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates a backend that expects caller-generated ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(IdGeneration::ClientSequence)
    }

    /// Creates a backend that assigns ids itself.
    #[must_use]
    pub fn storage_assigned() -> Self {
        Self::with_mode(IdGeneration::StorageAssigned)
    }

    fn with_mode(mode: IdGeneration) -> Self {
        Self {
            mode,
            committed: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_ids: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Rejects the write after `n` more writes succeed.
    pub fn fail_after_writes(&self, n: u32) {
        self.faults.lock().fail_after_writes = Some(n);
    }

    /// Rejects the next commit.
    pub fn fail_next_commit(&self) {
        self.faults.lock().fail_next_commit = true;
    }

    /// Clears all injected faults.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Returns the number of committed rows across all entities.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.committed.read().len()
    }

    fn take_pending(&self, tx: TxHandle) -> StorageResult<Vec<PendingOp>> {
        self.pending
            .lock()
            .remove(&tx.raw())
            .ok_or(StorageError::UnknownTransaction { tx: tx.raw() })
    }
}

impl StorageBackend for MemoryBackend {
    fn id_generation(&self) -> IdGeneration {
        self.mode
    }

    fn assign_id(&self, entity: &str) -> StorageResult<u64> {
        if self.mode != IdGeneration::StorageAssigned {
            return Err(StorageError::IdAssignmentUnsupported);
        }
        let mut next_ids = self.next_ids.lock();
        let next = next_ids.entry(entity.to_string()).or_insert(1);
        let id = *next;
        *next += 1;
        Ok(id)
    }

    fn get_by_key(&self, entity: &str, id: u64) -> StorageResult<Option<Row>> {
        let committed = self.committed.read();
        match committed.get(&(entity.to_string(), id)) {
            Some(bytes) => Ok(Some(decode_row(bytes)?)),
            None => Ok(None),
        }
    }

    fn get_by_foreign_key(
        &self,
        entity: &str,
        fk_field: &str,
        fk_value: u64,
    ) -> StorageResult<Vec<Row>> {
        let mut rows = Vec::new();
        for row in self.scan(entity)? {
            if row.foreign_key(fk_field) == Some(fk_value) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn scan(&self, entity: &str) -> StorageResult<Vec<Row>> {
        let committed = self.committed.read();
        let mut rows = Vec::new();
        for ((name, _), bytes) in committed.iter() {
            if name == entity {
                rows.push(decode_row(bytes)?);
            }
        }
        Ok(rows)
    }

    fn begin(&self) -> StorageResult<TxHandle> {
        let tx = TxHandle::new(self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.pending.lock().insert(tx.raw(), Vec::new());
        Ok(tx)
    }

    fn write(&self, tx: TxHandle, row: &Row) -> StorageResult<()> {
        {
            let mut faults = self.faults.lock();
            if let Some(remaining) = faults.fail_after_writes.as_mut() {
                if *remaining == 0 {
                    return Err(StorageError::write_rejected(
                        row.entity.clone(),
                        row.id,
                        "injected write fault",
                    ));
                }
                *remaining -= 1;
            }
        }

        let bytes = encode_row(row)?;
        let mut pending = self.pending.lock();
        let buffer = pending
            .get_mut(&tx.raw())
            .ok_or(StorageError::UnknownTransaction { tx: tx.raw() })?;
        buffer.push(PendingOp::Write {
            entity: row.entity.clone(),
            id: row.id,
            bytes,
        });
        Ok(())
    }

    fn delete(&self, tx: TxHandle, entity: &str, id: u64) -> StorageResult<()> {
        let mut pending = self.pending.lock();
        let buffer = pending
            .get_mut(&tx.raw())
            .ok_or(StorageError::UnknownTransaction { tx: tx.raw() })?;
        buffer.push(PendingOp::Delete {
            entity: entity.to_string(),
            id,
        });
        Ok(())
    }

    fn commit(&self, tx: TxHandle) -> StorageResult<()> {
        {
            let mut faults = self.faults.lock();
            if faults.fail_next_commit {
                faults.fail_next_commit = false;
                // Leave the transaction open so rollback still works.
                return Err(StorageError::commit_rejected(tx.raw(), "injected commit fault"));
            }
        }

        let ops = self.take_pending(tx)?;
        let mut committed = self.committed.write();
        for op in ops {
            match op {
                PendingOp::Write { entity, id, bytes } => {
                    committed.insert((entity, id), bytes);
                }
                PendingOp::Delete { entity, id } => {
                    committed.remove(&(entity, id));
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, tx: TxHandle) -> StorageResult<()> {
        self.take_pending(tx)?;
        Ok(())
    }
}
