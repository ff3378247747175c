//! # relmap Storage
//!
//! Storage collaborator trait and implementations for relmap.
//!
//! This crate defines the narrow interface the persistence core needs from
//! a relational store: fetch a row by primary key, fetch rows by an owning
//! foreign key, and apply a batch of writes and deletes inside one
//! transaction. Backends do not know about relationships, cascades, or
//! sessions - that interpretation belongs to `relmap_core`.
//!
//! ## Design Principles
//!
//! - Backends are row stores keyed by (entity, id)
//! - All writes for one flush happen inside a single backend transaction
//! - Nothing written in an open transaction is visible until commit
//! - Must be `Send + Sync`; concurrent sessions share one backend
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - transaction-buffered in-memory store, with fault
//!   injection hooks for exercising flush atomicity in tests
//!
//! ## Example
//!
//! ```
//! use relmap_codec::{Row, Value};
//! use relmap_storage::{MemoryBackend, StorageBackend};
//!
//! let backend = MemoryBackend::new();
//! let tx = backend.begin().unwrap();
//! let mut row = Row::new("member", 1);
//! row.set("name", Value::text("Alice"));
//! backend.write(tx, &row).unwrap();
//! backend.commit(tx).unwrap();
//!
//! assert_eq!(backend.get_by_key("member", 1).unwrap(), Some(row));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;

pub use backend::{IdGeneration, StorageBackend, TxHandle};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
