//! # relmap Core
//!
//! A minimal object-relational persistence core.
//!
//! This crate provides:
//! - Identity registry: per-type id namespaces, ids assigned once and
//!   never reused
//! - Relationship graph: declarative cardinality, ownership, cascade, and
//!   fetch metadata, validated eagerly at startup
//! - Lazy materialization: relationship references defer their fetch
//!   until first access, at most once per session
//! - Cascade engine: cycle-safe propagation of persist/merge/remove along
//!   owned relationships
//! - Unit-of-work session: identity map, dirty detection against
//!   canonical snapshots, transactional flush with full rollback
//! - DTO projection: a one-way boundary keeping entity shape out of
//!   external contracts
//!
//! The relational store itself is a collaborator behind
//! [`relmap_storage::StorageBackend`]; this crate owns all relationship
//! and lifecycle interpretation.
//!
//! ## Example
//!
//! ```
//! use relmap_core::{EntityType, Persistence, SchemaBuilder};
//! use relmap_codec::Value;
//! use relmap_storage::MemoryBackend;
//! use std::sync::Arc;
//!
//! const MEMBER: EntityType = EntityType::new("member");
//!
//! let schema = SchemaBuilder::new().entity(MEMBER).build()?;
//! let persistence = Persistence::new(schema, Arc::new(MemoryBackend::new()));
//!
//! let mut session = persistence.session();
//! let m = session.create(MEMBER)?;
//! session.set_field(m, "name", Value::text("Alice"))?;
//! session.persist(m)?;
//! session.flush()?;
//! assert!(session.entity(m)?.id().is_some());
//! # Ok::<(), relmap_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cascade;
mod config;
mod entity;
mod error;
mod identity;
mod projection;
mod schema;
mod session;
mod types;

pub use config::SessionConfig;
pub use entity::{Entity, EntityStatus, LoadState, RelationRef, RelationValue};
pub use error::{CoreError, CoreResult};
pub use identity::IdentityRegistry;
pub use projection::{Projector, RequestShape, ResponseProjection};
pub use schema::{
    Cardinality, CascadeOp, CascadeSet, Fetch, Ownership, RelationshipDef, Schema, SchemaBuilder,
};
pub use session::{Persistence, Session};
pub use types::{EntityId, EntityKey, EntityType};
