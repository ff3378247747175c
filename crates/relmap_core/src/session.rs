//! Unit-of-work session and persistence facade.

use crate::cascade;
use crate::config::SessionConfig;
use crate::entity::{Entity, EntityStatus, LoadState, RelationRef, RelationValue};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityRegistry;
use crate::schema::{Cardinality, CascadeOp, Ownership, RelationshipDef, Schema};
use crate::types::{EntityId, EntityKey, EntityType};
use relmap_codec::{encode_row, Row, Value};
use relmap_storage::{IdGeneration, StorageBackend, TxHandle};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// The host-facing persistence handle.
///
/// Owns the validated schema, the storage collaborator, and the identity
/// registry shared by all sessions. Sessions are opened per logical
/// caller (request start) and closed when the caller is done.
pub struct Persistence {
    schema: Arc<Schema>,
    backend: Arc<dyn StorageBackend>,
    registry: Arc<IdentityRegistry>,
}

impl Persistence {
    /// Creates a persistence handle from a validated schema and a backend.
    pub fn new(schema: Schema, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            schema: Arc::new(schema),
            backend,
            registry: Arc::new(IdentityRegistry::new()),
        }
    }

    /// Returns the relationship graph.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Opens a session with default configuration.
    #[must_use]
    pub fn session(&self) -> Session {
        self.session_with(SessionConfig::default())
    }

    /// Opens a session with the given configuration.
    #[must_use]
    pub fn session_with(&self, config: SessionConfig) -> Session {
        debug!(label = config.label.as_deref().unwrap_or(""), "session opened");
        Session {
            schema: Arc::clone(&self.schema),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            config,
            arena: HashMap::new(),
            identity: HashMap::new(),
            snapshots: HashMap::new(),
            managed: BTreeSet::new(),
            newly_created: BTreeSet::new(),
            removed: BTreeSet::new(),
            pending_ops: Vec::new(),
            next_key: 1,
            open: true,
        }
    }
}

/// Pre-flush state retained for rollback.
struct Backup {
    arena: HashMap<EntityKey, Entity>,
    identity: HashMap<(EntityType, EntityId), EntityKey>,
    snapshots: HashMap<EntityKey, Vec<u8>>,
    managed: BTreeSet<EntityKey>,
    newly_created: BTreeSet<EntityKey>,
    removed: BTreeSet<EntityKey>,
    pending_ops: Vec<(CascadeOp, EntityKey)>,
}

/// Result of the write phase of a flush.
struct FlushPlan {
    /// Snapshots to install after commit.
    staged_snapshots: HashMap<EntityKey, Vec<u8>>,
    /// Ids claimed from the registry during this flush.
    assigned: Vec<(EntityType, EntityId)>,
}

/// A transactional unit of work.
///
/// Tracks every entity loaded or created within one logical scope:
/// - the identity map guarantees at most one instance per (type, id)
/// - relationship references materialize lazily, at most one fetch each
/// - `flush` writes all new, dirty, and removed entities inside a single
///   storage transaction, or rolls everything back
///
/// A session is single-threaded: one logical caller at a time. Concurrent
/// callers open separate sessions over the same [`Persistence`].
pub struct Session {
    schema: Arc<Schema>,
    backend: Arc<dyn StorageBackend>,
    registry: Arc<IdentityRegistry>,
    config: SessionConfig,
    arena: HashMap<EntityKey, Entity>,
    identity: HashMap<(EntityType, EntityId), EntityKey>,
    /// Canonical row bytes at load or last flush, for dirty detection.
    snapshots: HashMap<EntityKey, Vec<u8>>,
    managed: BTreeSet<EntityKey>,
    newly_created: BTreeSet<EntityKey>,
    removed: BTreeSet<EntityKey>,
    /// Root operations issued since the last flush.
    pending_ops: Vec<(CascadeOp, EntityKey)>,
    next_key: u64,
    open: bool,
}

impl Session {
    /// Returns the relationship graph.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns whether the session is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Closes the session, detaching every tracked entity.
    ///
    /// Pending, unflushed operations are discarded. Any later access
    /// through this session fails with `StaleReferenceAccess`.
    pub fn close(&mut self) {
        for entity in self.arena.values_mut() {
            entity.set_status(EntityStatus::Detached);
        }
        self.pending_ops.clear();
        self.open = false;
        debug!(
            label = self.config.label.as_deref().unwrap_or(""),
            "session closed"
        );
    }

    // ---- loading -------------------------------------------------------

    /// Loads the entity with the given id.
    ///
    /// Returns the session's existing instance when (type, id) is already
    /// in the identity map; otherwise fetches the row, registers it, and
    /// materializes eager relationships before returning.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] when no such row exists.
    pub fn get(&mut self, etype: EntityType, id: EntityId) -> CoreResult<EntityKey> {
        self.ensure_open_for(etype, Some(id))?;
        self.ensure_known_type(etype)?;
        if let Some(key) = self.identity.get(&(etype, id)) {
            return Ok(*key);
        }
        match self.backend.get_by_key(etype.name(), id.raw())? {
            Some(row) => self.register_row(etype, row, 0),
            None => Err(CoreError::not_found(etype, id)),
        }
    }

    /// Returns the session key bound to (type, id), if the entity is
    /// already tracked.
    #[must_use]
    pub fn lookup(&self, etype: EntityType, id: EntityId) -> Option<EntityKey> {
        self.identity.get(&(etype, id)).copied()
    }

    /// Loads all entities of a type, ordered by id.
    pub fn list(&mut self, etype: EntityType) -> CoreResult<Vec<EntityKey>> {
        self.ensure_open_for(etype, None)?;
        self.ensure_known_type(etype)?;
        let rows = self.backend.scan(etype.name())?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(self.register_row(etype, row, 0)?);
        }
        Ok(keys)
    }

    /// Registers a fetched row, reusing the existing instance if the
    /// identity map already tracks (type, id).
    fn register_row(&mut self, etype: EntityType, row: Row, depth: usize) -> CoreResult<EntityKey> {
        let id = EntityId::new(row.id);
        if let Some(existing) = self.identity.get(&(etype, id)) {
            return Ok(*existing);
        }

        let snapshot = encode_row(&row)?;
        let entity = Entity::from_row(&self.schema, etype, row);
        let key = self.alloc_key();
        self.arena.insert(key, entity);
        self.identity.insert((etype, id), key);
        self.snapshots.insert(key, snapshot);
        self.managed.insert(key);
        self.registry.observe(etype, id);
        trace!(entity = %etype, id = %id, "registered");

        if depth < self.config.eager_depth_limit {
            self.materialize_eager(key, depth)?;
        }
        Ok(key)
    }

    /// Materializes every eager relationship of `key`.
    fn materialize_eager(&mut self, key: EntityKey, depth: usize) -> CoreResult<()> {
        let etype = self.entity(key)?.entity_type();
        let eager: Vec<RelationshipDef> = self
            .schema
            .relationships_of(etype)
            .filter(|rel| rel.fetch == crate::schema::Fetch::Eager)
            .cloned()
            .collect();
        for rel in eager {
            let unloaded = matches!(
                self.entity(key)?.relation(rel.name).map(RelationRef::state),
                Some(LoadState::Unloaded)
            );
            if !unloaded {
                continue;
            }
            match rel.cardinality {
                Cardinality::ToOne => {
                    self.load_to_one(key, &rel, depth + 1)?;
                }
                Cardinality::ToMany => {
                    self.load_to_many(key, &rel, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    // ---- creation and lifecycle ---------------------------------------

    /// Creates a transient entity.
    ///
    /// The entity has no id and is not yet scheduled for persistence;
    /// call [`Session::persist`] to schedule it.
    pub fn create(&mut self, etype: EntityType) -> CoreResult<EntityKey> {
        self.ensure_open_for(etype, None)?;
        self.ensure_known_type(etype)?;
        let entity = Entity::transient(&self.schema, etype);
        let key = self.alloc_key();
        self.arena.insert(key, entity);
        Ok(key)
    }

    /// Schedules a transient entity (and everything reachable through
    /// `Persist`-cascading relationships) for insertion at the next flush.
    pub fn persist(&mut self, key: EntityKey) -> CoreResult<()> {
        let entity = self.entity(key)?;
        match entity.status() {
            EntityStatus::Transient => {
                self.newly_created.insert(key);
                self.pending_ops.push((CascadeOp::Persist, key));
                Ok(())
            }
            // Persisting an already-managed entity is a no-op; the dirty
            // check picks up its changes.
            EntityStatus::Managed => {
                self.pending_ops.push((CascadeOp::Persist, key));
                Ok(())
            }
            EntityStatus::Removed | EntityStatus::Detached => Err(CoreError::stale(
                entity.entity_type(),
                entity.id(),
            )),
        }
    }

    /// Schedules a merge from `key` along `Merge`-cascading
    /// relationships. Transient entities discovered by the closure are
    /// scheduled for insertion.
    pub fn merge(&mut self, key: EntityKey) -> CoreResult<()> {
        let entity = self.entity(key)?;
        match entity.status() {
            EntityStatus::Transient => {
                self.newly_created.insert(key);
                self.pending_ops.push((CascadeOp::Merge, key));
                Ok(())
            }
            EntityStatus::Managed => {
                self.pending_ops.push((CascadeOp::Merge, key));
                Ok(())
            }
            EntityStatus::Removed | EntityStatus::Detached => Err(CoreError::stale(
                entity.entity_type(),
                entity.id(),
            )),
        }
    }

    /// Schedules a managed entity (and everything reachable through
    /// `Remove`-cascading relationships) for deletion at the next flush.
    ///
    /// Removing an entity that was created but never flushed simply
    /// cancels its insertion.
    pub fn remove(&mut self, key: EntityKey) -> CoreResult<()> {
        let status = self.entity(key)?.status();
        match status {
            EntityStatus::Transient => {
                if self.newly_created.remove(&key) {
                    self.pending_ops.retain(|(_, root)| *root != key);
                    self.entity_mut(key)?.set_status(EntityStatus::Detached);
                    Ok(())
                } else {
                    Err(CoreError::invalid_operation(
                        "cannot remove a transient entity that was never persisted",
                    ))
                }
            }
            EntityStatus::Managed => {
                self.entity_mut(key)?.set_status(EntityStatus::Removed);
                self.removed.insert(key);
                self.pending_ops.push((CascadeOp::Remove, key));
                Ok(())
            }
            EntityStatus::Removed => Ok(()),
            EntityStatus::Detached => {
                let entity = self.entity(key)?;
                Err(CoreError::stale(entity.entity_type(), entity.id()))
            }
        }
    }

    // ---- field access --------------------------------------------------

    /// Returns a read-only view of an entity.
    ///
    /// # Errors
    ///
    /// `StaleReferenceAccess` once the session is closed.
    pub fn entity(&self, key: EntityKey) -> CoreResult<&Entity> {
        let entity = self
            .arena
            .get(&key)
            .ok_or_else(|| CoreError::invalid_operation("unknown entity key"))?;
        if !self.open {
            return Err(CoreError::stale(entity.entity_type(), entity.id()));
        }
        Ok(entity)
    }

    fn entity_mut(&mut self, key: EntityKey) -> CoreResult<&mut Entity> {
        if !self.open {
            if let Some(entity) = self.arena.get(&key) {
                return Err(CoreError::stale(entity.entity_type(), entity.id()));
            }
        }
        self.arena
            .get_mut(&key)
            .ok_or_else(|| CoreError::invalid_operation("unknown entity key"))
    }

    /// Returns a field value.
    pub fn field(&self, key: EntityKey, name: &str) -> CoreResult<Option<&Value>> {
        let entity = self.entity(key)?;
        if entity.status() == EntityStatus::Detached {
            return Err(CoreError::stale(entity.entity_type(), entity.id()));
        }
        Ok(entity.field(name))
    }

    /// Sets a field value, marking the entity dirty.
    pub fn set_field(
        &mut self,
        key: EntityKey,
        name: impl Into<String>,
        value: Value,
    ) -> CoreResult<()> {
        let entity = self.entity(key)?;
        match entity.status() {
            EntityStatus::Transient | EntityStatus::Managed => {
                self.entity_mut(key)?.set_field(name, value);
                Ok(())
            }
            EntityStatus::Removed => Err(CoreError::invalid_operation(
                "cannot mutate an entity scheduled for removal",
            )),
            EntityStatus::Detached => {
                Err(CoreError::stale(entity.entity_type(), entity.id()))
            }
        }
    }

    // ---- relationship access ------------------------------------------

    fn relationship_def(&self, etype: EntityType, name: &str) -> CoreResult<RelationshipDef> {
        self.schema
            .relationship(etype, name)
            .cloned()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("no relationship `{etype}.{name}`"))
            })
    }

    /// Guards proxy access: the owner must be live inside an open session.
    fn ensure_live_owner(&self, key: EntityKey) -> CoreResult<()> {
        let entity = self.entity(key)?;
        match entity.status() {
            EntityStatus::Transient | EntityStatus::Managed => Ok(()),
            EntityStatus::Removed | EntityStatus::Detached => {
                Err(CoreError::stale(entity.entity_type(), entity.id()))
            }
        }
    }

    /// Resolves a to-one relationship, materializing it on first access.
    pub fn to_one(&mut self, key: EntityKey, relation: &str) -> CoreResult<Option<EntityKey>> {
        self.ensure_live_owner(key)?;
        let etype = self.entity(key)?.entity_type();
        let rel = self.relationship_def(etype, relation)?;
        if rel.cardinality != Cardinality::ToOne {
            return Err(CoreError::invalid_operation(format!(
                "relationship `{etype}.{relation}` is not to-one"
            )));
        }
        match self.relation_state(key, relation)? {
            LoadState::Loaded(RelationValue::One(target)) => Ok(Some(target)),
            LoadState::Loaded(RelationValue::Many(_)) => unreachable!("to-one holds One"),
            LoadState::Empty => Ok(None),
            LoadState::Unloaded => self.load_to_one(key, &rel, 0),
            LoadState::Loading => Err(CoreError::invalid_operation(
                "re-entrant load of a relationship in flight",
            )),
        }
    }

    /// Resolves a to-many relationship, materializing it on first access.
    pub fn to_many(&mut self, key: EntityKey, relation: &str) -> CoreResult<Vec<EntityKey>> {
        self.ensure_live_owner(key)?;
        let etype = self.entity(key)?.entity_type();
        let rel = self.relationship_def(etype, relation)?;
        if rel.cardinality != Cardinality::ToMany {
            return Err(CoreError::invalid_operation(format!(
                "relationship `{etype}.{relation}` is not to-many"
            )));
        }
        match self.relation_state(key, relation)? {
            LoadState::Loaded(RelationValue::Many(targets)) => Ok(targets),
            LoadState::Loaded(RelationValue::One(_)) => unreachable!("to-many holds Many"),
            LoadState::Empty => Ok(Vec::new()),
            LoadState::Unloaded => self.load_to_many(key, &rel, 0),
            LoadState::Loading => Err(CoreError::invalid_operation(
                "re-entrant load of a relationship in flight",
            )),
        }
    }

    fn relation_state(&self, key: EntityKey, relation: &str) -> CoreResult<LoadState> {
        let entity = self.entity(key)?;
        entity
            .relation(relation)
            .map(|r| r.state().clone())
            .ok_or_else(|| CoreError::invalid_operation(format!("no relationship `{relation}`")))
    }

    fn set_relation_state(
        &mut self,
        key: EntityKey,
        relation: &str,
        state: LoadState,
    ) -> CoreResult<()> {
        self.entity_mut(key)?
            .relation_mut(relation)
            .ok_or_else(|| CoreError::invalid_operation(format!("no relationship `{relation}`")))?
            .set_state(state);
        Ok(())
    }

    /// Materializes a to-one reference: `Unloaded -> Loading -> Loaded |
    /// Empty`. The result is cached for the rest of the session.
    fn load_to_one(
        &mut self,
        key: EntityKey,
        rel: &RelationshipDef,
        depth: usize,
    ) -> CoreResult<Option<EntityKey>> {
        self.set_relation_state(key, rel.name, LoadState::Loading)?;
        match self.fetch_one(key, rel, depth) {
            Ok(target) => {
                trace!(relation = rel.name, found = target.is_some(), "to-one load");
                let state = match target {
                    Some(t) => LoadState::Loaded(RelationValue::One(t)),
                    None => LoadState::Empty,
                };
                self.set_relation_state(key, rel.name, state)?;
                Ok(target)
            }
            Err(err) => {
                // A failed fetch leaves the reference retryable.
                self.set_relation_state(key, rel.name, LoadState::Unloaded)?;
                Err(err)
            }
        }
    }

    fn fetch_one(
        &mut self,
        key: EntityKey,
        rel: &RelationshipDef,
        depth: usize,
    ) -> CoreResult<Option<EntityKey>> {
        let target = match rel.ownership {
            Ownership::Owning { fk_field } => {
                let fk = self
                    .entity(key)?
                    .field(fk_field)
                    .and_then(Value::as_id);
                match fk {
                    None => None,
                    Some(raw) => {
                        let target_id = EntityId::new(raw);
                        if let Some(existing) = self.identity.get(&(rel.target, target_id)) {
                            Some(*existing)
                        } else {
                            match self.backend.get_by_key(rel.target.name(), raw)? {
                                Some(row) => Some(self.register_row(rel.target, row, depth)?),
                                None => None,
                            }
                        }
                    }
                }
            }
            Ownership::Inverse { .. } => {
                let fk_field = self.inverse_fk_field(rel)?;
                match self.entity(key)?.id() {
                    None => None,
                    Some(own_id) => {
                        let rows = self.backend.get_by_foreign_key(
                            rel.target.name(),
                            fk_field,
                            own_id.raw(),
                        )?;
                        match rows.into_iter().next() {
                            Some(row) => Some(self.register_row(rel.target, row, depth)?),
                            None => None,
                        }
                    }
                }
            }
        };
        Ok(target)
    }

    /// Materializes a mapped-by collection via an indexed foreign-key
    /// fetch on the owning side.
    fn load_to_many(
        &mut self,
        key: EntityKey,
        rel: &RelationshipDef,
        depth: usize,
    ) -> CoreResult<Vec<EntityKey>> {
        self.set_relation_state(key, rel.name, LoadState::Loading)?;
        match self.fetch_many(key, rel, depth) {
            Ok(targets) => {
                trace!(relation = rel.name, count = targets.len(), "to-many load");
                let state = if targets.is_empty() {
                    LoadState::Empty
                } else {
                    LoadState::Loaded(RelationValue::Many(targets.clone()))
                };
                self.set_relation_state(key, rel.name, state)?;
                Ok(targets)
            }
            Err(err) => {
                self.set_relation_state(key, rel.name, LoadState::Unloaded)?;
                Err(err)
            }
        }
    }

    fn fetch_many(
        &mut self,
        key: EntityKey,
        rel: &RelationshipDef,
        depth: usize,
    ) -> CoreResult<Vec<EntityKey>> {
        let fk_field = self.inverse_fk_field(rel)?;
        let targets = match self.entity(key)?.id() {
            None => Vec::new(),
            Some(own_id) => {
                let rows =
                    self.backend
                        .get_by_foreign_key(rel.target.name(), fk_field, own_id.raw())?;
                let mut keys = Vec::with_capacity(rows.len());
                for row in rows {
                    keys.push(self.register_row(rel.target, row, depth)?);
                }
                keys
            }
        };
        Ok(targets)
    }

    fn inverse_fk_field(&self, rel: &RelationshipDef) -> CoreResult<&'static str> {
        self.schema
            .owning_counterpart(rel)
            .and_then(RelationshipDef::fk_field)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "relationship `{}.{}` has no owning counterpart",
                    rel.source, rel.name
                ))
            })
    }

    // ---- relationship mutation ----------------------------------------

    /// Sets a to-one relationship.
    ///
    /// On the owning side this rewrites the foreign key. On the inverse
    /// side the mutation is recorded but the owning side must also be
    /// updated before flush, or the flush fails with
    /// `DanglingReference`.
    pub fn set_one(
        &mut self,
        key: EntityKey,
        relation: &str,
        target: Option<EntityKey>,
    ) -> CoreResult<()> {
        self.ensure_mutable(key)?;
        let etype = self.entity(key)?.entity_type();
        let rel = self.relationship_def(etype, relation)?;
        if rel.cardinality != Cardinality::ToOne {
            return Err(CoreError::invalid_operation(format!(
                "relationship `{etype}.{relation}` is not to-one"
            )));
        }
        if let Some(target_key) = target {
            self.ensure_target_type(target_key, &rel)?;
        }

        match (rel.ownership, target) {
            (Ownership::Owning { fk_field }, Some(target_key)) => {
                // Keep the raw field in step when the target already has
                // an id; transient targets resolve during flush.
                if let Some(id) = self.entity(target_key)?.id() {
                    self.entity_mut(key)?.set_field(fk_field, Value::Id(id.raw()));
                }
                self.set_relation_state(
                    key,
                    relation,
                    LoadState::Loaded(RelationValue::One(target_key)),
                )
            }
            (Ownership::Owning { fk_field }, None) => {
                self.entity_mut(key)?.set_field(fk_field, Value::Null);
                self.set_relation_state(key, relation, LoadState::Empty)
            }
            (Ownership::Inverse { .. }, Some(target_key)) => self.set_relation_state(
                key,
                relation,
                LoadState::Loaded(RelationValue::One(target_key)),
            ),
            (Ownership::Inverse { .. }, None) => {
                self.set_relation_state(key, relation, LoadState::Empty)
            }
        }
    }

    /// Adds a target to a mapped-by collection.
    ///
    /// The collection is materialized first if needed. The owning side of
    /// the target must also be updated before flush, or the flush fails
    /// with `DanglingReference`.
    pub fn add_to_many(
        &mut self,
        key: EntityKey,
        relation: &str,
        target: EntityKey,
    ) -> CoreResult<()> {
        self.ensure_mutable(key)?;
        let etype = self.entity(key)?.entity_type();
        let rel = self.relationship_def(etype, relation)?;
        if rel.cardinality != Cardinality::ToMany {
            return Err(CoreError::invalid_operation(format!(
                "relationship `{etype}.{relation}` is not to-many"
            )));
        }
        self.ensure_target_type(target, &rel)?;

        let mut targets = match self.relation_state(key, relation)? {
            LoadState::Loaded(RelationValue::Many(t)) => t,
            LoadState::Empty => Vec::new(),
            LoadState::Unloaded => self.load_to_many(key, &rel, 0)?,
            LoadState::Loading => {
                return Err(CoreError::invalid_operation(
                    "re-entrant load of a relationship in flight",
                ))
            }
            LoadState::Loaded(RelationValue::One(_)) => unreachable!("to-many holds Many"),
        };
        if !targets.contains(&target) {
            targets.push(target);
        }
        self.set_relation_state(key, relation, LoadState::Loaded(RelationValue::Many(targets)))
    }

    /// Removes a target from a mapped-by collection.
    pub fn remove_from_many(
        &mut self,
        key: EntityKey,
        relation: &str,
        target: EntityKey,
    ) -> CoreResult<()> {
        self.ensure_mutable(key)?;
        let etype = self.entity(key)?.entity_type();
        let rel = self.relationship_def(etype, relation)?;
        let mut targets = match self.relation_state(key, relation)? {
            LoadState::Loaded(RelationValue::Many(t)) => t,
            LoadState::Empty => Vec::new(),
            LoadState::Unloaded => self.load_to_many(key, &rel, 0)?,
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot remove from relationship in state {other:?}"
                )))
            }
        };
        targets.retain(|t| *t != target);
        self.set_relation_state(key, relation, LoadState::Loaded(RelationValue::Many(targets)))
    }

    fn ensure_mutable(&self, key: EntityKey) -> CoreResult<()> {
        let entity = self.entity(key)?;
        match entity.status() {
            EntityStatus::Transient | EntityStatus::Managed => Ok(()),
            EntityStatus::Removed => Err(CoreError::invalid_operation(
                "cannot mutate an entity scheduled for removal",
            )),
            EntityStatus::Detached => {
                Err(CoreError::stale(entity.entity_type(), entity.id()))
            }
        }
    }

    fn ensure_target_type(&self, target: EntityKey, rel: &RelationshipDef) -> CoreResult<()> {
        let entity = self.entity(target)?;
        if entity.entity_type() != rel.target {
            return Err(CoreError::invalid_operation(format!(
                "relationship `{}.{}` targets `{}`, got `{}`",
                rel.source,
                rel.name,
                rel.target,
                entity.entity_type()
            )));
        }
        Ok(())
    }

    // ---- cascade support ----------------------------------------------

    /// Computes the ordered cascade closure of `op` from `root`.
    pub fn cascade_closure(
        &mut self,
        op: CascadeOp,
        root: EntityKey,
    ) -> CoreResult<Vec<EntityKey>> {
        cascade::closure(self, op, root)
    }

    /// Returns the targets a cascade traversal follows across `rel`.
    ///
    /// Materializes unloaded relationships for `Remove` and `Merge`; for
    /// `Persist` only already-materialized values are followed.
    pub(crate) fn cascade_targets(
        &mut self,
        key: EntityKey,
        rel: &RelationshipDef,
        op: CascadeOp,
    ) -> CoreResult<Vec<EntityKey>> {
        match self.relation_state(key, rel.name)? {
            LoadState::Loaded(RelationValue::One(target)) => Ok(vec![target]),
            LoadState::Loaded(RelationValue::Many(targets)) => Ok(targets),
            LoadState::Empty => Ok(Vec::new()),
            LoadState::Loading => Err(CoreError::invalid_operation(
                "re-entrant load of a relationship in flight",
            )),
            LoadState::Unloaded => {
                if op == CascadeOp::Persist {
                    return Ok(Vec::new());
                }
                match rel.cardinality {
                    Cardinality::ToOne => {
                        Ok(self.load_to_one(key, rel, 0)?.into_iter().collect())
                    }
                    Cardinality::ToMany => self.load_to_many(key, rel, 0),
                }
            }
        }
    }

    // ---- flush ---------------------------------------------------------

    /// Flushes the unit of work.
    ///
    /// 1. runs cascade closures for every root operation issued since the
    ///    last flush
    /// 2. validates inverse-side consistency and removal integrity
    /// 3. inside one storage transaction: inserts new entities in
    ///    dependency order, updates dirty managed entities, deletes
    ///    removed entities children-first
    /// 4. commits
    ///
    /// On any storage failure the transaction is rolled back, the
    /// session's in-memory state is restored to its pre-flush snapshot,
    /// and the error is surfaced as [`CoreError::FlushFailed`] carrying
    /// the first offending entity. The core never retries on its own.
    pub fn flush(&mut self) -> CoreResult<()> {
        if !self.open {
            return Err(CoreError::invalid_operation("session is closed"));
        }

        let backup = self.backup();
        match self.flush_inner() {
            Ok(plan) => {
                self.finalize(plan);
                Ok(())
            }
            Err(err) => {
                self.restore(backup);
                Err(err)
            }
        }
    }

    fn backup(&self) -> Backup {
        Backup {
            arena: self.arena.clone(),
            identity: self.identity.clone(),
            snapshots: self.snapshots.clone(),
            managed: self.managed.clone(),
            newly_created: self.newly_created.clone(),
            removed: self.removed.clone(),
            pending_ops: self.pending_ops.clone(),
        }
    }

    fn restore(&mut self, backup: Backup) {
        self.arena = backup.arena;
        self.identity = backup.identity;
        self.snapshots = backup.snapshots;
        self.managed = backup.managed;
        self.newly_created = backup.newly_created;
        self.removed = backup.removed;
        self.pending_ops = backup.pending_ops;
    }

    fn flush_inner(&mut self) -> CoreResult<FlushPlan> {
        // (1) cascade closures for every root operation.
        let ops = std::mem::take(&mut self.pending_ops);
        for (op, root) in ops {
            if !self.arena.contains_key(&root) {
                continue;
            }
            let closure = cascade::closure(self, op, root)?;
            match op {
                CascadeOp::Persist | CascadeOp::Merge => {
                    for key in closure {
                        if self.entity(key)?.status() == EntityStatus::Transient {
                            self.newly_created.insert(key);
                        }
                    }
                }
                CascadeOp::Remove => {
                    for key in closure {
                        match self.entity(key)?.status() {
                            EntityStatus::Managed => {
                                self.entity_mut(key)?.set_status(EntityStatus::Removed);
                                self.removed.insert(key);
                            }
                            EntityStatus::Transient => {
                                // Reached before it was ever written.
                                self.newly_created.remove(&key);
                                self.entity_mut(key)?.set_status(EntityStatus::Detached);
                            }
                            EntityStatus::Removed | EntityStatus::Detached => {}
                        }
                    }
                }
            }
        }

        // (2) consistency validation before any storage work.
        self.validate_inverse_consistency()?;
        self.validate_removals()?;

        let tx = self.backend.begin()?;
        match self.flush_writes(tx) {
            Ok(plan) => match self.backend.commit(tx) {
                Ok(()) => Ok(plan),
                Err(err) => {
                    let _ = self.backend.rollback(tx);
                    for (etype, id) in &plan.assigned {
                        self.registry.release(*etype, *id);
                    }
                    let offender = self.first_flush_entity();
                    Err(CoreError::flush_failed(
                        offender.0,
                        offender.1,
                        CoreError::Storage(err),
                    ))
                }
            },
            Err((offender, assigned, err)) => {
                let _ = self.backend.rollback(tx);
                for (etype, id) in assigned {
                    self.registry.release(etype, id);
                }
                Err(CoreError::flush_failed(offender.0, offender.1, err))
            }
        }
    }

    /// The entity a commit-level failure is attributed to.
    fn first_flush_entity(&self) -> (EntityType, Option<EntityId>) {
        self.newly_created
            .iter()
            .chain(self.managed.iter())
            .next()
            .and_then(|key| self.arena.get(key))
            .map(|e| (e.entity_type(), e.id()))
            .unwrap_or((EntityType::new("unknown"), None))
    }

    fn offender_of(&self, key: EntityKey) -> (EntityType, Option<EntityId>) {
        let entity = &self.arena[&key];
        (entity.entity_type(), entity.id())
    }

    #[allow(clippy::type_complexity)]
    fn flush_writes(
        &mut self,
        tx: TxHandle,
    ) -> Result<FlushPlan, ((EntityType, Option<EntityId>), Vec<(EntityType, EntityId)>, CoreError)>
    {
        let mut assigned: Vec<(EntityType, EntityId)> = Vec::new();
        let mut staged: HashMap<EntityKey, Vec<u8>> = HashMap::new();

        // (3) assign ids to every new entity before any row is encoded,
        // so foreign keys resolve on the first write attempt.
        let new_keys: Vec<EntityKey> = self.newly_created.iter().copied().collect();
        for key in &new_keys {
            let etype = self.arena[key].entity_type();
            let id = match self.arena[key].id() {
                Some(id) => id,
                None => {
                    let id = match self.backend.id_generation() {
                        IdGeneration::ClientSequence => self.registry.assign(etype),
                        IdGeneration::StorageAssigned => {
                            let raw = self.backend.assign_id(etype.name()).map_err(|e| {
                                (self.offender_of(*key), assigned.clone(), CoreError::Storage(e))
                            })?;
                            let id = EntityId::new(raw);
                            self.registry
                                .claim(etype, id)
                                .map_err(|e| (self.offender_of(*key), assigned.clone(), e))?;
                            id
                        }
                    };
                    assigned.push((etype, id));
                    if let Some(entity) = self.arena.get_mut(key) {
                        entity.assign_id(id);
                    }
                    id
                }
            };
            if let Some(existing) = self.identity.get(&(etype, id)) {
                if *existing != *key {
                    return Err((
                        (etype, Some(id)),
                        assigned,
                        CoreError::identity_conflict(etype, id),
                    ));
                }
            }
            self.identity.insert((etype, id), *key);
        }

        // (4) insert new entities, owning-fk targets first.
        let new_set: HashSet<EntityKey> = new_keys.iter().copied().collect();
        let mut written: HashSet<EntityKey> = HashSet::new();
        for key in &new_keys {
            self.write_new(tx, *key, &new_set, &mut written, &mut staged)
                .map_err(|(off, err)| (off, assigned.clone(), err))?;
        }

        // (5) update dirty managed entities.
        let managed_keys: Vec<EntityKey> = self.managed.iter().copied().collect();
        for key in managed_keys {
            let entity = &self.arena[&key];
            if entity.status() != EntityStatus::Managed {
                continue;
            }
            let off = (entity.entity_type(), entity.id());
            let row = self
                .encode_entity(key)
                .map_err(|err| (off, assigned.clone(), err))?;
            let bytes = encode_row(&row).map_err(|err| (off, assigned.clone(), err.into()))?;
            if self.snapshots.get(&key) != Some(&bytes) {
                trace!(entity = %off.0, id = ?off.1, "update");
                self.backend
                    .write(tx, &row)
                    .map_err(|err| (off, assigned.clone(), err.into()))?;
                staged.insert(key, bytes);
            }
        }

        // (6) delete removed entities, foreign-key holders first.
        for key in self.removal_order() {
            let entity = &self.arena[&key];
            let off = (entity.entity_type(), entity.id());
            // Removed entities were managed, so an id is always present.
            let Some(id) = entity.id() else { continue };
            trace!(entity = %off.0, id = %id, "delete");
            self.backend
                .delete(tx, entity.entity_type().name(), id.raw())
                .map_err(|err| (off, assigned.clone(), err.into()))?;
        }

        Ok(FlushPlan {
            staged_snapshots: staged,
            assigned,
        })
    }

    /// Writes one new entity, recursing into newly created owning-fk
    /// targets first so referenced rows exist before referencing ones.
    fn write_new(
        &mut self,
        tx: TxHandle,
        key: EntityKey,
        new_set: &HashSet<EntityKey>,
        written: &mut HashSet<EntityKey>,
        staged: &mut HashMap<EntityKey, Vec<u8>>,
    ) -> Result<(), ((EntityType, Option<EntityId>), CoreError)> {
        if !written.insert(key) {
            return Ok(());
        }
        let etype = self.arena[&key].entity_type();
        let owning: Vec<RelationshipDef> = self
            .schema
            .relationships_of(etype)
            .filter(|rel| rel.is_owning())
            .cloned()
            .collect();
        for rel in owning {
            let state = self.arena[&key]
                .relation(rel.name)
                .map(|r| r.state().clone());
            if let Some(LoadState::Loaded(RelationValue::One(target))) = state {
                if new_set.contains(&target) {
                    self.write_new(tx, target, new_set, written, staged)?;
                }
            }
        }

        let entity = &self.arena[&key];
        let off = (entity.entity_type(), entity.id());
        let row = self.encode_entity(key).map_err(|err| (off, err))?;
        let bytes = encode_row(&row).map_err(|err| (off, CoreError::from(err)))?;
        trace!(entity = %off.0, id = ?off.1, "insert");
        self.backend
            .write(tx, &row)
            .map_err(|err| (off, CoreError::from(err)))?;
        staged.insert(key, bytes);
        Ok(())
    }

    /// Flattens an entity to a row, resolving relationship keys to ids.
    fn encode_entity(&self, key: EntityKey) -> CoreResult<Row> {
        let entity = &self.arena[&key];
        entity.to_row(&self.schema, |target| {
            let target_entity = self
                .arena
                .get(&target)
                .ok_or_else(|| CoreError::invalid_operation("unknown relationship target key"))?;
            target_entity.id().ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "relationship target `{}` has no id at encode time",
                    target_entity.entity_type()
                ))
            })
        })
    }

    /// Orders removed entities so foreign-key holders are deleted before
    /// the rows they reference.
    fn removal_order(&self) -> Vec<EntityKey> {
        let removed: Vec<EntityKey> = self.removed.iter().copied().collect();
        let removed_set: HashSet<EntityKey> = removed.iter().copied().collect();
        let mut order = Vec::with_capacity(removed.len());
        let mut visited: HashSet<EntityKey> = HashSet::new();

        // Postorder over "references" edges, reversed: holders first.
        fn visit(
            session: &Session,
            key: EntityKey,
            removed_set: &HashSet<EntityKey>,
            visited: &mut HashSet<EntityKey>,
            order: &mut Vec<EntityKey>,
        ) {
            if !visited.insert(key) {
                return;
            }
            for target in session.referenced_removed(key, removed_set) {
                visit(session, target, removed_set, visited, order);
            }
            order.push(key);
        }

        for key in &removed {
            visit(self, *key, &removed_set, &mut visited, &mut order);
        }
        order.reverse();
        order
    }

    /// Removed entities that `key` references through an owning fk.
    fn referenced_removed(
        &self,
        key: EntityKey,
        removed_set: &HashSet<EntityKey>,
    ) -> Vec<EntityKey> {
        let entity = &self.arena[&key];
        let mut targets = Vec::new();
        for rel in self.schema.relationships_of(entity.entity_type()) {
            let Some(fk_field) = rel.fk_field() else { continue };
            let target_key = match entity.relation(rel.name).map(RelationRef::state) {
                Some(LoadState::Loaded(RelationValue::One(t))) => Some(*t),
                _ => entity
                    .field(fk_field)
                    .and_then(Value::as_id)
                    .and_then(|raw| self.lookup(rel.target, EntityId::new(raw))),
            };
            if let Some(t) = target_key {
                if removed_set.contains(&t) {
                    targets.push(t);
                }
            }
        }
        targets
    }

    // ---- flush validation ---------------------------------------------

    /// Every materialized inverse-side value must be mirrored by the
    /// owning side before flush.
    fn validate_inverse_consistency(&self) -> CoreResult<()> {
        for key in self.managed.iter().chain(self.newly_created.iter()) {
            let entity = &self.arena[key];
            if entity.status() == EntityStatus::Removed {
                continue;
            }
            for rel in self.schema.relationships_of(entity.entity_type()) {
                let Ownership::Inverse { .. } = rel.ownership else {
                    continue;
                };
                let targets: Vec<EntityKey> = match entity.relation(rel.name).map(RelationRef::state)
                {
                    Some(LoadState::Loaded(RelationValue::Many(t))) => t.clone(),
                    Some(LoadState::Loaded(RelationValue::One(t))) => vec![*t],
                    _ => continue,
                };
                // Present for every inverse end after schema validation.
                let Some(counterpart) = self.schema.owning_counterpart(rel) else {
                    continue;
                };
                for target in targets {
                    if !self.owning_side_points_back(target, counterpart, *key) {
                        let target_entity = &self.arena[&target];
                        return Err(CoreError::dangling(
                            target_entity.entity_type(),
                            target_entity.id(),
                            counterpart.name,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether `target`'s owning relationship currently references
    /// `owner`.
    fn owning_side_points_back(
        &self,
        target: EntityKey,
        counterpart: &RelationshipDef,
        owner: EntityKey,
    ) -> bool {
        let Some(target_entity) = self.arena.get(&target) else {
            return false;
        };
        match target_entity.relation(counterpart.name).map(RelationRef::state) {
            Some(LoadState::Loaded(RelationValue::One(t))) => *t == owner,
            _ => {
                let Some(fk_field) = counterpart.fk_field() else {
                    return false;
                };
                let owner_id = self.arena.get(&owner).and_then(Entity::id);
                match (target_entity.field(fk_field).and_then(Value::as_id), owner_id) {
                    (Some(raw), Some(owner_id)) => raw == owner_id.raw(),
                    _ => false,
                }
            }
        }
    }

    /// Owned-but-not-cascaded references to removed entities must already
    /// be nullified or removed by the caller.
    fn validate_removals(&self) -> CoreResult<()> {
        // In-session referents.
        let removed_set: HashSet<EntityKey> = self.removed.iter().copied().collect();
        for key in self.managed.iter().chain(self.newly_created.iter()) {
            let entity = &self.arena[key];
            if entity.status() == EntityStatus::Removed {
                continue;
            }
            if !self.referenced_removed(*key, &removed_set).is_empty() {
                return Err(CoreError::dangling(
                    entity.entity_type(),
                    entity.id(),
                    "owning reference to a removed entity",
                ));
            }
        }

        // Committed referents not loaded in this session.
        for key in &self.removed {
            let entity = &self.arena[key];
            let Some(id) = entity.id() else { continue };
            for rel in self.schema.relationships_of(entity.entity_type()) {
                let Ownership::Inverse { .. } = rel.ownership else {
                    continue;
                };
                let Some(counterpart) = self.schema.owning_counterpart(rel) else {
                    continue;
                };
                let Some(fk_field) = counterpart.fk_field() else {
                    continue;
                };
                let rows = self
                    .backend
                    .get_by_foreign_key(rel.target.name(), fk_field, id.raw())?;
                for row in rows {
                    let row_id = EntityId::new(row.id);
                    match self.lookup(rel.target, row_id) {
                        // Tracked in session: judged by its current state.
                        Some(referrer) => {
                            let status = self.arena[&referrer].status();
                            if status == EntityStatus::Removed {
                                continue;
                            }
                            if self.owning_side_still_references(referrer, counterpart, id) {
                                return Err(CoreError::dangling(
                                    rel.target,
                                    Some(row_id),
                                    counterpart.name,
                                ));
                            }
                        }
                        // Untracked committed row still points here.
                        None => {
                            return Err(CoreError::dangling(
                                rel.target,
                                Some(row_id),
                                counterpart.name,
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn owning_side_still_references(
        &self,
        referrer: EntityKey,
        counterpart: &RelationshipDef,
        removed_id: EntityId,
    ) -> bool {
        let entity = &self.arena[&referrer];
        match entity.relation(counterpart.name).map(RelationRef::state) {
            Some(LoadState::Loaded(RelationValue::One(t))) => {
                self.arena.get(t).and_then(Entity::id) == Some(removed_id)
            }
            Some(LoadState::Empty) => false,
            _ => {
                counterpart
                    .fk_field()
                    .and_then(|fk| entity.field(fk))
                    .and_then(Value::as_id)
                    == Some(removed_id.raw())
            }
        }
    }

    fn finalize(&mut self, plan: FlushPlan) {
        let new_count = self.newly_created.len();
        let removed_count = self.removed.len();

        for key in std::mem::take(&mut self.newly_created) {
            if let Some(entity) = self.arena.get_mut(&key) {
                entity.set_status(EntityStatus::Managed);
            }
            self.managed.insert(key);
        }
        self.snapshots.extend(plan.staged_snapshots);
        for key in std::mem::take(&mut self.removed) {
            if let Some(entity) = self.arena.get_mut(&key) {
                let etype = entity.entity_type();
                if let Some(id) = entity.id() {
                    self.identity.remove(&(etype, id));
                    self.registry.release(etype, id);
                }
                entity.set_status(EntityStatus::Detached);
            }
            self.managed.remove(&key);
            self.snapshots.remove(&key);
        }
        debug!(
            label = self.config.label.as_deref().unwrap_or(""),
            inserted = new_count,
            removed = removed_count,
            "flush committed"
        );
    }

    // ---- internals -----------------------------------------------------

    fn alloc_key(&mut self) -> EntityKey {
        let key = EntityKey::new(self.next_key);
        self.next_key += 1;
        key
    }

    fn ensure_known_type(&self, etype: EntityType) -> CoreResult<()> {
        if self.schema.contains(etype) {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "entity type `{etype}` is not declared in the schema"
            )))
        }
    }

    fn ensure_open_for(&self, etype: EntityType, id: Option<EntityId>) -> CoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(CoreError::stale(etype, id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CascadeSet, Fetch, SchemaBuilder};
    use relmap_storage::MemoryBackend;

    const MEMBER: EntityType = EntityType::new("member");
    const ORDER: EntityType = EntityType::new("order");

    fn persistence() -> Persistence {
        let schema = SchemaBuilder::new()
            .entity(MEMBER)
            .entity(ORDER)
            .relationship(
                ORDER,
                "member",
                MEMBER,
                Cardinality::ToOne,
                Ownership::Owning { fk_field: "member_id" },
                CascadeSet::NONE,
                Fetch::Lazy,
            )
            .relationship(
                MEMBER,
                "orders",
                ORDER,
                Cardinality::ToMany,
                Ownership::Inverse { mapped_by: "member" },
                CascadeSet::NONE,
                Fetch::Lazy,
            )
            .build()
            .unwrap();
        Persistence::new(schema, Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn transient_to_managed_lifecycle() {
        let persistence = persistence();
        let mut session = persistence.session();
        let member = session.create(MEMBER).unwrap();
        assert_eq!(session.entity(member).unwrap().status(), EntityStatus::Transient);

        session.set_field(member, "name", Value::text("Alice")).unwrap();
        session.persist(member).unwrap();
        session.flush().unwrap();

        let entity = session.entity(member).unwrap();
        assert_eq!(entity.status(), EntityStatus::Managed);
        assert!(entity.id().is_some());
    }

    #[test]
    fn identity_map_within_session() {
        let persistence = persistence();
        let mut session = persistence.session();
        let member = session.create(MEMBER).unwrap();
        session.persist(member).unwrap();
        session.flush().unwrap();
        let id = session.entity(member).unwrap().id().unwrap();

        assert_eq!(session.get(MEMBER, id).unwrap(), member);
        assert_eq!(session.lookup(MEMBER, id), Some(member));
    }

    #[test]
    fn set_one_owning_writes_foreign_key_field() {
        let persistence = persistence();
        let mut session = persistence.session();
        let member = session.create(MEMBER).unwrap();
        session.persist(member).unwrap();
        session.flush().unwrap();
        let member_id = session.entity(member).unwrap().id().unwrap();

        let order = session.create(ORDER).unwrap();
        session.set_one(order, "member", Some(member)).unwrap();
        assert_eq!(
            session.field(order, "member_id").unwrap(),
            Some(&Value::Id(member_id.raw()))
        );

        session.set_one(order, "member", None).unwrap();
        assert_eq!(session.field(order, "member_id").unwrap(), Some(&Value::Null));
    }

    #[test]
    fn unknown_relationship_is_rejected() {
        let persistence = persistence();
        let mut session = persistence.session();
        let member = session.create(MEMBER).unwrap();
        assert!(session.to_one(member, "nope").is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let persistence = persistence();
        let mut session = persistence.session();
        assert!(session.create(EntityType::new("ghost")).is_err());
    }

    #[test]
    fn flush_on_closed_session_fails() {
        let persistence = persistence();
        let mut session = persistence.session();
        session.close();
        assert!(session.flush().is_err());
        assert!(!session.is_open());
    }
}
