//! Entity records and relationship reference state.

use crate::error::{CoreError, CoreResult};
use crate::schema::{Ownership, Schema};
use crate::types::{EntityId, EntityKey, EntityType};
use relmap_codec::{Row, Value};
use std::collections::BTreeMap;

/// Lifecycle status of an entity within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Created in memory, not yet scheduled for persistence; no id.
    Transient,
    /// Registered in the session and tracked for dirty state.
    Managed,
    /// Scheduled for removal at the next flush.
    Removed,
    /// Left the session boundary; any further access is stale.
    Detached,
}

/// The resolved value of a relationship, as session-local keys.
///
/// Values hold keys rather than ids so a relationship can reference a
/// transient target that has no id yet; keys resolve to ids during flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    /// A single target.
    One(EntityKey),
    /// An ordered collection of targets.
    Many(Vec<EntityKey>),
}

/// Materialization state of one relationship reference.
///
/// `Unloaded -> Loading -> Loaded | Empty`; the result is cached for the
/// rest of the session, so each reference fetches at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Not yet materialized.
    Unloaded,
    /// A fetch is in flight.
    Loading,
    /// Materialized with a value.
    Loaded(RelationValue),
    /// Materialized; no matching row.
    Empty,
}

/// A relationship reference on one entity instance.
#[derive(Debug, Clone)]
pub struct RelationRef {
    state: LoadState,
}

impl RelationRef {
    fn unloaded() -> Self {
        Self {
            state: LoadState::Unloaded,
        }
    }

    fn empty() -> Self {
        Self {
            state: LoadState::Empty,
        }
    }

    /// Returns the current materialization state.
    #[must_use]
    pub fn state(&self) -> &LoadState {
        &self.state
    }

    /// Returns `true` once a fetch has completed (loaded or empty).
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        matches!(self.state, LoadState::Loaded(_) | LoadState::Empty)
    }

    pub(crate) fn set_state(&mut self, state: LoadState) {
        self.state = state;
    }
}

/// A uniquely identified record with scalar fields and typed
/// relationships.
///
/// Entities live in the session's arena and are addressed by
/// [`EntityKey`]. Owning foreign keys appear both as raw field values
/// (what storage sees) and, once materialized or mutated, as relationship
/// state; the session synchronizes the two before encoding a row.
///
/// Entities deliberately implement neither `Serialize` nor `Deserialize`:
/// they never cross the API boundary (see [`crate::projection`]).
#[derive(Debug, Clone)]
pub struct Entity {
    etype: EntityType,
    id: Option<EntityId>,
    status: EntityStatus,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<&'static str, RelationRef>,
}

impl Entity {
    /// Creates a transient entity with empty relationships.
    pub(crate) fn transient(schema: &Schema, etype: EntityType) -> Self {
        let relations = schema
            .relationships_of(etype)
            .map(|rel| (rel.name, RelationRef::empty()))
            .collect();
        Self {
            etype,
            id: None,
            status: EntityStatus::Transient,
            fields: BTreeMap::new(),
            relations,
        }
    }

    /// Rehydrates an entity from a stored row with unloaded relationships.
    pub(crate) fn from_row(schema: &Schema, etype: EntityType, row: Row) -> Self {
        let relations = schema
            .relationships_of(etype)
            .map(|rel| (rel.name, RelationRef::unloaded()))
            .collect();
        Self {
            etype,
            id: Some(EntityId::new(row.id)),
            status: EntityStatus::Managed,
            fields: row.fields,
            relations,
        }
    }

    /// Returns the entity type.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.etype
    }

    /// Returns the id, present only after first persist.
    #[must_use]
    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Iterates over all fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns a relationship reference.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&RelationRef> {
        self.relations.get(name)
    }

    pub(crate) fn relation_mut(&mut self, name: &str) -> Option<&mut RelationRef> {
        self.relations.get_mut(name)
    }

    pub(crate) fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub(crate) fn assign_id(&mut self, id: EntityId) {
        debug_assert!(self.id.is_none(), "id is assigned once");
        self.id = Some(id);
    }

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    /// Flattens the entity into a storage row.
    ///
    /// Owning foreign-key fields are refreshed from materialized
    /// relationship state; `resolve` maps a target's session key to its
    /// id (assigned by the time any row is encoded during flush).
    pub(crate) fn to_row<F>(&self, schema: &Schema, mut resolve: F) -> CoreResult<Row>
    where
        F: FnMut(EntityKey) -> CoreResult<EntityId>,
    {
        let id = self.id.ok_or_else(|| {
            CoreError::invalid_operation(format!("entity `{}` has no id to encode", self.etype))
        })?;
        let mut row = Row::new(self.etype.name(), id.raw());
        row.fields = self.fields.clone();

        for rel in schema.relationships_of(self.etype) {
            let Ownership::Owning { fk_field } = rel.ownership else {
                continue;
            };
            match self.relations.get(rel.name).map(RelationRef::state) {
                Some(LoadState::Loaded(RelationValue::One(target))) => {
                    let target_id = resolve(*target)?;
                    row.set(fk_field, Value::Id(target_id.raw()));
                }
                Some(LoadState::Empty) if !row.fields.contains_key(fk_field) => {
                    row.set(fk_field, Value::Null);
                }
                _ => {}
            }
        }
        Ok(row)
    }
}
