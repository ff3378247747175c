//! Identity registry.

use crate::error::{CoreError, CoreResult};
use crate::types::{EntityId, EntityType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Assigns and tracks entity ids.
///
/// One registry is shared by all sessions of a persistence handle. Each
/// entity type has its own id namespace with a monotonically increasing
/// sequence; ids handed out or claimed are never reissued.
///
/// In `ClientSequence` mode the registry is the id source; in
/// `StorageAssigned` mode the backend assigns and the registry only
/// records claims, so a backend that hands the same id out twice is caught
/// as an [`CoreError::IdentityConflict`] instead of silently aliasing two
/// instances.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Next id per type namespace.
    sequences: HashMap<EntityType, u64>,
    /// Ids currently bound to an in-memory instance.
    claimed: HashSet<(EntityType, EntityId)>,
}

impl IdentityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next id in `entity`'s namespace and claims it.
    pub fn assign(&self, entity: EntityType) -> EntityId {
        let mut inner = self.inner.lock();
        let next = inner.sequences.entry(entity).or_insert(1);
        let id = EntityId::new(*next);
        *next += 1;
        inner.claimed.insert((entity, id));
        id
    }

    /// Claims an externally assigned id.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IdentityConflict`] if the id is already
    /// bound to a different in-memory instance.
    pub fn claim(&self, entity: EntityType, id: EntityId) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.claimed.insert((entity, id)) {
            return Err(CoreError::identity_conflict(entity, id));
        }
        let next = inner.sequences.entry(entity).or_insert(1);
        if *next <= id.raw() {
            *next = id.raw() + 1;
        }
        Ok(())
    }

    /// Records an id observed in storage without claiming it.
    ///
    /// Loading the same row into several sessions is legal; observation
    /// only advances the sequence so later assignments cannot collide with
    /// rows that already exist.
    pub fn observe(&self, entity: EntityType, id: EntityId) {
        let mut inner = self.inner.lock();
        let next = inner.sequences.entry(entity).or_insert(1);
        if *next <= id.raw() {
            *next = id.raw() + 1;
        }
    }

    /// Releases a claim, for instance after a removed entity is detached.
    pub fn release(&self, entity: EntityType, id: EntityId) {
        self.inner.lock().claimed.remove(&(entity, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER: EntityType = EntityType::new("member");
    const ORDER: EntityType = EntityType::new("order");

    #[test]
    fn assign_is_monotonic_per_namespace() {
        let registry = IdentityRegistry::new();
        assert_eq!(registry.assign(MEMBER), EntityId::new(1));
        assert_eq!(registry.assign(MEMBER), EntityId::new(2));
        assert_eq!(registry.assign(ORDER), EntityId::new(1));
    }

    #[test]
    fn claim_conflicts_on_double_bind() {
        let registry = IdentityRegistry::new();
        registry.claim(MEMBER, EntityId::new(5)).unwrap();
        let result = registry.claim(MEMBER, EntityId::new(5));
        assert!(matches!(result, Err(CoreError::IdentityConflict { .. })));
    }

    #[test]
    fn claim_advances_sequence() {
        let registry = IdentityRegistry::new();
        registry.claim(MEMBER, EntityId::new(10)).unwrap();
        assert_eq!(registry.assign(MEMBER), EntityId::new(11));
    }

    #[test]
    fn observe_prevents_collisions_without_claiming() {
        let registry = IdentityRegistry::new();
        registry.observe(MEMBER, EntityId::new(3));
        registry.observe(MEMBER, EntityId::new(3));
        assert_eq!(registry.assign(MEMBER), EntityId::new(4));
    }

    #[test]
    fn release_allows_reclaim() {
        let registry = IdentityRegistry::new();
        registry.claim(MEMBER, EntityId::new(2)).unwrap();
        registry.release(MEMBER, EntityId::new(2));
        registry.claim(MEMBER, EntityId::new(2)).unwrap();
    }

    #[test]
    fn assigned_ids_are_not_reused_after_release() {
        let registry = IdentityRegistry::new();
        let id = registry.assign(MEMBER);
        registry.release(MEMBER, id);
        assert_ne!(registry.assign(MEMBER), id);
    }
}
