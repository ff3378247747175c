//! Core identifier types.

use std::fmt;

/// An entity type name.
///
/// Types are declared once at startup when the relationship graph is
/// built, so the name is a `'static` string and the type is `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(&'static str);

impl EntityType {
    /// Creates an entity type from its declared name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityType({})", self.0)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Unique identifier for a persisted entity.
///
/// Ids are unique within one entity type's namespace, assigned once at
/// first persist, immutable thereafter, and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Session-local handle to an entity instance.
///
/// Relationships and callers address entities through keys rather than
/// live references, so cyclic graphs are plain edges and the identity map
/// can guarantee one instance per (type, id). Keys are meaningless outside
/// the session that issued them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(u64);

impl EntityKey {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_name() {
        let t = EntityType::new("member");
        assert_eq!(t.name(), "member");
        assert_eq!(t.to_string(), "member");
    }

    #[test]
    fn entity_id_roundtrip() {
        let id = EntityId::new(7);
        assert_eq!(id.raw(), 7);
        assert_eq!(u64::from(id), 7);
        assert_eq!(EntityId::from(7u64), id);
    }

    #[test]
    fn entity_id_ordering() {
        assert!(EntityId::new(1) < EntityId::new(2));
    }
}
