//! Relationship graph declaration and validation.

use crate::error::{CoreError, CoreResult};
use crate::types::EntityType;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// References at most one target entity.
    ToOne,
    /// References a collection of target entities.
    ToMany,
}

/// Which end of a relationship is written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// This side holds the foreign key. Only `ToOne` relationships can
    /// own: the foreign key is a single column on the source row.
    Owning {
        /// Field name that stores the target id.
        fk_field: &'static str,
    },
    /// Derived back-reference, never independently persisted. Resolved
    /// through the named owning relationship on the target type.
    Inverse {
        /// Name of the owning relationship on the target type.
        mapped_by: &'static str,
    },
}

/// When a relationship's value is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Materialized atomically with the owner at load time.
    Eager,
    /// Materialized on first access.
    Lazy,
}

/// A lifecycle operation that can propagate along relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    /// Propagate persistence of new entities.
    Persist,
    /// Propagate re-registration and update scheduling.
    Merge,
    /// Propagate removal.
    Remove,
}

/// A subset of [`CascadeOp`]s a relationship propagates.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CascadeSet(u8);

impl CascadeSet {
    /// Propagates nothing.
    pub const NONE: Self = Self(0);
    /// Propagates `Persist`.
    pub const PERSIST: Self = Self(1);
    /// Propagates `Merge`.
    pub const MERGE: Self = Self(1 << 1);
    /// Propagates `Remove`.
    pub const REMOVE: Self = Self(1 << 2);
    /// Propagates every operation.
    pub const ALL: Self = Self(0b111);

    /// Returns whether `op` is in the set.
    #[must_use]
    pub const fn contains(self, op: CascadeOp) -> bool {
        let bit = match op {
            CascadeOp::Persist => Self::PERSIST.0,
            CascadeOp::Merge => Self::MERGE.0,
            CascadeOp::Remove => Self::REMOVE.0,
        };
        self.0 & bit != 0
    }

    /// Returns the union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for CascadeSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CascadeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops = Vec::new();
        if self.contains(CascadeOp::Persist) {
            ops.push("Persist");
        }
        if self.contains(CascadeOp::Merge) {
            ops.push("Merge");
        }
        if self.contains(CascadeOp::Remove) {
            ops.push("Remove");
        }
        write!(f, "CascadeSet({})", ops.join("|"))
    }
}

/// Declaration of one relationship end.
#[derive(Debug, Clone)]
pub struct RelationshipDef {
    /// Relationship name on the source type.
    pub name: &'static str,
    /// The declaring type.
    pub source: EntityType,
    /// The referenced type.
    pub target: EntityType,
    /// Cardinality as seen from the source.
    pub cardinality: Cardinality,
    /// Owning or inverse end.
    pub ownership: Ownership,
    /// Operations propagated across this relationship.
    pub cascade: CascadeSet,
    /// Eager or lazy materialization.
    pub fetch: Fetch,
}

impl RelationshipDef {
    /// Returns `true` if this is the owning end.
    #[must_use]
    pub const fn is_owning(&self) -> bool {
        matches!(self.ownership, Ownership::Owning { .. })
    }

    /// Returns the foreign-key field name on the owning end.
    #[must_use]
    pub const fn fk_field(&self) -> Option<&'static str> {
        match self.ownership {
            Ownership::Owning { fk_field } => Some(fk_field),
            Ownership::Inverse { .. } => None,
        }
    }
}

/// Builder for a [`Schema`].
///
/// All declarations happen at startup; [`SchemaBuilder::build`] validates
/// the whole graph eagerly and fails with
/// [`CoreError::SchemaInconsistency`] on any misdeclaration.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<EntityType>,
    relationships: Vec<RelationshipDef>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity type.
    #[must_use]
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.types.push(entity);
        self
    }

    /// Declares one relationship end.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn relationship(
        mut self,
        source: EntityType,
        name: &'static str,
        target: EntityType,
        cardinality: Cardinality,
        ownership: Ownership,
        cascade: CascadeSet,
        fetch: Fetch,
    ) -> Self {
        self.relationships.push(RelationshipDef {
            name,
            source,
            target,
            cardinality,
            ownership,
            cascade,
            fetch,
        });
        self
    }

    /// Validates the graph and freezes it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaInconsistency`] when:
    /// - a type or relationship is declared twice
    /// - a relationship references an unregistered type
    /// - an owning end is `ToMany` (the foreign key is a single column)
    /// - two owning ends on one type share a foreign-key field
    /// - an inverse end's `mapped_by` does not name an owning `ToOne`
    ///   relationship on the target type pointing back at the source
    /// - two inverse ends claim the same owning end
    /// - both ends of a reciprocal type pair are declared owning
    pub fn build(self) -> CoreResult<Schema> {
        let mut types = HashSet::new();
        for entity in &self.types {
            if !types.insert(*entity) {
                return Err(CoreError::schema(format!("entity type `{entity}` declared twice")));
            }
        }

        let mut by_source: HashMap<EntityType, Vec<usize>> = HashMap::new();
        for (index, rel) in self.relationships.iter().enumerate() {
            if !types.contains(&rel.source) {
                return Err(CoreError::schema(format!(
                    "relationship `{}.{}` has unregistered source type",
                    rel.source, rel.name
                )));
            }
            if !types.contains(&rel.target) {
                return Err(CoreError::schema(format!(
                    "relationship `{}.{}` references unregistered type `{}`",
                    rel.source, rel.name, rel.target
                )));
            }
            let siblings = by_source.entry(rel.source).or_default();
            if siblings
                .iter()
                .any(|i| self.relationships[*i].name == rel.name)
            {
                return Err(CoreError::schema(format!(
                    "relationship `{}.{}` declared twice",
                    rel.source, rel.name
                )));
            }
            siblings.push(index);
        }

        for rel in &self.relationships {
            match rel.ownership {
                Ownership::Owning { fk_field } => {
                    if rel.cardinality == Cardinality::ToMany {
                        return Err(CoreError::schema(format!(
                            "owning relationship `{}.{}` cannot be ToMany",
                            rel.source, rel.name
                        )));
                    }
                    let collision = self.relationships.iter().any(|other| {
                        other.source == rel.source
                            && other.name != rel.name
                            && other.fk_field() == Some(fk_field)
                    });
                    if collision {
                        return Err(CoreError::schema(format!(
                            "foreign-key field `{}` on `{}` is shared by two owning relationships",
                            fk_field, rel.source
                        )));
                    }
                }
                Ownership::Inverse { mapped_by } => {
                    let counterpart = self
                        .relationships
                        .iter()
                        .find(|other| other.source == rel.target && other.name == mapped_by);
                    let Some(counterpart) = counterpart else {
                        return Err(CoreError::schema(format!(
                            "inverse relationship `{}.{}` maps to missing `{}.{}`",
                            rel.source, rel.name, rel.target, mapped_by
                        )));
                    };
                    if !counterpart.is_owning() {
                        return Err(CoreError::schema(format!(
                            "inverse relationship `{}.{}` maps to `{}.{}`, which is not owning: \
                             a bidirectional relationship needs exactly one owning side",
                            rel.source, rel.name, rel.target, mapped_by
                        )));
                    }
                    if counterpart.target != rel.source {
                        return Err(CoreError::schema(format!(
                            "inverse relationship `{}.{}` maps to `{}.{}`, which targets `{}`",
                            rel.source, rel.name, rel.target, mapped_by, counterpart.target
                        )));
                    }
                    // ToOne inverse pairs with ToOne owning; ToMany inverse
                    // (a mapped-by collection) also pairs with ToOne owning.
                    if counterpart.cardinality != Cardinality::ToOne {
                        return Err(CoreError::schema(format!(
                            "inverse relationship `{}.{}` maps to non-ToOne `{}.{}`",
                            rel.source, rel.name, rel.target, mapped_by
                        )));
                    }
                }
            }
        }

        // Each owning end may back at most one inverse end.
        let mut claimed: HashMap<(EntityType, &'static str), (EntityType, &'static str)> =
            HashMap::new();
        for rel in &self.relationships {
            if let Ownership::Inverse { mapped_by } = rel.ownership {
                if let Some((source, name)) =
                    claimed.insert((rel.target, mapped_by), (rel.source, rel.name))
                {
                    return Err(CoreError::schema(format!(
                        "owning relationship `{}.{}` is claimed by both `{}.{}` and `{}.{}`",
                        rel.target, mapped_by, source, name, rel.source, rel.name
                    )));
                }
            }
        }

        // A reciprocal pair of owning ends would mean two foreign keys for
        // one logical relationship: zero inverse sides, two owning ones.
        for rel in &self.relationships {
            if !rel.is_owning() || rel.source == rel.target {
                continue;
            }
            let reciprocal = self.relationships.iter().find(|other| {
                other.is_owning() && other.source == rel.target && other.target == rel.source
            });
            if let Some(other) = reciprocal {
                return Err(CoreError::schema(format!(
                    "`{}.{}` and `{}.{}` are both owning; declare one side as inverse (mapped by)",
                    rel.source, rel.name, other.source, other.name
                )));
            }
        }

        Ok(Schema {
            types,
            relationships: self.relationships,
            by_source,
        })
    }
}

/// The validated, immutable relationship graph.
///
/// Built once at startup and consulted as pure data by the lazy-loading
/// and cascade machinery. Never mutated at request time.
#[derive(Debug)]
pub struct Schema {
    types: HashSet<EntityType>,
    relationships: Vec<RelationshipDef>,
    by_source: HashMap<EntityType, Vec<usize>>,
}

impl Schema {
    /// Returns whether `entity` is a registered type.
    #[must_use]
    pub fn contains(&self, entity: EntityType) -> bool {
        self.types.contains(&entity)
    }

    /// Returns the relationships declared on `entity`.
    pub fn relationships_of(&self, entity: EntityType) -> impl Iterator<Item = &RelationshipDef> {
        self.by_source
            .get(&entity)
            .into_iter()
            .flatten()
            .map(move |index| &self.relationships[*index])
    }

    /// Returns the relationship `name` declared on `entity`.
    #[must_use]
    pub fn relationship(&self, entity: EntityType, name: &str) -> Option<&RelationshipDef> {
        self.relationships_of(entity).find(|rel| rel.name == name)
    }

    /// Resolves the owning counterpart of an inverse relationship.
    #[must_use]
    pub fn owning_counterpart(&self, rel: &RelationshipDef) -> Option<&RelationshipDef> {
        match rel.ownership {
            Ownership::Inverse { mapped_by } => self.relationship(rel.target, mapped_by),
            Ownership::Owning { .. } => None,
        }
    }
}
