//! Storage row shape.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored entity row.
///
/// Rows are the only shape that crosses the storage boundary: the core
/// flattens an entity into a row before a write and rehydrates it after a
/// read. Foreign keys of owning relationships appear as ordinary fields
/// holding [`Value::Id`] (or [`Value::Null`] when cleared).
///
/// Field names map to values through a `BTreeMap`, so a row's encoding is
/// key-sorted and canonical by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Entity type name.
    pub entity: String,
    /// Primary key within the entity's namespace.
    pub id: u64,
    /// Scalar fields, including owning-side foreign keys.
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row for the given entity type and id.
    pub fn new(entity: impl Into<String>, id: u64) -> Self {
        Self {
            entity: entity.into(),
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Returns a field value, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field value, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Returns a foreign-key field as a target id.
    ///
    /// Returns `None` when the field is absent or null.
    #[must_use]
    pub fn foreign_key(&self, field: &str) -> Option<u64> {
        match self.fields.get(field) {
            Some(Value::Id(id)) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut row = Row::new("member", 1);
        row.set("name", Value::text("Alice"));
        assert_eq!(row.get("name"), Some(&Value::text("Alice")));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn set_replaces() {
        let mut row = Row::new("member", 1);
        row.set("name", Value::text("Alice"));
        row.set("name", Value::text("Bob"));
        assert_eq!(row.get("name"), Some(&Value::text("Bob")));
    }

    #[test]
    fn foreign_key_reads_id_values_only() {
        let mut row = Row::new("order", 9);
        row.set("member_id", Value::Id(3));
        row.set("status", Value::text("ORDERED"));
        assert_eq!(row.foreign_key("member_id"), Some(3));
        assert_eq!(row.foreign_key("status"), None);

        row.set("member_id", Value::Null);
        assert_eq!(row.foreign_key("member_id"), None);
    }

    #[test]
    fn remove_returns_previous() {
        let mut row = Row::new("member", 1);
        row.set("name", Value::text("Alice"));
        assert_eq!(row.remove("name"), Some(Value::text("Alice")));
        assert_eq!(row.remove("name"), None);
    }
}
