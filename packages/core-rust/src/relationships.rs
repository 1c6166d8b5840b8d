//! Relationship field translation between caller-facing aliases and the
//! physical foreign-key columns.
//!
//! [`to_physical`] runs on every write-path payload (create args, update
//! args, query predicates); [`to_logical`] runs on every row read back.

use crate::schema::CollectionDefinition;
use crate::types::{is_falsy, Object};

/// Renames relationship aliases to their foreign-key field names.
///
/// An alias that is absent or falsy is skipped: it is neither copied nor
/// erased, so a caller that omits a relationship leaves the stored foreign
/// key untouched.
#[must_use]
pub fn to_physical(mut object: Object, definition: &CollectionDefinition) -> Object {
    for relationship in &definition.relationships {
        for (alias, field_name) in relationship.key_pairs() {
            let present = object.get(alias).is_some_and(|value| !is_falsy(value));
            if !present {
                continue;
            }
            if let Some(value) = object.remove(alias) {
                object.insert(field_name.to_string(), value);
            }
        }
    }
    object
}

/// Renames foreign-key field names back to their aliases, whatever the value.
#[must_use]
pub fn to_logical(mut object: Object, definition: &CollectionDefinition) -> Object {
    for relationship in &definition.relationships {
        for (alias, field_name) in relationship.key_pairs() {
            if let Some(value) = object.remove(field_name) {
                object.insert(alias.to_string(), value);
            }
        }
    }
    object
}
