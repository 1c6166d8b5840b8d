//! Collection registry: the builder collects definitions, `finish()` freezes them.
//!
//! Declarative definitions are JSON objects of this shape:
//!
//! ```json
//! {
//!   "version": 1,
//!   "pkIndex": "id",
//!   "fields": { "identifier": { "type": "string" } },
//!   "relationships": [ { "childOf": "user", "alias": "owner" } ]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::SchemaError;
use crate::schema::{
    ChildOf, CollectionDefinition, Connects, CustomFieldType, FieldDefinition, FieldType,
    PrimitiveType, Relationship, DEFAULT_PK_INDEX,
};
use crate::types::Value;

/// Mutable registry used while collections are being declared.
#[derive(Debug, Default)]
pub struct StorageRegistry {
    collections: BTreeMap<String, CollectionDefinition>,
    custom_types: BTreeMap<String, Arc<dyn CustomFieldType>>,
}

impl StorageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a custom field type referenceable by name from JSON definitions.
    pub fn register_custom_type(&mut self, custom: Arc<dyn CustomFieldType>) -> &mut Self {
        self.custom_types.insert(custom.name().to_string(), custom);
        self
    }

    /// Registers a collection. When the name is already registered, the
    /// definition with the highest version is kept (ties go to the newest).
    pub fn register_collection(&mut self, definition: CollectionDefinition) -> &mut Self {
        match self.collections.get(&definition.name) {
            Some(existing) if existing.version > definition.version => {
                tracing::debug!(
                    collection = %definition.name,
                    kept = existing.version,
                    ignored = definition.version,
                    "ignoring older collection version"
                );
            }
            _ => {
                self.collections.insert(definition.name.clone(), definition);
            }
        }
        self
    }

    /// Parses and registers a declarative collection definition.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownFieldType`] when a field names a type that
    /// is neither primitive nor a registered custom type, and
    /// [`SchemaError::InvalidDefinition`] when the JSON shape is malformed.
    pub fn register_collection_json(
        &mut self,
        name: &str,
        definition: &Value,
    ) -> Result<&mut Self, SchemaError> {
        let raw: RawCollection = serde_json::from_value(definition.clone())
            .map_err(|err| SchemaError::invalid_definition(name, err.to_string()))?;
        let definition = self.parse_collection(name, raw)?;
        Ok(self.register_collection(definition))
    }

    /// Freezes the registry.
    ///
    /// Every collection gets its primary key field: when `pk_index` names a
    /// field that is not declared, an `auto-pk` field is added under that name.
    /// Relationship targets are checked later, when the relational model is built.
    #[must_use]
    pub fn finish(self) -> Registry {
        let collections = self
            .collections
            .into_iter()
            .map(|(name, mut definition)| {
                definition
                    .fields
                    .entry(definition.pk_index.clone())
                    .or_insert_with(|| FieldDefinition::new(PrimitiveType::AutoPk));
                (name, Arc::new(definition))
            })
            .collect();
        Registry { collections }
    }

    fn parse_collection(
        &self,
        name: &str,
        raw: RawCollection,
    ) -> Result<CollectionDefinition, SchemaError> {
        let mut definition = CollectionDefinition::new(name)
            .version(raw.version)
            .pk_index(raw.pk_index.unwrap_or_else(|| DEFAULT_PK_INDEX.to_string()));

        for (field_name, raw_field) in raw.fields {
            let field_type = self.resolve_field_type(name, &field_name, &raw_field.field_type)?;
            definition.fields.insert(
                field_name,
                FieldDefinition {
                    field_type,
                    optional: raw_field.optional,
                },
            );
        }

        for raw_relationship in raw.relationships {
            definition
                .relationships
                .push(raw_relationship.into_relationship(name)?);
        }

        Ok(definition)
    }

    fn resolve_field_type(
        &self,
        collection: &str,
        field: &str,
        type_name: &str,
    ) -> Result<FieldType, SchemaError> {
        if let Ok(primitive) = type_name.parse::<PrimitiveType>() {
            return Ok(FieldType::Primitive(primitive));
        }
        self.custom_types
            .get(type_name)
            .map(|custom| FieldType::Custom(Arc::clone(custom)))
            .ok_or_else(|| SchemaError::unknown_field_type(collection, field, type_name))
    }
}

/// Finalized, immutable set of collection definitions.
///
/// Shared as `Arc<Registry>` between the backend and the dissector.
#[derive(Debug, Clone)]
pub struct Registry {
    collections: BTreeMap<String, Arc<CollectionDefinition>>,
}

impl Registry {
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionDefinition> {
        self.collections.get(name).map(AsRef::as_ref)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionDefinition> {
        self.collections.values().map(AsRef::as_ref)
    }

    /// `ChildOf` relationships in other collections that point at `target`,
    /// as `(owning collection, relationship)` pairs.
    pub fn children_of<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a CollectionDefinition, &'a ChildOf)> + 'a {
        self.collections().flat_map(move |definition| {
            definition
                .child_of_relationships()
                .filter(move |rel| rel.target_collection == target)
                .map(move |rel| (definition, rel))
        })
    }
}

// ---------------------------------------------------------------------------
// Declarative form
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCollection {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pk_index: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, RawField>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
    /// Accepted for compatibility; indices are not part of the relational model.
    #[serde(default)]
    #[allow(dead_code)]
    indices: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRelationship {
    #[serde(default)]
    child_of: Option<String>,
    #[serde(default)]
    single_child_of: Option<String>,
    #[serde(default)]
    connects: Option<[String; 2]>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    field_name: Option<String>,
    #[serde(default)]
    aliases: Option<[String; 2]>,
    #[serde(default)]
    field_names: Option<[String; 2]>,
}

impl RawRelationship {
    fn into_relationship(self, collection: &str) -> Result<Relationship, SchemaError> {
        match (self.child_of, self.single_child_of, self.connects) {
            (Some(target), None, None) => Ok(Self::child_of(
                ChildOf::new(target),
                self.alias,
                self.field_name,
            )),
            (None, Some(target), None) => Ok(Self::child_of(
                ChildOf::single(target),
                self.alias,
                self.field_name,
            )),
            (None, None, Some([left, right])) => {
                let mut rel = Connects::new(left, right);
                if let Some([left, right]) = self.aliases {
                    rel = rel.with_aliases(left, right);
                }
                if let Some([left, right]) = self.field_names {
                    rel = rel.with_field_names(left, right);
                }
                Ok(Relationship::Connects(rel))
            }
            _ => Err(SchemaError::invalid_definition(
                collection,
                "a relationship must declare exactly one of childOf, singleChildOf or connects",
            )),
        }
    }

    fn child_of(mut rel: ChildOf, alias: Option<String>, field_name: Option<String>) -> Relationship {
        if let Some(alias) = alias {
            rel = rel.with_alias(alias);
        }
        if let Some(field_name) = field_name {
            rel = rel.with_field_name(field_name);
        }
        Relationship::ChildOf(rel)
    }
}
