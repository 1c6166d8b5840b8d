//! Storage-model definitions: collections, fields, and relationships.
//!
//! A [`CollectionDefinition`] is the caller-facing description of one
//! collection. Definitions are collected by the
//! [`StorageRegistry`](crate::registry::StorageRegistry) and frozen into a
//! [`Registry`](crate::registry::Registry) before the relational model is built.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::types::{Object, Value};

/// Default name of the generated primary key field.
pub const DEFAULT_PK_INDEX: &str = "id";

/// Fixed set of primitive field types understood by the relational mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    AutoPk,
    Text,
    Json,
    Datetime,
    Timestamp,
    String,
    Boolean,
    Int,
    Float,
}

impl PrimitiveType {
    pub const ALL: [Self; 9] = [
        Self::AutoPk,
        Self::Text,
        Self::Json,
        Self::Datetime,
        Self::Timestamp,
        Self::String,
        Self::Boolean,
        Self::Int,
        Self::Float,
    ];

    /// Name used in declarative collection definitions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoPk => "auto-pk",
            Self::Text => "text",
            Self::Json => "json",
            Self::Datetime => "datetime",
            Self::Timestamp => "timestamp",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`PrimitiveType::from_str`] for names outside the fixed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPrimitiveType(pub String);

impl FromStr for PrimitiveType {
    type Err = UnknownPrimitiveType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownPrimitiveType(s.to_string()))
    }
}

/// A field type with its own storage encoding.
///
/// The mapper stores the field using the column type of
/// [`storage_type`](CustomFieldType::storage_type); the backend calls
/// [`prepare_for_storage`](CustomFieldType::prepare_for_storage) on the
/// cleaned value right before the row is written.
pub trait CustomFieldType: Send + Sync + fmt::Debug {
    /// Name used to reference this type from declarative definitions.
    fn name(&self) -> &str;

    /// Primitive type the encoded value is stored as.
    fn storage_type(&self) -> PrimitiveType;

    /// Encode a caller value for storage.
    fn prepare_for_storage(&self, value: Value) -> anyhow::Result<Value>;

    /// Decode a stored value for the caller. Identity by default.
    fn prepare_from_storage(&self, value: Value) -> anyhow::Result<Value> {
        Ok(value)
    }
}

/// Closed set of field types: a primitive, or a custom type with an
/// encoding hook.
#[derive(Debug, Clone)]
pub enum FieldType {
    Primitive(PrimitiveType),
    Custom(Arc<dyn CustomFieldType>),
}

impl FieldType {
    /// Primitive type that determines the relational column.
    #[must_use]
    pub fn primitive_type(&self) -> PrimitiveType {
        match self {
            Self::Primitive(ty) => *ty,
            Self::Custom(custom) => custom.storage_type(),
        }
    }
}

impl From<PrimitiveType> for FieldType {
    fn from(ty: PrimitiveType) -> Self {
        Self::Primitive(ty)
    }
}

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub field_type: FieldType,
    /// Whether the column accepts null.
    pub optional: bool,
}

impl FieldDefinition {
    #[must_use]
    pub fn new(field_type: impl Into<FieldType>) -> Self {
        Self {
            field_type: field_type.into(),
            optional: false,
        }
    }

    #[must_use]
    pub fn optional(field_type: impl Into<FieldType>) -> Self {
        Self {
            field_type: field_type.into(),
            optional: true,
        }
    }

    #[must_use]
    pub fn custom(custom: Arc<dyn CustomFieldType>) -> Self {
        Self::new(FieldType::Custom(custom))
    }

    #[must_use]
    pub fn as_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Encoding hook, if this field has a custom type.
    #[must_use]
    pub fn custom_type(&self) -> Option<&Arc<dyn CustomFieldType>> {
        match &self.field_type {
            FieldType::Custom(custom) => Some(custom),
            FieldType::Primitive(_) => None,
        }
    }
}

/// The owning row stores a foreign key pointing at `target_collection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOf {
    /// Physical foreign-key column on the owning collection.
    pub field_name: String,
    /// Caller-facing key for the relationship.
    pub alias: String,
    pub target_collection: String,
    /// To-one (`true`) or to-many (`false`) on the target side.
    pub single: bool,
}

impl ChildOf {
    /// To-many relationship with the default alias (`target`) and field name
    /// (`<target>Id`).
    #[must_use]
    pub fn new(target_collection: impl Into<String>) -> Self {
        let target_collection = target_collection.into();
        Self {
            field_name: default_field_name(&target_collection),
            alias: target_collection.clone(),
            target_collection,
            single: false,
        }
    }

    #[must_use]
    pub fn single(target_collection: impl Into<String>) -> Self {
        Self {
            single: true,
            ..Self::new(target_collection)
        }
    }

    /// Renames the alias; the field name follows unless set explicitly later.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self.field_name = default_field_name(&self.alias);
        self
    }

    #[must_use]
    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }
}

/// Symmetric many-to-many association. The collection declaring it is the
/// join table and stores one foreign key per side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connects {
    pub collections: [String; 2],
    pub field_names: [String; 2],
    pub aliases: [String; 2],
}

impl Connects {
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        let collections = [left.into(), right.into()];
        Self {
            field_names: [
                default_field_name(&collections[0]),
                default_field_name(&collections[1]),
            ],
            aliases: collections.clone(),
            collections,
        }
    }

    #[must_use]
    pub fn with_aliases(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.aliases = [left.into(), right.into()];
        self.field_names = [
            default_field_name(&self.aliases[0]),
            default_field_name(&self.aliases[1]),
        ];
        self
    }

    #[must_use]
    pub fn with_field_names(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.field_names = [left.into(), right.into()];
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relationship {
    ChildOf(ChildOf),
    Connects(Connects),
}

impl Relationship {
    /// `(alias, field_name)` pairs this relationship translates between.
    #[must_use]
    pub fn key_pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Self::ChildOf(rel) => vec![(rel.alias.as_str(), rel.field_name.as_str())],
            Self::Connects(rel) => vec![
                (rel.aliases[0].as_str(), rel.field_names[0].as_str()),
                (rel.aliases[1].as_str(), rel.field_names[1].as_str()),
            ],
        }
    }
}

impl From<ChildOf> for Relationship {
    fn from(rel: ChildOf) -> Self {
        Self::ChildOf(rel)
    }
}

impl From<Connects> for Relationship {
    fn from(rel: Connects) -> Self {
        Self::Connects(rel)
    }
}

fn default_field_name(alias: &str) -> String {
    format!("{alias}Id")
}

/// Description of one collection.
#[derive(Debug, Clone)]
pub struct CollectionDefinition {
    pub name: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldDefinition>,
    pub relationships: Vec<Relationship>,
    /// Field holding the generated primary key.
    pub pk_index: String,
}

impl CollectionDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            fields: BTreeMap::new(),
            relationships: Vec::new(),
            pk_index: DEFAULT_PK_INDEX.to_string(),
        }
    }

    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: impl Into<Relationship>) -> Self {
        self.relationships.push(relationship.into());
        self
    }

    #[must_use]
    pub fn pk_index(mut self, pk_index: impl Into<String>) -> Self {
        self.pk_index = pk_index.into();
        self
    }

    /// `ChildOf` relationships declared by this collection.
    pub fn child_of_relationships(&self) -> impl Iterator<Item = &ChildOf> {
        self.relationships.iter().filter_map(|rel| match rel {
            Relationship::ChildOf(child_of) => Some(child_of),
            Relationship::Connects(_) => None,
        })
    }

    /// Runs every custom field's storage hook over the fields present in `object`.
    ///
    /// # Errors
    ///
    /// Returns the failing field name and the hook's error.
    pub fn prepare_for_storage(&self, object: &mut Object) -> Result<(), (String, anyhow::Error)> {
        self.apply_custom_hooks(object, |custom, value| custom.prepare_for_storage(value))
    }

    /// Runs every custom field's read hook over the fields present in `object`.
    ///
    /// # Errors
    ///
    /// Returns the failing field name and the hook's error.
    pub fn prepare_from_storage(&self, object: &mut Object) -> Result<(), (String, anyhow::Error)> {
        self.apply_custom_hooks(object, |custom, value| custom.prepare_from_storage(value))
    }

    fn apply_custom_hooks(
        &self,
        object: &mut Object,
        hook: impl Fn(&dyn CustomFieldType, Value) -> anyhow::Result<Value>,
    ) -> Result<(), (String, anyhow::Error)> {
        for (name, definition) in &self.fields {
            let Some(custom) = definition.custom_type() else {
                continue;
            };
            // Null stays null: absent optional values are never encoded.
            let Some(value) = object.get_mut(name).filter(|v| !v.is_null()) else {
                continue;
            };
            let encoded = hook(custom.as_ref(), value.take()).map_err(|err| (name.clone(), err))?;
            *value = encoded;
        }
        Ok(())
    }
}
