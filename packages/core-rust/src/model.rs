//! Relational schema mapper.
//!
//! Turns the finalized [`Registry`] into a [`RelationalModel`]: one
//! [`TableSpec`] per collection plus an explicit list of [`Association`]s.
//! The model is built once per registry and shared read-only by every
//! relational engine (one per named database).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SchemaError;
use crate::registry::Registry;
use crate::schema::{ChildOf, CollectionDefinition, Connects, FieldDefinition, PrimitiveType, Relationship};

/// Table and column names are interpolated into SQL, so they are restricted
/// to plain identifiers.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    Json,
    Date,
    Float,
    String,
    Boolean,
}

impl ColumnType {
    #[must_use]
    pub const fn for_primitive(primitive: PrimitiveType) -> Self {
        match primitive {
            PrimitiveType::AutoPk | PrimitiveType::Int => Self::Integer,
            PrimitiveType::Text => Self::Text,
            PrimitiveType::Json => Self::Json,
            PrimitiveType::Datetime => Self::Date,
            PrimitiveType::Timestamp | PrimitiveType::Float => Self::Float,
            PrimitiveType::String => Self::String,
            PrimitiveType::Boolean => Self::Boolean,
        }
    }
}

/// Foreign-key target of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub references: Option<ColumnReference>,
}

impl ColumnSpec {
    fn from_field(name: &str, field: &FieldDefinition, is_pk: bool) -> Self {
        let primitive = field.field_type.primitive_type();
        let auto_increment = primitive == PrimitiveType::AutoPk;
        Self {
            name: name.to_string(),
            column_type: ColumnType::for_primitive(primitive),
            nullable: field.optional && !is_pk && !auto_increment,
            primary_key: is_pk,
            auto_increment,
            references: None,
        }
    }

    fn foreign_key(name: &str, target: &TableSpec) -> Self {
        let target_pk = target.primary_key_column();
        Self {
            name: name.to_string(),
            column_type: target_pk.map_or(ColumnType::Integer, |pk| pk.column_type),
            nullable: true,
            primary_key: false,
            auto_increment: false,
            references: Some(ColumnReference {
                table: target.name.clone(),
                column: target.primary_key.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    /// Column holding the generated primary key.
    pub primary_key: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn primary_key_column(&self) -> Option<&ColumnSpec> {
        self.column(&self.primary_key)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Names of tables this table references through foreign keys.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter_map(|column| column.references.as_ref().map(|r| r.table.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// `ChildOf { single: true }`: the target has one owning row.
    HasOne,
    /// `ChildOf { single: false }`: the target has many owning rows.
    HasMany,
    /// `Connects`: many-to-many through the declaring collection.
    BelongsToMany { through: String },
}

/// One relationship edge, declared once at model-build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub kind: AssociationKind,
    /// Table the association is declared on (the "one" side for has-one/has-many).
    pub source: String,
    /// Table holding the foreign key (or the far side for many-to-many).
    pub target: String,
    pub foreign_key: String,
}

/// Relational columns and associations derived from one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionModel {
    pub table: TableSpec,
    pub associations: Vec<Association>,
}

/// The whole relational schema for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalModel {
    tables: BTreeMap<String, TableSpec>,
    associations: Vec<Association>,
}

impl RelationalModel {
    /// Maps every collection in the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] naming the offending collection when a
    /// relationship targets an unknown collection or a name is not a valid
    /// SQL identifier.
    pub fn build(registry: &Registry) -> Result<Self, SchemaError> {
        // Field columns first so foreign keys can look up the target's pk type.
        let base: BTreeMap<String, TableSpec> = registry
            .collections()
            .map(|definition| field_table(definition).map(|table| (table.name.clone(), table)))
            .collect::<Result<_, _>>()?;

        let mut tables = BTreeMap::new();
        let mut associations = Vec::new();
        for definition in registry.collections() {
            let model = map_relationships(definition, &base)?;
            associations.extend(model.associations);
            tables.insert(model.table.name.clone(), model.table);
        }

        tracing::info!(
            tables = tables.len(),
            associations = associations.len(),
            "relational model built"
        );
        Ok(Self {
            tables,
            associations,
        })
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    #[must_use]
    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    /// Tables ordered so that every referenced table comes before the tables
    /// referencing it. Tables caught in a reference cycle keep name order.
    #[must_use]
    pub fn creation_order(&self) -> Vec<&TableSpec> {
        let mut ordered: Vec<&TableSpec> = Vec::with_capacity(self.tables.len());
        let mut remaining: Vec<&TableSpec> = self.tables.values().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|table| {
                table.referenced_tables().all(|target| {
                    target == table.name || ordered.iter().any(|done| done.name == target)
                })
            });
            // A cycle has no ready table; break it at the first remaining one.
            let index = ready.unwrap_or(0);
            ordered.push(remaining.remove(index));
        }
        ordered
    }
}

/// Maps a single collection against the registry it belongs to.
///
/// # Errors
///
/// Same conditions as [`RelationalModel::build`], restricted to this collection.
pub fn map_collection(
    definition: &CollectionDefinition,
    registry: &Registry,
) -> Result<CollectionModel, SchemaError> {
    let mut base = BTreeMap::new();
    for other in registry.collections() {
        let table = field_table(other)?;
        base.insert(table.name.clone(), table);
    }
    if !base.contains_key(&definition.name) {
        let table = field_table(definition)?;
        base.insert(table.name.clone(), table);
    }
    map_relationships(definition, &base)
}

fn check_identifier(collection: &str, name: &str) -> Result<(), SchemaError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            collection: collection.to_string(),
            name: name.to_string(),
        })
    }
}

fn field_table(definition: &CollectionDefinition) -> Result<TableSpec, SchemaError> {
    check_identifier(&definition.name, &definition.name)?;

    let mut columns = Vec::with_capacity(definition.fields.len());
    for (name, field) in &definition.fields {
        check_identifier(&definition.name, name)?;
        columns.push(ColumnSpec::from_field(
            name,
            field,
            *name == definition.pk_index,
        ));
    }

    Ok(TableSpec {
        name: definition.name.clone(),
        primary_key: definition.pk_index.clone(),
        columns,
    })
}

fn map_relationships(
    definition: &CollectionDefinition,
    base: &BTreeMap<String, TableSpec>,
) -> Result<CollectionModel, SchemaError> {
    let mut table = base
        .get(&definition.name)
        .cloned()
        .ok_or_else(|| SchemaError::invalid_definition(&definition.name, "collection is not registered"))?;
    let mut associations = Vec::new();

    for relationship in &definition.relationships {
        match relationship {
            Relationship::ChildOf(rel) => {
                let target = lookup_target(definition, base, &rel.alias, "childOf", &rel.target_collection)?;
                add_foreign_key(&mut table, &definition.name, &rel.field_name, target)?;
                associations.push(child_of_association(&definition.name, rel));
            }
            Relationship::Connects(rel) => {
                let relationship_name = rel.aliases.join("/");
                for (side, collection) in rel.collections.iter().enumerate() {
                    let target = lookup_target(definition, base, &relationship_name, "connects", collection)?;
                    add_foreign_key(&mut table, &definition.name, &rel.field_names[side], target)?;
                }
                associations.extend(connects_associations(&definition.name, rel));
            }
        }
    }

    Ok(CollectionModel {
        table,
        associations,
    })
}

fn lookup_target<'a>(
    definition: &CollectionDefinition,
    base: &'a BTreeMap<String, TableSpec>,
    relationship: &str,
    kind: &'static str,
    target: &str,
) -> Result<&'a TableSpec, SchemaError> {
    base.get(target)
        .ok_or_else(|| SchemaError::UnknownRelationshipTarget {
            collection: definition.name.clone(),
            relationship: relationship.to_string(),
            kind,
            target: target.to_string(),
        })
}

fn add_foreign_key(
    table: &mut TableSpec,
    collection: &str,
    field_name: &str,
    target: &TableSpec,
) -> Result<(), SchemaError> {
    check_identifier(collection, field_name)?;
    // A declared field of the same name already provides the column.
    if !table.has_column(field_name) {
        table.columns.push(ColumnSpec::foreign_key(field_name, target));
    }
    Ok(())
}

fn child_of_association(collection: &str, rel: &ChildOf) -> Association {
    Association {
        kind: if rel.single {
            AssociationKind::HasOne
        } else {
            AssociationKind::HasMany
        },
        source: rel.target_collection.clone(),
        target: collection.to_string(),
        foreign_key: rel.field_name.clone(),
    }
}

fn connects_associations(collection: &str, rel: &Connects) -> [Association; 2] {
    let [left, right] = &rel.collections;
    [
        Association {
            kind: AssociationKind::BelongsToMany {
                through: collection.to_string(),
            },
            source: left.clone(),
            target: right.clone(),
            foreign_key: rel.field_names[0].clone(),
        },
        Association {
            kind: AssociationKind::BelongsToMany {
                through: collection.to_string(),
            },
            source: right.clone(),
            target: left.clone(),
            foreign_key: rel.field_names[1].clone(),
        },
    ]
}
