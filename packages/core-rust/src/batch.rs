//! Operation batches, dissections, and the placeholder table.
//!
//! A dissector flattens one nested create request into an [`OperationBatch`]
//! plus a [`CreateObjectDissection`]. The backend executes the batch in order,
//! resolving placeholders through a [`PlaceholderTable`], and then
//! [`reconstruct_created_object`] writes the generated primary keys back into
//! the original request.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::path::{self, ObjectPath};
use crate::registry::Registry;
use crate::types::{Object, Value};

/// Opaque name of a not-yet-executed create operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Placeholder(String);

impl Placeholder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Placeholder {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Overwrite `path` in the operation's args with the primary key of `placeholder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceEntry {
    pub path: ObjectPath,
    pub placeholder: Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObjectOperation {
    pub collection: String,
    pub args: Object,
    pub placeholder: Placeholder,
    #[serde(default)]
    pub replace: Vec<ReplaceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateObjectsOperation {
    pub collection: String,
    #[serde(rename = "where")]
    pub where_: Object,
    pub updates: Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum BatchOperation {
    CreateObject(CreateObjectOperation),
    UpdateObjects(UpdateObjectsOperation),
}

impl BatchOperation {
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::CreateObject(op) => &op.collection,
            Self::UpdateObjects(op) => &op.collection,
        }
    }
}

/// Ordered operations; every placeholder reference points at an earlier create.
pub type OperationBatch = Vec<BatchOperation>;

/// Where a placeholder's primary key lands in the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DissectionStep {
    /// Location of the nested object that receives the key (root when empty).
    pub path: ObjectPath,
    pub placeholder: Placeholder,
}

pub type CreateObjectDissection = Vec<DissectionStep>;

/// A row created while executing a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObject {
    pub collection: String,
    pub primary_key: Value,
    /// Row as returned to callers (relationship keys in their alias form).
    pub object: Object,
}

/// Placeholder → created row, for every create in the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchExecutionResult {
    pub info: BTreeMap<Placeholder, ResolvedObject>,
}

impl BatchExecutionResult {
    #[must_use]
    pub fn get(&self, placeholder: &Placeholder) -> Option<&ResolvedObject> {
        self.info.get(placeholder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.info.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

/// Pending-reference table used while a batch executes.
///
/// Placeholders are resolved strictly in batch order: a lookup of a
/// placeholder that has not been registered yet fails instead of being
/// silently skipped.
#[derive(Debug, Default)]
pub struct PlaceholderTable {
    resolved: BTreeMap<Placeholder, ResolvedObject>,
}

impl PlaceholderTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the row created for `placeholder`.
    ///
    /// # Errors
    ///
    /// [`BatchError::DuplicatePlaceholder`] if the placeholder was already
    /// produced; [`BatchError::MissingPrimaryKey`] if the row lacks `pk_index`.
    pub fn register(
        &mut self,
        placeholder: Placeholder,
        collection: &str,
        pk_index: &str,
        object: Object,
    ) -> Result<&ResolvedObject, BatchError> {
        if self.resolved.contains_key(&placeholder) {
            return Err(BatchError::DuplicatePlaceholder {
                placeholder: placeholder.to_string(),
            });
        }
        let primary_key = object
            .get(pk_index)
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| BatchError::MissingPrimaryKey {
                placeholder: placeholder.to_string(),
                field: pk_index.to_string(),
            })?;

        let resolved = self.resolved.entry(placeholder).or_insert(ResolvedObject {
            collection: collection.to_string(),
            primary_key,
            object,
        });
        Ok(resolved)
    }

    /// Primary key generated for an earlier placeholder.
    ///
    /// # Errors
    ///
    /// [`BatchError::UnresolvedPlaceholder`] if it has not been produced yet.
    pub fn primary_key(&self, placeholder: &Placeholder) -> Result<&Value, BatchError> {
        self.resolved
            .get(placeholder)
            .map(|resolved| &resolved.primary_key)
            .ok_or_else(|| BatchError::UnresolvedPlaceholder {
                placeholder: placeholder.to_string(),
            })
    }

    /// Applies every replace entry of a create operation to its args.
    ///
    /// # Errors
    ///
    /// Fails on an unresolved placeholder or a path whose parent is missing.
    pub fn apply_replacements(
        &self,
        args: &mut Object,
        replace: &[ReplaceEntry],
    ) -> Result<(), BatchError> {
        for entry in replace {
            let primary_key = self.primary_key(&entry.placeholder)?.clone();
            path::set(args, &entry.path, primary_key)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn into_result(self) -> BatchExecutionResult {
        BatchExecutionResult {
            info: self.resolved,
        }
    }
}

/// Writes each step's primary key into `object` at the step's path, under
/// the primary key field of the collection that produced it.
///
/// Only the addressed fields change; everything else in `object` is left as supplied.
///
/// # Errors
///
/// Fails when a step names a placeholder missing from `result`, a
/// collection unknown to the registry, or a path that does not exist.
pub fn reconstruct_created_object(
    object: &mut Object,
    dissection: &[DissectionStep],
    result: &BatchExecutionResult,
    registry: &Registry,
) -> Result<(), BatchError> {
    for step in dissection {
        let resolved = result
            .get(&step.placeholder)
            .ok_or_else(|| BatchError::UnresolvedPlaceholder {
                placeholder: step.placeholder.to_string(),
            })?;
        let definition = registry.collection(&resolved.collection).ok_or_else(|| {
            BatchError::UnknownCollection {
                collection: resolved.collection.clone(),
            }
        })?;

        let target = path::object_at_mut(object, step.path.segments())?;
        target.insert(definition.pk_index.clone(), resolved.primary_key.clone());
    }
    Ok(())
}
