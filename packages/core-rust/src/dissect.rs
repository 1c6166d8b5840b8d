//! Default dissector for `ChildOf` nesting.

use crate::batch::{
    BatchOperation, CreateObjectDissection, CreateObjectOperation, DissectionStep, OperationBatch,
    Placeholder, ReplaceEntry,
};
use crate::error::BatchError;
use crate::path::ObjectPath;
use crate::registry::Registry;
use crate::traits::Dissector;
use crate::types::{Object, Value};

/// Dissects nested children keyed by collection name.
///
/// In a request against `user`, a key `email` holding an object or an array
/// of objects becomes one `CreateObject` per child when `email` has a
/// `ChildOf` relationship targeting `user`. Each child's relationship alias
/// is replaced with the parent's placeholder. Placeholders are `"1"`, `"2"`,
/// ... in creation order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildOfDissector;

impl ChildOfDissector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Dissector for ChildOfDissector {
    fn dissect(
        &self,
        registry: &Registry,
        collection: &str,
        args: &Object,
    ) -> anyhow::Result<(OperationBatch, CreateObjectDissection)> {
        let mut state = DissectionState::default();
        state.visit(registry, collection, args, &ObjectPath::root(), None)?;
        Ok((state.batch, state.dissection))
    }
}

#[derive(Default)]
struct DissectionState {
    batch: OperationBatch,
    dissection: CreateObjectDissection,
    next: u64,
}

/// Parent placeholder plus the alias a child uses to reference it.
struct ParentLink<'a> {
    placeholder: Placeholder,
    alias: &'a str,
}

impl DissectionState {
    fn next_placeholder(&mut self) -> Placeholder {
        self.next += 1;
        Placeholder::new(self.next.to_string())
    }

    fn visit(
        &mut self,
        registry: &Registry,
        collection: &str,
        object: &Object,
        path: &ObjectPath,
        parent: Option<ParentLink<'_>>,
    ) -> Result<(), BatchError> {
        if !registry.contains(collection) {
            return Err(BatchError::UnknownCollection {
                collection: collection.to_string(),
            });
        }

        let placeholder = self.next_placeholder();
        let mut args = Object::new();
        let mut children = Vec::new();
        for (key, value) in object {
            let child = registry
                .children_of(collection)
                .find(|(definition, _)| definition.name == *key)
                .filter(|_| holds_objects(value));
            match child {
                Some((definition, relationship)) => {
                    children.push((key, value, definition.name.as_str(), relationship.alias.as_str()));
                }
                None => {
                    args.insert(key.clone(), value.clone());
                }
            }
        }

        let replace = parent
            .map(|link| {
                vec![ReplaceEntry {
                    path: ObjectPath::key(link.alias),
                    placeholder: link.placeholder,
                }]
            })
            .unwrap_or_default();
        self.batch.push(BatchOperation::CreateObject(CreateObjectOperation {
            collection: collection.to_string(),
            args,
            placeholder: placeholder.clone(),
            replace,
        }));
        self.dissection.push(DissectionStep {
            path: path.clone(),
            placeholder: placeholder.clone(),
        });

        for (key, value, child_collection, alias) in children {
            let link = || ParentLink {
                placeholder: placeholder.clone(),
                alias,
            };
            match value {
                Value::Object(nested) => {
                    self.visit(registry, child_collection, nested, &path.child(key.as_str()), Some(link()))?;
                }
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        if let Value::Object(nested) = item {
                            let item_path = path.child(key.as_str()).child(index);
                            self.visit(registry, child_collection, nested, &item_path, Some(link()))?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn holds_objects(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}
