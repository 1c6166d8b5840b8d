//! Locations inside nested request objects.
//!
//! Replace entries and dissection steps address values such as
//! `["emails", 0, "userId"]`. Serialized form is a JSON array of string keys
//! and integer indices; the `Display`/`From<&str>` form is dotted
//! (`emails.0.userId`).

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PathError;
use crate::types::{Object, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_key(&self) -> Cow<'_, str> {
        match self {
            Self::Key(key) => Cow::Borrowed(key),
            Self::Index(index) => Cow::Owned(index.to_string()),
        }
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(key) => key.parse().ok(),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(Vec<PathSegment>);

impl ObjectPath {
    /// The empty path, addressing the root object.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![PathSegment::Key(key.into())])
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.as_key())?;
        }
        Ok(())
    }
}

impl From<&str> for ObjectPath {
    /// Parses a dotted path. Purely numeric segments become indices.
    fn from(dotted: &str) -> Self {
        if dotted.is_empty() {
            return Self::root();
        }
        Self(
            dotted
                .split('.')
                .map(|part| {
                    part.parse::<usize>()
                        .map_or_else(|_| PathSegment::Key(part.to_string()), PathSegment::Index)
                })
                .collect(),
        )
    }
}

impl From<Vec<PathSegment>> for ObjectPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

fn describe(segments: &[PathSegment]) -> String {
    ObjectPath(segments.to_vec()).to_string()
}

fn step<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment.as_key().as_ref()),
        Value::Array(items) => segment.as_index().and_then(|index| items.get(index)),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment.as_key().as_ref()),
        Value::Array(items) => segment.as_index().and_then(|index| items.get_mut(index)),
        _ => None,
    }
}

/// Reads the value at `path`. The root path has no single value and yields `None`.
#[must_use]
pub fn get<'a>(root: &'a Object, path: &ObjectPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = root.get(first.as_key().as_ref())?;
    for segment in rest {
        current = step(current, segment)?;
    }
    Some(current)
}

/// Returns the nested object located at `segments` (the root for an empty slice).
///
/// # Errors
///
/// [`PathError::NotFound`] if a segment is missing, [`PathError::NotAnObject`]
/// if the location holds something other than an object.
pub fn object_at_mut<'a>(
    root: &'a mut Object,
    segments: &[PathSegment],
) -> Result<&'a mut Object, PathError> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(root);
    };
    let not_found = || PathError::NotFound {
        path: describe(segments),
    };

    let mut current = root.get_mut(first.as_key().as_ref()).ok_or_else(not_found)?;
    for segment in rest {
        current = step_mut(current, segment).ok_or_else(not_found)?;
    }
    current.as_object_mut().ok_or_else(|| PathError::NotAnObject {
        path: describe(segments),
    })
}

/// Writes `value` at `path`, replacing whatever was there. Every segment
/// except the last must already exist; the last one is created if missing.
///
/// # Errors
///
/// [`PathError::Empty`] for the root path, otherwise the errors of
/// [`object_at_mut`] for the parent location.
pub fn set(root: &mut Object, path: &ObjectPath, value: Value) -> Result<(), PathError> {
    let (last, parent) = path.segments().split_last().ok_or(PathError::Empty)?;
    let parent = object_at_mut(root, parent)?;
    parent.insert(last.as_key().into_owned(), value);
    Ok(())
}
