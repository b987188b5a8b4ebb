//! Property values carried in record property bags.

use crate::id::Id64;
use crate::records::ClassName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Property bag of a record, keyed by property name.
pub type PropertyBag = BTreeMap<String, PropertyValue>;

/// A reference from one record to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationValue {
    /// The referenced entity. The invalid id means "no reference".
    pub id: Id64,
    /// Relationship class describing the reference, if any.
    pub relationship_class: Option<ClassName>,
}

/// A dynamic property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// A GUID.
    Guid(Uuid),
    /// Reference to an entity in the same repository.
    Navigation(NavigationValue),
    /// Ordered values.
    Array(Vec<PropertyValue>),
    /// Nested property bag.
    Struct(PropertyBag),
}

impl PropertyValue {
    /// Creates a navigation value without a relationship class.
    #[must_use]
    pub fn navigation(id: Id64) -> Self {
        PropertyValue::Navigation(NavigationValue {
            id,
            relationship_class: None,
        })
    }

    /// Creates a text value.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        PropertyValue::Text(value.into())
    }

    /// Returns the navigation value, if this is one.
    #[must_use]
    pub fn as_navigation(&self) -> Option<&NavigationValue> {
        match self {
            PropertyValue::Navigation(nav) => Some(nav),
            _ => None,
        }
    }

    /// Returns the text, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integer, if this is an integer value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

/// One step of a [`PropertyPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Property name in a bag.
    Key(String),
    /// Position in an array.
    Index(usize),
}

/// Location of a value inside a property bag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PropertyPath(Vec<PathSegment>);

impl PropertyPath {
    /// Path of a top-level property.
    #[must_use]
    pub fn property(name: impl Into<String>) -> Self {
        Self(vec![PathSegment::Key(name.into())])
    }

    /// Returns the segments.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Resolves the path to a mutable value inside `bag`.
    pub fn get_mut<'a>(&self, bag: &'a mut PropertyBag) -> Option<&'a mut PropertyValue> {
        let (first, rest) = self.0.split_first()?;
        let PathSegment::Key(name) = first else {
            return None;
        };
        let mut current = bag.get_mut(name)?;
        for segment in rest {
            current = match (segment, current) {
                (PathSegment::Key(key), PropertyValue::Struct(inner)) => inner.get_mut(key)?,
                (PathSegment::Index(index), PropertyValue::Array(items)) => items.get_mut(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolves the path to a value inside `bag`.
    pub fn get<'a>(&self, bag: &'a PropertyBag) -> Option<&'a PropertyValue> {
        let (first, rest) = self.0.split_first()?;
        let PathSegment::Key(name) = first else {
            return None;
        };
        let mut current = bag.get(name)?;
        for segment in rest {
            current = match (segment, current) {
                (PathSegment::Key(key), PropertyValue::Struct(inner)) => inner.get(key)?,
                (PathSegment::Index(index), PropertyValue::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// Calls `visit` for every navigation value in `bag`, depth first.
pub fn for_each_reference_mut<F>(bag: &mut PropertyBag, visit: &mut F)
where
    F: FnMut(&PropertyPath, &mut NavigationValue),
{
    for (name, value) in bag.iter_mut() {
        visit_value_mut(&PropertyPath::property(name.clone()), value, visit);
    }
}

fn visit_value_mut<F>(path: &PropertyPath, value: &mut PropertyValue, visit: &mut F)
where
    F: FnMut(&PropertyPath, &mut NavigationValue),
{
    match value {
        PropertyValue::Navigation(nav) => visit(path, nav),
        PropertyValue::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                visit_value_mut(&path.child(PathSegment::Index(index)), item, visit);
            }
        }
        PropertyValue::Struct(inner) => {
            for (key, item) in inner.iter_mut() {
                visit_value_mut(&path.child(PathSegment::Key(key.clone())), item, visit);
            }
        }
        _ => {}
    }
}

/// Collects every valid navigation target in `bag`.
#[must_use]
pub fn references(bag: &PropertyBag) -> Vec<Id64> {
    fn collect(value: &PropertyValue, out: &mut Vec<Id64>) {
        match value {
            PropertyValue::Navigation(nav) if nav.id.is_valid() => out.push(nav.id),
            PropertyValue::Array(items) => items.iter().for_each(|item| collect(item, out)),
            PropertyValue::Struct(inner) => inner.values().for_each(|item| collect(item, out)),
            _ => {}
        }
    }

    let mut out = Vec::new();
    bag.values().for_each(|value| collect(value, &mut out));
    out
}
