//! Record types stored in a repository.

use crate::id::Id64;
use crate::value::{PropertyBag, PropertyValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fully qualified class name, `Schema:Class`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassName(String);

impl ClassName {
    /// Creates a class name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the full name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the schema part (before the `:`), or the whole name.
    #[must_use]
    pub fn schema_name(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(schema, _)| schema)
    }
}

impl fmt::Debug for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassName({})", self.0)
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The kind of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    /// An entity.
    Entity,
    /// A container (model).
    Container,
    /// A relationship between two entities.
    Relationship,
    /// A facet owned by an entity.
    Facet,
    /// A code specification.
    CodeSpec,
}

/// Uniqueness key of an entity.
///
/// Non-empty code values are unique within `(spec, scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code {
    /// Code specification.
    pub spec: Id64,
    /// Entity that scopes the code.
    pub scope: Id64,
    /// Code value. Empty means "no code".
    pub value: String,
}

impl Code {
    /// Creates a code.
    pub fn new(spec: Id64, scope: Id64, value: impl Into<String>) -> Self {
        Self {
            spec,
            scope,
            value: value.into(),
        }
    }

    /// The empty code, scoped to the root entity.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Id64::INVALID, Id64::ROOT_ENTITY, "")
    }

    /// Returns true if the code carries no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Default for Code {
    fn default() -> Self {
        Self::empty()
    }
}

/// A named code specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSpecProps {
    /// Identifier.
    pub id: Id64,
    /// Name, unique within the repository.
    pub name: String,
    /// Additional properties.
    pub properties: PropertyBag,
}

impl CodeSpecProps {
    /// Creates a code spec with no identifier yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Id64::INVALID,
            name: name.into(),
            properties: PropertyBag::new(),
        }
    }
}

/// An addressable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProps {
    /// Identifier (invalid until inserted).
    pub id: Id64,
    /// Class of the entity.
    pub class_name: ClassName,
    /// Container that owns the entity.
    pub container: Id64,
    /// Optional parent entity.
    pub parent: Option<Id64>,
    /// Uniqueness key.
    pub code: Code,
    /// Repository-independent identity, if assigned.
    pub federation_guid: Option<Uuid>,
    /// Display label.
    pub user_label: Option<String>,
    /// Class-specific properties.
    pub properties: PropertyBag,
}

impl EntityProps {
    /// Creates an entity in `container` with an empty code.
    pub fn new(class_name: ClassName, container: Id64) -> Self {
        Self {
            id: Id64::INVALID,
            class_name,
            container,
            parent: None,
            code: Code::empty(),
            federation_guid: None,
            user_label: None,
            properties: PropertyBag::new(),
        }
    }

    /// Sets the parent entity.
    #[must_use]
    pub fn with_parent(mut self, parent: Id64) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the code.
    #[must_use]
    pub fn with_code(mut self, code: Code) -> Self {
        self.code = code;
        self
    }

    /// Sets the federation GUID.
    #[must_use]
    pub fn with_federation_guid(mut self, guid: Uuid) -> Self {
        self.federation_guid = Some(guid);
        self
    }

    /// Sets the user label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.user_label = Some(label.into());
        self
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Returns a copy with the identifier cleared, for content comparison.
    #[must_use]
    pub fn without_id(&self) -> Self {
        Self {
            id: Id64::INVALID,
            ..self.clone()
        }
    }
}

/// A container of entities, defined by the entity with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerProps {
    /// Identifier, equal to the defining entity's identifier.
    pub id: Id64,
    /// Class of the container.
    pub class_name: ClassName,
    /// Whether the container is hidden from ordinary browsing.
    pub is_private: bool,
    /// Class-specific properties.
    pub properties: PropertyBag,
}

impl ContainerProps {
    /// Creates a container defined by `defining_entity`.
    pub fn new(class_name: ClassName, defining_entity: Id64) -> Self {
        Self {
            id: defining_entity,
            class_name,
            is_private: false,
            properties: PropertyBag::new(),
        }
    }
}

/// A link record between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipProps {
    /// Identifier (invalid until inserted).
    pub id: Id64,
    /// Class of the relationship.
    pub class_name: ClassName,
    /// Source entity.
    pub source: Id64,
    /// Target entity.
    pub target: Id64,
    /// Class-specific properties.
    pub properties: PropertyBag,
}

impl RelationshipProps {
    /// Creates a relationship between `source` and `target`.
    pub fn new(class_name: ClassName, source: Id64, target: Id64) -> Self {
        Self {
            id: Id64::INVALID,
            class_name,
            source,
            target,
            properties: PropertyBag::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// Cardinality of a facet class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FacetKind {
    /// At most one facet per owner per class.
    Unique,
    /// Any number of ordered facets per owner per class.
    Multi,
}

/// Auxiliary data owned by exactly one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetProps {
    /// Identifier (invalid until inserted).
    pub id: Id64,
    /// Class of the facet.
    pub class_name: ClassName,
    /// Cardinality.
    pub kind: FacetKind,
    /// Owning entity.
    pub owner: Id64,
    /// Class-specific properties.
    pub properties: PropertyBag,
}

impl FacetProps {
    /// Creates a facet owned by `owner`.
    pub fn new(class_name: ClassName, kind: FacetKind, owner: Id64) -> Self {
        Self {
            id: Id64::INVALID,
            class_name,
            kind,
            owner,
            properties: PropertyBag::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}
