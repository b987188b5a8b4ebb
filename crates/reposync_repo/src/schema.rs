//! Versioned schemas and class definitions.

use crate::provenance::PROVENANCE_CLASS;
use crate::records::ClassName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the schema every repository is created with.
pub const CORE_SCHEMA: &str = "Core";

/// Version of a schema: `read.write.minor`.
///
/// Versions order lexicographically by their three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Read-compatibility version.
    pub read: u32,
    /// Write-compatibility version.
    pub write: u32,
    /// Minor version.
    pub minor: u32,
}

impl SchemaVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(read: u32, write: u32, minor: u32) -> Self {
        Self { read, write, minor }
    }

    /// Parses `RR.WW.mm`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.').map(|part| part.parse::<u32>().ok());
        let read = parts.next()??;
        let write = parts.next()??;
        let minor = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(read, write, minor))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{:02}.{:02}", self.read, self.write, self.minor)
    }
}

/// What a class describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassKind {
    /// Entity class.
    Entity,
    /// Container class.
    Container,
    /// Relationship class.
    Relationship,
    /// Unique facet class.
    UniqueFacet,
    /// Multi facet class.
    MultiFacet,
}

/// A class defined by a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    /// Fully qualified name.
    pub name: ClassName,
    /// Kind of record the class describes.
    pub kind: ClassKind,
    /// Base class, possibly from a referenced schema.
    pub base: Option<ClassName>,
}

impl ClassDef {
    /// Creates a class definition.
    pub fn new(name: impl Into<String>, kind: ClassKind, base: Option<&str>) -> Self {
        Self {
            name: ClassName::new(name),
            kind,
            base: base.map(ClassName::new),
        }
    }
}

/// A versioned schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Schema name.
    pub name: String,
    /// Schema version.
    pub version: SchemaVersion,
    /// Names of schemas this schema depends on.
    pub references: Vec<String>,
    /// Classes defined by this schema.
    pub classes: Vec<ClassDef>,
}

impl SchemaInfo {
    /// Creates an empty schema.
    pub fn new(name: impl Into<String>, version: SchemaVersion) -> Self {
        Self {
            name: name.into(),
            version,
            references: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Adds a schema reference.
    #[must_use]
    pub fn with_reference(mut self, schema: impl Into<String>) -> Self {
        self.references.push(schema.into());
        self
    }

    /// Adds a class.
    #[must_use]
    pub fn with_class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    /// Finds a class by full name.
    #[must_use]
    pub fn class(&self, name: &ClassName) -> Option<&ClassDef> {
        self.classes.iter().find(|class| &class.name == name)
    }
}

/// The schema every repository starts with.
#[must_use]
pub fn core_schema() -> SchemaInfo {
    SchemaInfo::new(CORE_SCHEMA, SchemaVersion::new(1, 0, 0))
        .with_class(ClassDef::new("Core:Element", ClassKind::Entity, None))
        .with_class(ClassDef::new("Core:Subject", ClassKind::Entity, Some("Core:Element")))
        .with_class(ClassDef::new("Core:Partition", ClassKind::Entity, Some("Core:Element")))
        .with_class(ClassDef::new("Core:Model", ClassKind::Container, None))
        .with_class(ClassDef::new("Core:RepositoryModel", ClassKind::Container, Some("Core:Model")))
        .with_class(ClassDef::new("Core:DictionaryModel", ClassKind::Container, Some("Core:Model")))
        .with_class(ClassDef::new("Core:ElementRefersToElements", ClassKind::Relationship, None))
        .with_class(ClassDef::new("Core:UniqueAspect", ClassKind::UniqueFacet, None))
        .with_class(ClassDef::new("Core:MultiAspect", ClassKind::MultiFacet, None))
        .with_class(ClassDef::new(
            PROVENANCE_CLASS,
            ClassKind::MultiFacet,
            Some("Core:MultiAspect"),
        ))
}
