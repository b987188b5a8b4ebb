//! # reposync repository layer
//!
//! Data model and capability interface for the repositories that
//! reposync transforms and synchronizes.
//!
//! A repository stores entities organized into containers, relationships
//! between entities, facets owned by entities, code specifications and a
//! versioned schema, and records every local change into a changeset
//! history. The transformation engine only talks to repositories through
//! the [`Repository`] trait; the storage format behind it is not its
//! concern.
//!
//! ## Design Principles
//!
//! - Identifiers are opaque 64-bit values rendered as lowercase hex
//! - Every write is recorded as a changeset row until `save_changes`
//! - Repositories are `Send + Sync` and take `&self` for writes
//! - Provenance is ordinary facet data with a well-known class
//!
//! ## Available Implementations
//!
//! - [`MemoryRepository`] - For tests, benchmarks and ephemeral copies
//!
//! ## Example
//!
//! ```rust
//! use reposync_repo::{ClassName, EntityProps, Id64, MemoryRepository, Repository, InsertMode};
//!
//! let repo = MemoryRepository::new();
//! let props = EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER);
//! let id = repo.insert_entity(&props, InsertMode::Allocate).unwrap();
//! assert!(repo.get_entity(id).unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod error;
mod id;
mod memory;
mod provenance;
mod records;
mod repository;
mod schema;
mod value;

pub use changeset::{ChangeOp, Changeset, ChangesetRange, ChangesetRow, RowImage, TableKind};
pub use error::{RepoError, RepoResult};
pub use id::{Id64, RepositoryId};
pub use memory::MemoryRepository;
pub use provenance::{is_provenance_class, ProvenanceKind, ProvenanceRecord, PROVENANCE_CLASS};
pub use records::{
    ClassName, Code, CodeSpecProps, ContainerProps, EntityProps, FacetKind, FacetProps,
    RecordKind, RelationshipProps,
};
pub use repository::{IdIter, IdQuery, InsertMode, Repository};
pub use schema::{core_schema, ClassDef, ClassKind, SchemaInfo, SchemaVersion, CORE_SCHEMA};
pub use value::{
    for_each_reference_mut, references, NavigationValue, PathSegment, PropertyBag, PropertyPath,
    PropertyValue,
};
