//! The repository capability interface.

use crate::changeset::{Changeset, ChangesetRange};
use crate::error::RepoResult;
use crate::id::{Id64, RepositoryId};
use crate::records::{
    ClassName, Code, CodeSpecProps, ContainerProps, EntityProps, FacetKind, FacetProps,
    RecordKind, RelationshipProps,
};
use crate::schema::{SchemaInfo, SchemaVersion};
use std::path::Path;
use uuid::Uuid;

/// Lazy sequence of identifiers.
///
/// Calling the enumeration again restarts the sequence.
pub type IdIter<'a> = Box<dyn Iterator<Item = Id64> + 'a>;

/// How `insert_*` obtains the identifier of the new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// The repository allocates a fresh identifier.
    #[default]
    Allocate,
    /// The record's own `id` is used; fails if it is occupied.
    Preserve,
}

/// Filter for [`Repository::enumerate_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdQuery {
    /// Kind of record to enumerate.
    pub kind: RecordKind,
    /// Restrict to this class.
    pub class_name: Option<ClassName>,
    /// Also match subclasses of `class_name`.
    pub include_subclasses: bool,
    /// Restrict entities to this container.
    pub container: Option<Id64>,
}

impl IdQuery {
    /// All records of `kind`.
    #[must_use]
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            class_name: None,
            include_subclasses: false,
            container: None,
        }
    }

    /// All entities.
    #[must_use]
    pub fn entities() -> Self {
        Self::new(RecordKind::Entity)
    }

    /// All facets, ordered by owner.
    #[must_use]
    pub fn facets() -> Self {
        Self::new(RecordKind::Facet)
    }

    /// All relationships.
    #[must_use]
    pub fn relationships() -> Self {
        Self::new(RecordKind::Relationship)
    }

    /// Restricts to exactly `class_name`.
    #[must_use]
    pub fn of_class(mut self, class_name: ClassName) -> Self {
        self.class_name = Some(class_name);
        self.include_subclasses = false;
        self
    }

    /// Restricts to `class_name` and its subclasses.
    #[must_use]
    pub fn of_class_polymorphic(mut self, class_name: ClassName) -> Self {
        self.class_name = Some(class_name);
        self.include_subclasses = true;
        self
    }

    /// Restricts entities to `container`.
    #[must_use]
    pub fn in_container(mut self, container: Id64) -> Self {
        self.container = Some(container);
        self
    }
}

/// Capability interface of a schema-typed hierarchical repository.
///
/// Implementations own storage, locking, the schema compiler and the
/// changeset codec. Every method is a potential suspension point of a
/// transformation run; everything else the engine does is synchronous.
///
/// # Invariants
///
/// - Identifiers are unique within the repository and never reused
/// - Non-empty codes are unique within `(spec, scope)`
/// - A container's identifier equals its defining entity's identifier
/// - Facet enumeration is ordered by owner, then facet identifier
/// - Every successful write is recorded as a pending changeset row
///
/// # Implementors
///
/// - [`crate::MemoryRepository`] - For tests and ephemeral copies
pub trait Repository: Send + Sync {
    /// Identifier of the repository.
    fn id(&self) -> RepositoryId;

    /// Reads an entity.
    fn get_entity(&self, id: Id64) -> RepoResult<Option<EntityProps>>;

    /// Reads a container.
    fn get_container(&self, id: Id64) -> RepoResult<Option<ContainerProps>>;

    /// Reads a relationship.
    fn get_relationship(&self, id: Id64) -> RepoResult<Option<RelationshipProps>>;

    /// Reads a facet.
    fn get_facet(&self, id: Id64) -> RepoResult<Option<FacetProps>>;

    /// Reads the facets of `owner`, optionally restricted to one class,
    /// ordered by facet identifier.
    fn get_facets(&self, owner: Id64, class_name: Option<&ClassName>)
        -> RepoResult<Vec<FacetProps>>;

    /// Reads a code spec.
    fn get_code_spec(&self, id: Id64) -> RepoResult<Option<CodeSpecProps>>;

    /// Finds a code spec by name.
    fn find_code_spec(&self, name: &str) -> RepoResult<Option<Id64>>;

    /// Finds the entity carrying a non-empty `code`.
    fn find_entity_by_code(&self, code: &Code) -> RepoResult<Option<Id64>>;

    /// Finds the entity with `guid` as federation GUID.
    fn find_entity_by_federation_guid(&self, guid: Uuid) -> RepoResult<Option<Id64>>;

    /// Finds a relationship of exactly `class_name` between two entities.
    fn find_relationship(
        &self,
        class_name: &ClassName,
        source: Id64,
        target: Id64,
    ) -> RepoResult<Option<Id64>>;

    /// Enumerates identifiers matching `query`.
    fn enumerate_ids(&self, query: &IdQuery) -> RepoResult<IdIter<'_>>;

    /// Concrete facet classes of `kind` that have at least one facet.
    fn facet_classes(&self, kind: FacetKind) -> RepoResult<Vec<ClassName>>;

    /// Returns true if `class_name` is `base` or derives from it.
    fn is_subclass_of(&self, class_name: &ClassName, base: &ClassName) -> bool;

    /// Inserts an entity and returns its identifier.
    fn insert_entity(&self, props: &EntityProps, mode: InsertMode) -> RepoResult<Id64>;

    /// Replaces an existing entity.
    fn update_entity(&self, props: &EntityProps) -> RepoResult<()>;

    /// Deletes an entity, its children, its facets, the relationships
    /// touching it, and the container it defines with all contents.
    fn delete_entity(&self, id: Id64) -> RepoResult<()>;

    /// Inserts the container defined by entity `props.id`.
    fn insert_container(&self, props: &ContainerProps) -> RepoResult<()>;

    /// Replaces an existing container.
    fn update_container(&self, props: &ContainerProps) -> RepoResult<()>;

    /// Deletes a container and all of its contents.
    fn delete_container(&self, id: Id64) -> RepoResult<()>;

    /// Inserts a relationship and returns its identifier.
    fn insert_relationship(&self, props: &RelationshipProps, mode: InsertMode) -> RepoResult<Id64>;

    /// Replaces an existing relationship.
    fn update_relationship(&self, props: &RelationshipProps) -> RepoResult<()>;

    /// Deletes a relationship.
    fn delete_relationship(&self, id: Id64) -> RepoResult<()>;

    /// Inserts a facet and returns its identifier.
    fn insert_facet(&self, props: &FacetProps, mode: InsertMode) -> RepoResult<Id64>;

    /// Replaces an existing facet.
    fn update_facet(&self, props: &FacetProps) -> RepoResult<()>;

    /// Deletes a facet.
    fn delete_facet(&self, id: Id64) -> RepoResult<()>;

    /// Inserts a code spec and returns its identifier.
    fn insert_code_spec(&self, props: &CodeSpecProps, mode: InsertMode) -> RepoResult<Id64>;

    /// Version of the named schema, if present.
    fn query_schema_version(&self, name: &str) -> RepoResult<Option<SchemaVersion>>;

    /// All schemas, in no particular order.
    fn schemas(&self) -> RepoResult<Vec<SchemaInfo>>;

    /// Imports or upgrades schemas.
    ///
    /// Each schema's references must already be present or appear earlier
    /// in `schemas`.
    fn import_schemas(&self, schemas: &[SchemaInfo]) -> RepoResult<()>;

    /// Index of the last changeset in the history (0 when empty).
    fn changeset_index(&self) -> u64;

    /// Returns true if there are changes not yet saved.
    fn has_pending_changes(&self) -> bool;

    /// Commits pending changes as a new changeset.
    ///
    /// Returns the new index, or `None` when nothing was pending.
    fn save_changes(&self, description: &str) -> RepoResult<Option<u64>>;

    /// Returns the changesets in `range`.
    fn download_changesets(&self, range: ChangesetRange) -> RepoResult<Vec<Changeset>>;

    /// Applies a changeset produced by another copy of this repository.
    fn apply_changeset(&self, changeset: &Changeset) -> RepoResult<()>;

    /// Reads a changeset file.
    fn read_changeset(&self, path: &Path) -> RepoResult<Changeset> {
        Changeset::read_from(path)
    }

    /// Writes a changeset file.
    fn write_changeset(&self, path: &Path, changeset: &Changeset) -> RepoResult<()> {
        changeset.write_to(path)
    }
}
