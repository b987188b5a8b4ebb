//! In-memory repository for tests and ephemeral copies.

use crate::changeset::{ChangeOp, Changeset, ChangesetRange, ChangesetRow, RowImage};
use crate::error::{RepoError, RepoResult};
use crate::id::{Id64, RepositoryId};
use crate::records::{
    ClassName, Code, CodeSpecProps, ContainerProps, EntityProps, FacetKind, FacetProps,
    RecordKind, RelationshipProps,
};
use crate::repository::{IdIter, IdQuery, InsertMode, Repository};
use crate::schema::{core_schema, SchemaInfo, SchemaVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Maximum depth followed when walking class inheritance.
const MAX_CLASS_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct State {
    entities: BTreeMap<Id64, EntityProps>,
    containers: BTreeMap<Id64, ContainerProps>,
    relationships: BTreeMap<Id64, RelationshipProps>,
    facets: BTreeMap<Id64, FacetProps>,
    code_specs: BTreeMap<Id64, CodeSpecProps>,
    schemas: BTreeMap<String, SchemaInfo>,
    codes: HashMap<Code, Id64>,
    federation_guids: HashMap<Uuid, Id64>,
    next_id: u64,
    pending: Vec<ChangesetRow>,
    history: Vec<Changeset>,
}

impl State {
    fn new() -> Self {
        let mut state = Self {
            entities: BTreeMap::new(),
            containers: BTreeMap::new(),
            relationships: BTreeMap::new(),
            facets: BTreeMap::new(),
            code_specs: BTreeMap::new(),
            schemas: BTreeMap::new(),
            codes: HashMap::new(),
            federation_guids: HashMap::new(),
            next_id: Id64::FIRST_USER_ID,
            pending: Vec::new(),
            history: Vec::new(),
        };

        let core = core_schema();
        state.schemas.insert(core.name.clone(), core);

        let mut root = EntityProps::new(ClassName::new("Core:Subject"), Id64::ROOT_CONTAINER);
        root.id = Id64::ROOT_ENTITY;
        let mut dictionary =
            EntityProps::new(ClassName::new("Core:Partition"), Id64::ROOT_CONTAINER)
                .with_parent(Id64::ROOT_ENTITY);
        dictionary.id = Id64::DICTIONARY;
        state.entities.insert(root.id, root);
        state.entities.insert(dictionary.id, dictionary);
        state.containers.insert(
            Id64::ROOT_CONTAINER,
            ContainerProps::new(ClassName::new("Core:RepositoryModel"), Id64::ROOT_CONTAINER),
        );
        state.containers.insert(
            Id64::DICTIONARY,
            ContainerProps::new(ClassName::new("Core:DictionaryModel"), Id64::DICTIONARY),
        );
        state
    }

    fn is_occupied(&self, id: Id64) -> bool {
        self.entities.contains_key(&id)
            || self.relationships.contains_key(&id)
            || self.facets.contains_key(&id)
            || self.code_specs.contains_key(&id)
    }

    /// Resolves the identifier of a new record. Must run after validation.
    fn claim_id(&mut self, requested: Id64, mode: InsertMode) -> RepoResult<Id64> {
        match mode {
            InsertMode::Allocate => {
                let id = Id64::new(self.next_id);
                self.next_id += 1;
                Ok(id)
            }
            InsertMode::Preserve => {
                if !requested.is_valid() {
                    return Err(RepoError::invalid_operation(
                        "preserving insert requires a valid identifier",
                    ));
                }
                if self.is_occupied(requested) {
                    return Err(RepoError::IdentifierInUse { id: requested });
                }
                self.bump_next_id(requested);
                Ok(requested)
            }
        }
    }

    fn bump_next_id(&mut self, id: Id64) {
        self.next_id = self.next_id.max(id.value() + 1);
    }

    fn check_preservable(&self, requested: Id64, mode: InsertMode) -> RepoResult<()> {
        if mode == InsertMode::Preserve && self.is_occupied(requested) {
            return Err(RepoError::IdentifierInUse { id: requested });
        }
        Ok(())
    }

    fn check_entity_refs(&self, props: &EntityProps) -> RepoResult<()> {
        if !self.containers.contains_key(&props.container) {
            return Err(RepoError::ContainerNotFound {
                id: props.container,
            });
        }
        if let Some(parent) = props.parent {
            if parent == props.id && props.id.is_valid() {
                return Err(RepoError::invalid_operation(format!(
                    "entity {parent} cannot be its own parent"
                )));
            }
            if !self.entities.contains_key(&parent) {
                return Err(RepoError::EntityNotFound { id: parent });
            }
        }
        Ok(())
    }

    fn check_code(&self, code: &Code, owner: Id64) -> RepoResult<()> {
        if code.is_empty() {
            return Ok(());
        }
        match self.codes.get(code) {
            Some(existing) if *existing != owner => Err(RepoError::DuplicateCode {
                spec: code.spec,
                scope: code.scope,
                value: code.value.clone(),
                existing: *existing,
            }),
            _ => Ok(()),
        }
    }

    fn index_entity(&mut self, entity: &EntityProps) {
        if !entity.code.is_empty() {
            self.codes.insert(entity.code.clone(), entity.id);
        }
        if let Some(guid) = entity.federation_guid {
            self.federation_guids.insert(guid, entity.id);
        }
    }

    fn unindex_entity(&mut self, entity: &EntityProps) {
        if self.codes.get(&entity.code) == Some(&entity.id) {
            self.codes.remove(&entity.code);
        }
        if let Some(guid) = entity.federation_guid {
            if self.federation_guids.get(&guid) == Some(&entity.id) {
                self.federation_guids.remove(&guid);
            }
        }
    }

    fn children_of(&self, id: Id64) -> Vec<Id64> {
        self.entities
            .values()
            .filter(|entity| entity.parent == Some(id) && entity.id != id)
            .map(|entity| entity.id)
            .collect()
    }

    fn contents_of(&self, container: Id64) -> Vec<Id64> {
        self.entities
            .values()
            .filter(|entity| entity.container == container && entity.id != container)
            .map(|entity| entity.id)
            .collect()
    }

    fn delete_entity_cascade(&mut self, id: Id64) {
        if !self.entities.contains_key(&id) {
            return;
        }
        for child in self.children_of(id) {
            self.delete_entity_cascade(child);
        }
        if self.containers.contains_key(&id) {
            self.delete_container_cascade(id);
        }

        let owned: Vec<Id64> = self
            .facets
            .values()
            .filter(|facet| facet.owner == id)
            .map(|facet| facet.id)
            .collect();
        for facet_id in owned {
            if let Some(facet) = self.facets.remove(&facet_id) {
                self.pending.push(ChangesetRow::deleted(RowImage::Facet(facet)));
            }
        }

        let touching: Vec<Id64> = self
            .relationships
            .values()
            .filter(|rel| rel.source == id || rel.target == id)
            .map(|rel| rel.id)
            .collect();
        for rel_id in touching {
            if let Some(rel) = self.relationships.remove(&rel_id) {
                self.pending.push(ChangesetRow::deleted(RowImage::Relationship(rel)));
            }
        }

        if let Some(entity) = self.entities.remove(&id) {
            self.unindex_entity(&entity);
            self.pending.push(ChangesetRow::deleted(RowImage::Entity(entity)));
        }
    }

    fn delete_container_cascade(&mut self, id: Id64) {
        let Some(container) = self.containers.remove(&id) else {
            return;
        };
        for content in self.contents_of(id) {
            self.delete_entity_cascade(content);
        }
        self.pending.push(ChangesetRow::deleted(RowImage::Container(container)));
    }

    fn class_base(&self, class_name: &ClassName) -> Option<ClassName> {
        let schema = self.schemas.get(class_name.schema_name())?;
        schema.class(class_name)?.base.clone()
    }

    fn is_subclass_of(&self, class_name: &ClassName, base: &ClassName) -> bool {
        let mut current = class_name.clone();
        for _ in 0..MAX_CLASS_DEPTH {
            if &current == base {
                return true;
            }
            match self.class_base(&current) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    fn class_matches(&self, query: &IdQuery, class_name: &ClassName) -> bool {
        match &query.class_name {
            None => true,
            Some(wanted) if query.include_subclasses => self.is_subclass_of(class_name, wanted),
            Some(wanted) => wanted == class_name,
        }
    }

    fn apply_image(&mut self, image: RowImage) {
        match image {
            RowImage::Entity(entity) => {
                if let Some(old) = self.entities.remove(&entity.id) {
                    self.unindex_entity(&old);
                }
                self.bump_next_id(entity.id);
                self.index_entity(&entity);
                self.entities.insert(entity.id, entity);
            }
            RowImage::Container(container) => {
                self.containers.insert(container.id, container);
            }
            RowImage::Relationship(rel) => {
                self.bump_next_id(rel.id);
                self.relationships.insert(rel.id, rel);
            }
            RowImage::Facet(facet) => {
                self.bump_next_id(facet.id);
                self.facets.insert(facet.id, facet);
            }
            RowImage::CodeSpec(spec) => {
                self.bump_next_id(spec.id);
                self.code_specs.insert(spec.id, spec);
            }
        }
    }

    fn remove_image(&mut self, image: &RowImage) {
        match image {
            RowImage::Entity(entity) => {
                if let Some(old) = self.entities.remove(&entity.id) {
                    self.unindex_entity(&old);
                }
            }
            RowImage::Container(container) => {
                self.containers.remove(&container.id);
            }
            RowImage::Relationship(rel) => {
                self.relationships.remove(&rel.id);
            }
            RowImage::Facet(facet) => {
                self.facets.remove(&facet.id);
            }
            RowImage::CodeSpec(spec) => {
                self.code_specs.remove(&spec.id);
            }
        }
    }
}

/// A repository held entirely in memory.
///
/// Every new repository contains the root entity and root container
/// ([`Id64::ROOT_ENTITY`]), the dictionary entity and container
/// ([`Id64::DICTIONARY`]) and the core schema. Writes are recorded as
/// pending changeset rows until [`Repository::save_changes`].
///
/// # Thread Safety
///
/// The repository is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use reposync_repo::{ClassName, EntityProps, Id64, InsertMode, MemoryRepository, Repository};
///
/// let repo = MemoryRepository::new();
/// let pump = EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER);
/// repo.insert_entity(&pump, InsertMode::Allocate).unwrap();
/// assert_eq!(repo.save_changes("add pump").unwrap(), Some(1));
/// ```
#[derive(Debug)]
pub struct MemoryRepository {
    id: RepositoryId,
    state: RwLock<State>,
}

impl MemoryRepository {
    /// Creates an empty repository with a random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(RepositoryId::new())
    }

    /// Creates an empty repository with the given identifier.
    #[must_use]
    pub fn with_id(id: RepositoryId) -> Self {
        Self {
            id,
            state: RwLock::new(State::new()),
        }
    }

    /// Creates a raw copy of the current content under a new identifier.
    ///
    /// Pending changes and history are not carried over; the copy starts
    /// at changeset index 0.
    #[must_use]
    pub fn fork(&self) -> Self {
        let mut state = self.state.read().clone();
        state.pending.clear();
        state.history.clear();
        debug!(source = %self.id, entities = state.entities.len(), "forked repository");
        Self {
            id: RepositoryId::new(),
            state: RwLock::new(state),
        }
    }

    /// Number of entities, including the well-known ones.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Number of containers, including the well-known ones.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.read().containers.len()
    }

    /// Number of relationships.
    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.state.read().relationships.len()
    }

    /// Number of facets.
    #[must_use]
    pub fn facet_count(&self) -> usize {
        self.state.read().facets.len()
    }

    /// Number of changes not yet saved.
    #[must_use]
    pub fn pending_change_count(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Snapshot of all entities ordered by identifier.
    #[must_use]
    pub fn entities(&self) -> Vec<EntityProps> {
        self.state.read().entities.values().cloned().collect()
    }

    /// Snapshot of all relationships ordered by identifier.
    #[must_use]
    pub fn relationships(&self) -> Vec<RelationshipProps> {
        self.state.read().relationships.values().cloned().collect()
    }

    /// Snapshot of all facets ordered by identifier.
    #[must_use]
    pub fn facets(&self) -> Vec<FacetProps> {
        self.state.read().facets.values().cloned().collect()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryRepository {
    fn id(&self) -> RepositoryId {
        self.id
    }

    fn get_entity(&self, id: Id64) -> RepoResult<Option<EntityProps>> {
        Ok(self.state.read().entities.get(&id).cloned())
    }

    fn get_container(&self, id: Id64) -> RepoResult<Option<ContainerProps>> {
        Ok(self.state.read().containers.get(&id).cloned())
    }

    fn get_relationship(&self, id: Id64) -> RepoResult<Option<RelationshipProps>> {
        Ok(self.state.read().relationships.get(&id).cloned())
    }

    fn get_facet(&self, id: Id64) -> RepoResult<Option<FacetProps>> {
        Ok(self.state.read().facets.get(&id).cloned())
    }

    fn get_facets(
        &self,
        owner: Id64,
        class_name: Option<&ClassName>,
    ) -> RepoResult<Vec<FacetProps>> {
        let state = self.state.read();
        Ok(state
            .facets
            .values()
            .filter(|facet| facet.owner == owner)
            .filter(|facet| class_name.map_or(true, |class| &facet.class_name == class))
            .cloned()
            .collect())
    }

    fn get_code_spec(&self, id: Id64) -> RepoResult<Option<CodeSpecProps>> {
        Ok(self.state.read().code_specs.get(&id).cloned())
    }

    fn find_code_spec(&self, name: &str) -> RepoResult<Option<Id64>> {
        Ok(self
            .state
            .read()
            .code_specs
            .values()
            .find(|spec| spec.name == name)
            .map(|spec| spec.id))
    }

    fn find_entity_by_code(&self, code: &Code) -> RepoResult<Option<Id64>> {
        if code.is_empty() {
            return Ok(None);
        }
        Ok(self.state.read().codes.get(code).copied())
    }

    fn find_entity_by_federation_guid(&self, guid: Uuid) -> RepoResult<Option<Id64>> {
        Ok(self.state.read().federation_guids.get(&guid).copied())
    }

    fn find_relationship(
        &self,
        class_name: &ClassName,
        source: Id64,
        target: Id64,
    ) -> RepoResult<Option<Id64>> {
        Ok(self
            .state
            .read()
            .relationships
            .values()
            .find(|rel| {
                &rel.class_name == class_name && rel.source == source && rel.target == target
            })
            .map(|rel| rel.id))
    }

    fn enumerate_ids(&self, query: &IdQuery) -> RepoResult<IdIter<'_>> {
        let state = self.state.read();
        let ids: Vec<Id64> = match query.kind {
            RecordKind::Entity => state
                .entities
                .values()
                .filter(|entity| query.container.map_or(true, |c| entity.container == c))
                .filter(|entity| state.class_matches(query, &entity.class_name))
                .map(|entity| entity.id)
                .collect(),
            RecordKind::Container => state
                .containers
                .values()
                .filter(|container| state.class_matches(query, &container.class_name))
                .map(|container| container.id)
                .collect(),
            RecordKind::Relationship => state
                .relationships
                .values()
                .filter(|rel| state.class_matches(query, &rel.class_name))
                .map(|rel| rel.id)
                .collect(),
            RecordKind::Facet => {
                let mut facets: Vec<(Id64, Id64)> = state
                    .facets
                    .values()
                    .filter(|facet| state.class_matches(query, &facet.class_name))
                    .map(|facet| (facet.owner, facet.id))
                    .collect();
                facets.sort_unstable();
                facets.into_iter().map(|(_, id)| id).collect()
            }
            RecordKind::CodeSpec => state.code_specs.keys().copied().collect(),
        };
        Ok(Box::new(ids.into_iter()))
    }

    fn facet_classes(&self, kind: FacetKind) -> RepoResult<Vec<ClassName>> {
        let state = self.state.read();
        let classes: BTreeSet<ClassName> = state
            .facets
            .values()
            .filter(|facet| facet.kind == kind)
            .map(|facet| facet.class_name.clone())
            .collect();
        Ok(classes.into_iter().collect())
    }

    fn is_subclass_of(&self, class_name: &ClassName, base: &ClassName) -> bool {
        self.state.read().is_subclass_of(class_name, base)
    }

    fn insert_entity(&self, props: &EntityProps, mode: InsertMode) -> RepoResult<Id64> {
        let mut state = self.state.write();
        state.check_preservable(props.id, mode)?;
        state.check_entity_refs(props)?;
        state.check_code(&props.code, Id64::INVALID)?;

        let id = state.claim_id(props.id, mode)?;
        let mut entity = props.clone();
        entity.id = id;
        state.index_entity(&entity);
        state.entities.insert(id, entity.clone());
        state.pending.push(ChangesetRow::inserted(RowImage::Entity(entity)));
        Ok(id)
    }

    fn update_entity(&self, props: &EntityProps) -> RepoResult<()> {
        let mut state = self.state.write();
        let old = state
            .entities
            .get(&props.id)
            .cloned()
            .ok_or(RepoError::EntityNotFound { id: props.id })?;
        state.check_entity_refs(props)?;
        state.check_code(&props.code, props.id)?;
        if old == *props {
            return Ok(());
        }

        state.unindex_entity(&old);
        state.index_entity(props);
        state.entities.insert(props.id, props.clone());
        state.pending.push(ChangesetRow::updated(
            RowImage::Entity(old),
            RowImage::Entity(props.clone()),
        ));
        Ok(())
    }

    fn delete_entity(&self, id: Id64) -> RepoResult<()> {
        if id.is_well_known() {
            return Err(RepoError::invalid_operation(format!(
                "well-known entity {id} cannot be deleted"
            )));
        }
        let mut state = self.state.write();
        if !state.entities.contains_key(&id) {
            return Err(RepoError::EntityNotFound { id });
        }
        state.delete_entity_cascade(id);
        Ok(())
    }

    fn insert_container(&self, props: &ContainerProps) -> RepoResult<()> {
        let mut state = self.state.write();
        if !state.entities.contains_key(&props.id) {
            return Err(RepoError::EntityNotFound { id: props.id });
        }
        if state.containers.contains_key(&props.id) {
            return Err(RepoError::IdentifierInUse { id: props.id });
        }
        state.containers.insert(props.id, props.clone());
        state
            .pending
            .push(ChangesetRow::inserted(RowImage::Container(props.clone())));
        Ok(())
    }

    fn update_container(&self, props: &ContainerProps) -> RepoResult<()> {
        let mut state = self.state.write();
        let old = state
            .containers
            .get(&props.id)
            .cloned()
            .ok_or(RepoError::ContainerNotFound { id: props.id })?;
        if old == *props {
            return Ok(());
        }
        state.containers.insert(props.id, props.clone());
        state.pending.push(ChangesetRow::updated(
            RowImage::Container(old),
            RowImage::Container(props.clone()),
        ));
        Ok(())
    }

    fn delete_container(&self, id: Id64) -> RepoResult<()> {
        if id.is_well_known() {
            return Err(RepoError::invalid_operation(format!(
                "well-known container {id} cannot be deleted"
            )));
        }
        let mut state = self.state.write();
        if !state.containers.contains_key(&id) {
            return Err(RepoError::ContainerNotFound { id });
        }
        state.delete_container_cascade(id);
        Ok(())
    }

    fn insert_relationship(&self, props: &RelationshipProps, mode: InsertMode) -> RepoResult<Id64> {
        let mut state = self.state.write();
        state.check_preservable(props.id, mode)?;
        for endpoint in [props.source, props.target] {
            if !state.entities.contains_key(&endpoint) {
                return Err(RepoError::EntityNotFound { id: endpoint });
            }
        }

        let id = state.claim_id(props.id, mode)?;
        let mut rel = props.clone();
        rel.id = id;
        state.relationships.insert(id, rel.clone());
        state.pending.push(ChangesetRow::inserted(RowImage::Relationship(rel)));
        Ok(id)
    }

    fn update_relationship(&self, props: &RelationshipProps) -> RepoResult<()> {
        let mut state = self.state.write();
        let old = state
            .relationships
            .get(&props.id)
            .cloned()
            .ok_or(RepoError::RelationshipNotFound { id: props.id })?;
        for endpoint in [props.source, props.target] {
            if !state.entities.contains_key(&endpoint) {
                return Err(RepoError::EntityNotFound { id: endpoint });
            }
        }
        if old == *props {
            return Ok(());
        }
        state.relationships.insert(props.id, props.clone());
        state.pending.push(ChangesetRow::updated(
            RowImage::Relationship(old),
            RowImage::Relationship(props.clone()),
        ));
        Ok(())
    }

    fn delete_relationship(&self, id: Id64) -> RepoResult<()> {
        let mut state = self.state.write();
        let rel = state
            .relationships
            .remove(&id)
            .ok_or(RepoError::RelationshipNotFound { id })?;
        state.pending.push(ChangesetRow::deleted(RowImage::Relationship(rel)));
        Ok(())
    }

    fn insert_facet(&self, props: &FacetProps, mode: InsertMode) -> RepoResult<Id64> {
        let mut state = self.state.write();
        state.check_preservable(props.id, mode)?;
        if !state.entities.contains_key(&props.owner) {
            return Err(RepoError::EntityNotFound { id: props.owner });
        }
        if props.kind == FacetKind::Unique {
            let taken = state.facets.values().any(|facet| {
                facet.owner == props.owner && facet.class_name == props.class_name
            });
            if taken {
                return Err(RepoError::DuplicateUniqueFacet {
                    owner: props.owner,
                    class_name: props.class_name.to_string(),
                });
            }
        }

        let id = state.claim_id(props.id, mode)?;
        let mut facet = props.clone();
        facet.id = id;
        state.facets.insert(id, facet.clone());
        state.pending.push(ChangesetRow::inserted(RowImage::Facet(facet)));
        Ok(id)
    }

    fn update_facet(&self, props: &FacetProps) -> RepoResult<()> {
        let mut state = self.state.write();
        let old = state
            .facets
            .get(&props.id)
            .cloned()
            .ok_or(RepoError::FacetNotFound { id: props.id })?;
        if !state.entities.contains_key(&props.owner) {
            return Err(RepoError::EntityNotFound { id: props.owner });
        }
        if old == *props {
            return Ok(());
        }
        state.facets.insert(props.id, props.clone());
        state.pending.push(ChangesetRow::updated(
            RowImage::Facet(old),
            RowImage::Facet(props.clone()),
        ));
        Ok(())
    }

    fn delete_facet(&self, id: Id64) -> RepoResult<()> {
        let mut state = self.state.write();
        let facet = state
            .facets
            .remove(&id)
            .ok_or(RepoError::FacetNotFound { id })?;
        state.pending.push(ChangesetRow::deleted(RowImage::Facet(facet)));
        Ok(())
    }

    fn insert_code_spec(&self, props: &CodeSpecProps, mode: InsertMode) -> RepoResult<Id64> {
        let mut state = self.state.write();
        state.check_preservable(props.id, mode)?;
        if state.code_specs.values().any(|spec| spec.name == props.name) {
            return Err(RepoError::invalid_operation(format!(
                "code spec '{}' already exists",
                props.name
            )));
        }

        let id = state.claim_id(props.id, mode)?;
        let mut spec = props.clone();
        spec.id = id;
        state.code_specs.insert(id, spec.clone());
        state.pending.push(ChangesetRow::inserted(RowImage::CodeSpec(spec)));
        Ok(id)
    }

    fn query_schema_version(&self, name: &str) -> RepoResult<Option<SchemaVersion>> {
        Ok(self.state.read().schemas.get(name).map(|schema| schema.version))
    }

    fn schemas(&self) -> RepoResult<Vec<SchemaInfo>> {
        Ok(self.state.read().schemas.values().cloned().collect())
    }

    fn import_schemas(&self, schemas: &[SchemaInfo]) -> RepoResult<()> {
        let mut state = self.state.write();
        let mut staged = state.schemas.clone();
        for schema in schemas {
            for reference in &schema.references {
                if !staged.contains_key(reference) {
                    return Err(RepoError::SchemaReferenceMissing {
                        schema: schema.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
            let newer_present = staged
                .get(&schema.name)
                .is_some_and(|existing| existing.version > schema.version);
            if !newer_present {
                staged.insert(schema.name.clone(), schema.clone());
            }
        }
        state.schemas = staged;
        Ok(())
    }

    fn changeset_index(&self) -> u64 {
        self.state.read().history.last().map_or(0, |cs| cs.index)
    }

    fn has_pending_changes(&self) -> bool {
        !self.state.read().pending.is_empty()
    }

    fn save_changes(&self, description: &str) -> RepoResult<Option<u64>> {
        let mut state = self.state.write();
        if state.pending.is_empty() {
            return Ok(None);
        }
        let index = state.history.len() as u64 + 1;
        let mut changeset = Changeset::new(index, self.id, description);
        changeset.rows = std::mem::take(&mut state.pending);
        debug!(repository = %self.id, index, rows = changeset.rows.len(), "saved changeset");
        state.history.push(changeset);
        Ok(Some(index))
    }

    fn download_changesets(&self, range: ChangesetRange) -> RepoResult<Vec<Changeset>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read();
        let available = state.history.len() as u64;
        if range.last > available {
            return Err(RepoError::ChangesetUnavailable {
                first: range.first,
                last: range.last,
                available,
            });
        }
        let first = usize::try_from(range.first - 1)
            .map_err(|_| RepoError::invalid_operation("changeset index out of range"))?;
        let last = usize::try_from(range.last)
            .map_err(|_| RepoError::invalid_operation("changeset index out of range"))?;
        Ok(state.history[first..last].to_vec())
    }

    fn apply_changeset(&self, changeset: &Changeset) -> RepoResult<()> {
        let mut state = self.state.write();
        if !state.pending.is_empty() {
            return Err(RepoError::invalid_operation(
                "cannot apply a changeset with unsaved local changes",
            ));
        }
        for row in &changeset.rows {
            match (row.op, &row.old, &row.new) {
                (ChangeOp::Inserted | ChangeOp::Updated, _, Some(new)) => {
                    state.apply_image(new.clone());
                }
                (ChangeOp::Deleted, Some(old), _) => state.remove_image(old),
                _ => {
                    return Err(RepoError::codec(format!(
                        "malformed {:?} row in changeset {}",
                        row.op, changeset.index
                    )))
                }
            }
        }
        let mut applied = changeset.clone();
        applied.index = state.history.len() as u64 + 1;
        state.history.push(applied);
        Ok(())
    }
}
