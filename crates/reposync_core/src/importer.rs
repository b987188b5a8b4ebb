//! Write-side application of transformed records to the target.

use crate::error::{TransformError, TransformResult};
use reposync_repo::{
    is_provenance_class, ClassName, CodeSpecProps, ContainerProps, EntityProps, FacetKind,
    FacetProps, Id64, InsertMode, RelationshipProps, RepoError, RepoResult, Repository,
    SchemaInfo,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Write counters for one record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounters {
    /// Records inserted.
    pub inserted: u64,
    /// Records updated.
    pub updated: u64,
    /// Records deleted.
    pub deleted: u64,
}

impl KindCounters {
    /// Sum of all writes.
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Write counters per record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounters {
    /// Entity writes.
    pub entities: KindCounters,
    /// Container writes.
    pub containers: KindCounters,
    /// Relationship writes.
    pub relationships: KindCounters,
    /// Facet writes, excluding provenance.
    pub facets: KindCounters,
    /// Code spec writes.
    pub code_specs: KindCounters,
}

impl ImportCounters {
    /// Sum of all writes of every kind.
    pub fn total_writes(&self) -> u64 {
        self.entities.total()
            + self.containers.total()
            + self.relationships.total()
            + self.facets.total()
            + self.code_specs.total()
    }
}

/// Applies records to the target repository.
///
/// Every `import_*` call inserts when no equivalent target record is
/// given, updates it otherwise, and skips the write when the content is
/// already identical.
pub struct Importer<'a> {
    target: &'a dyn Repository,
    counters: ImportCounters,
}

fn map_in_use(err: RepoError) -> TransformError {
    match err {
        RepoError::IdentifierInUse { id } => TransformError::IdentifierInUse { id },
        other => TransformError::Repository(other),
    }
}

fn tolerate_missing(result: RepoResult<()>) -> TransformResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl<'a> Importer<'a> {
    /// Creates an importer writing to `target`.
    pub fn new(target: &'a dyn Repository) -> Self {
        Self {
            target,
            counters: ImportCounters::default(),
        }
    }

    /// Counters accumulated so far.
    pub fn counters(&self) -> &ImportCounters {
        &self.counters
    }

    /// Imports schemas that are missing or older in the target.
    ///
    /// Schemas are ordered so that every reference is imported before the
    /// schema that needs it, whatever order they were given in. A target
    /// schema newer than the source's fails with
    /// `SchemaVersionIncompatible`.
    pub fn import_schemas(&mut self, schemas: &[SchemaInfo]) -> TransformResult<usize> {
        let mut wanted: HashMap<&str, &SchemaInfo> = HashMap::new();
        for schema in schemas {
            match self.target.query_schema_version(&schema.name)? {
                Some(existing) if existing > schema.version => {
                    return Err(TransformError::SchemaVersionIncompatible {
                        schema: schema.name.clone(),
                        source_version: schema.version,
                        target: existing,
                    });
                }
                Some(existing) if existing == schema.version => {}
                _ => {
                    wanted.insert(schema.name.as_str(), schema);
                }
            }
        }
        if wanted.is_empty() {
            return Ok(0);
        }

        let mut names: Vec<&str> = wanted.keys().copied().collect();
        names.sort_unstable();
        let mut ordered = Vec::with_capacity(wanted.len());
        let mut placed = HashSet::new();
        for name in names {
            place_schema(name, &wanted, &mut placed, &mut ordered);
        }
        self.target.import_schemas(&ordered)?;
        info!(count = ordered.len(), "imported schemas");
        Ok(ordered.len())
    }

    /// Imports a code spec, matching an existing one by name.
    pub fn import_code_spec(&mut self, spec: &CodeSpecProps) -> TransformResult<Id64> {
        if let Some(existing) = self.target.find_code_spec(&spec.name)? {
            return Ok(existing);
        }
        let mut props = spec.clone();
        props.id = Id64::INVALID;
        let id = self.target.insert_code_spec(&props, InsertMode::Allocate)?;
        self.counters.code_specs.inserted += 1;
        Ok(id)
    }

    /// Imports a container whose id is already the target defining entity.
    pub fn import_container(&mut self, props: &ContainerProps) -> TransformResult<()> {
        match self.target.get_container(props.id)? {
            Some(current) if current == *props => {}
            Some(_) => {
                self.target.update_container(props)?;
                self.counters.containers.updated += 1;
            }
            None => {
                self.target.insert_container(props).map_err(map_in_use)?;
                self.counters.containers.inserted += 1;
            }
        }
        Ok(())
    }

    /// Imports an entity, updating `existing` when given.
    ///
    /// With [`InsertMode::Preserve`] a new entity keeps `props.id`.
    pub fn import_entity(
        &mut self,
        props: &EntityProps,
        existing: Option<Id64>,
        mode: InsertMode,
    ) -> TransformResult<Id64> {
        if let Some(id) = existing {
            if let Some(current) = self.target.get_entity(id)? {
                let mut updated = props.clone();
                updated.id = id;
                if current != updated {
                    self.target.update_entity(&updated)?;
                    self.counters.entities.updated += 1;
                }
                return Ok(id);
            }
        }
        let id = self.target.insert_entity(props, mode).map_err(map_in_use)?;
        self.counters.entities.inserted += 1;
        Ok(id)
    }

    /// Imports a relationship, updating `existing` when given.
    pub fn import_relationship(
        &mut self,
        props: &RelationshipProps,
        existing: Option<Id64>,
    ) -> TransformResult<Id64> {
        if let Some(id) = existing {
            if let Some(current) = self.target.get_relationship(id)? {
                let mut updated = props.clone();
                updated.id = id;
                if current != updated {
                    self.target.update_relationship(&updated)?;
                    self.counters.relationships.updated += 1;
                }
                return Ok(id);
            }
        }
        let id = self
            .target
            .insert_relationship(props, InsertMode::Allocate)
            .map_err(map_in_use)?;
        self.counters.relationships.inserted += 1;
        Ok(id)
    }

    /// Imports a unique facet, updating the owner's facet of the same
    /// class if there is one.
    pub fn import_unique_facet(&mut self, props: &FacetProps) -> TransformResult<Id64> {
        let existing = self
            .target
            .get_facets(props.owner, Some(&props.class_name))?
            .into_iter()
            .find(|facet| facet.kind == FacetKind::Unique);
        self.write_facet(props, existing)
    }

    /// Rewrites the facet `props.id` in place.
    pub fn update_facet(&mut self, props: &FacetProps) -> TransformResult<()> {
        let current = self.target.get_facet(props.id)?;
        self.write_facet(props, current).map(|_| ())
    }

    fn write_facet(
        &mut self,
        props: &FacetProps,
        existing: Option<FacetProps>,
    ) -> TransformResult<Id64> {
        match existing {
            Some(current) => {
                let mut updated = props.clone();
                updated.id = current.id;
                if current != updated {
                    self.target.update_facet(&updated)?;
                    self.counters.facets.updated += 1;
                }
                Ok(current.id)
            }
            None => {
                let id = self
                    .target
                    .insert_facet(props, InsertMode::Allocate)
                    .map_err(map_in_use)?;
                self.counters.facets.inserted += 1;
                Ok(id)
            }
        }
    }

    /// Replaces the owner's multi facets of `classes` (every multi facet
    /// class when `None`) with `facets`.
    ///
    /// Existing facets are paired with incoming facets of the same class
    /// in order and updated; extra incoming facets are inserted and
    /// surplus existing ones deleted. Provenance facets are never touched.
    /// Returns the target ids in the order of `facets`.
    pub fn import_multi_facets(
        &mut self,
        owner: Id64,
        classes: Option<&[ClassName]>,
        facets: &[FacetProps],
    ) -> TransformResult<Vec<Id64>> {
        let covered = |class_name: &ClassName| classes.is_none_or(|list| list.contains(class_name));
        let mut existing: HashMap<ClassName, VecDeque<FacetProps>> = HashMap::new();
        for facet in self.target.get_facets(owner, None)? {
            if facet.kind == FacetKind::Multi
                && !is_provenance_class(&facet.class_name)
                && covered(&facet.class_name)
            {
                existing.entry(facet.class_name.clone()).or_default().push_back(facet);
            }
        }

        let mut ids = Vec::with_capacity(facets.len());
        for facet in facets {
            let mut props = facet.clone();
            props.owner = owner;
            let current = existing
                .get_mut(&props.class_name)
                .and_then(VecDeque::pop_front);
            ids.push(self.write_facet(&props, current)?);
        }

        let surplus: Vec<Id64> = existing.into_values().flatten().map(|facet| facet.id).collect();
        if !surplus.is_empty() {
            debug!(owner = %owner, count = surplus.len(), "deleting surplus facets");
        }
        for id in surplus {
            self.delete_facet(id)?;
        }
        Ok(ids)
    }

    /// Deletes a target entity with everything the repository cascades.
    /// Returns false if it was already gone.
    pub fn delete_entity(&mut self, id: Id64) -> TransformResult<bool> {
        let deleted = tolerate_missing(self.target.delete_entity(id))?;
        if deleted {
            self.counters.entities.deleted += 1;
        }
        Ok(deleted)
    }

    /// Deletes a target container and its contents.
    pub fn delete_container(&mut self, id: Id64) -> TransformResult<bool> {
        let deleted = tolerate_missing(self.target.delete_container(id))?;
        if deleted {
            self.counters.containers.deleted += 1;
        }
        Ok(deleted)
    }

    /// Deletes a target relationship.
    pub fn delete_relationship(&mut self, id: Id64) -> TransformResult<bool> {
        let deleted = tolerate_missing(self.target.delete_relationship(id))?;
        if deleted {
            self.counters.relationships.deleted += 1;
        }
        Ok(deleted)
    }

    /// Deletes a target facet.
    pub fn delete_facet(&mut self, id: Id64) -> TransformResult<bool> {
        let deleted = tolerate_missing(self.target.delete_facet(id))?;
        if deleted {
            self.counters.facets.deleted += 1;
        }
        Ok(deleted)
    }
}

fn place_schema(
    name: &str,
    wanted: &HashMap<&str, &SchemaInfo>,
    placed: &mut HashSet<String>,
    ordered: &mut Vec<SchemaInfo>,
) {
    let Some(schema) = wanted.get(name) else {
        return;
    };
    if !placed.insert(name.to_string()) {
        return;
    }
    for reference in &schema.references {
        place_schema(reference, wanted, placed, ordered);
    }
    ordered.push((*schema).clone());
}
