//! Transformation of exported records into target writes.

use super::deferred::{
    DeferredRecord, EntityState, PendingReference, PendingReferences, ReferrerKind,
};
use super::fingerprint::fingerprint;
use super::provenance_index::{IndexEntry, ProvenanceIndex};
use crate::config::{DanglingReferencesBehavior, TransformerConfig};
use crate::error::{TransformError, TransformResult};
use crate::exporter::{DeletedEntity, EntityEvent, ExportHandler, FacetGroup};
use crate::id_table::ScopedIdTable;
use crate::importer::Importer;
use crate::remap::RemapContext;
use reposync_repo::{
    for_each_reference_mut, is_provenance_class, ClassName, Code, CodeSpecProps, ContainerProps,
    EntityProps, FacetProps, Id64, InsertMode, NavigationValue, PropertyBag, PropertyPath,
    PropertyValue, ProvenanceKind, ProvenanceRecord, RelationshipProps, Repository, SchemaInfo,
    PROVENANCE_CLASS,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// How unresolved structural references are treated while draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leniency {
    /// Unresolved references defer the record.
    Strict,
    /// Drop references unless they point at a deferred entity.
    RespectDeferred,
    /// Drop every droppable reference.
    Force,
}

/// Outcome of resolving one structural reference.
enum Resolution {
    Mapped(Id64),
    Dropped,
    Missing,
}

/// Counters kept by the transformation core.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunCounters {
    pub deferred_passes: u64,
    pub resolved_references: u64,
    pub unresolved_references: u64,
    pub skipped_unchanged: u64,
    pub deleted_by_detection: u64,
    pub provenance_writes: u64,
}

/// Receives export events, transforms them and writes the target.
pub(crate) struct TransformCore<'a> {
    pub(super) source: &'a dyn Repository,
    pub(super) target: &'a dyn Repository,
    pub(super) config: TransformerConfig,
    pub(super) importer: Importer<'a>,
    pub(super) remap: RemapContext,
    pub(super) index: ProvenanceIndex,
    pub(super) states: ScopedIdTable<Id64, EntityState>,
    pub(super) deferred: Vec<DeferredRecord>,
    pub(super) pending: PendingReferences,
    pub(super) counters: RunCounters,
    /// Fingerprints held back until the entity's pending references are
    /// patched, with the number still outstanding.
    awaiting_version: HashMap<Id64, (String, usize)>,
    leniency: Leniency,
}

impl<'a> TransformCore<'a> {
    pub(crate) fn new(
        source: &'a dyn Repository,
        target: &'a dyn Repository,
        config: TransformerConfig,
        remap: RemapContext,
        index: ProvenanceIndex,
    ) -> Self {
        Self {
            source,
            target,
            config,
            importer: Importer::new(target),
            remap,
            index,
            states: ScopedIdTable::new(),
            deferred: Vec::new(),
            pending: PendingReferences::default(),
            counters: RunCounters::default(),
            awaiting_version: HashMap::new(),
            leniency: Leniency::Strict,
        }
    }

    /// Repository holding the provenance facets of the run.
    pub(super) fn provenance_repo(&self) -> &'a dyn Repository {
        if self.config.is_reverse_synchronization {
            self.source
        } else {
            self.target
        }
    }

    fn scope(&self) -> Id64 {
        self.config.target_scope_entity
    }

    /// Target entity for a source entity, from the mappings of this run,
    /// the provenance index, or identity for a copied target. Hits are
    /// cached in the remap context.
    pub(super) fn resolve_entity(&mut self, source_id: Id64) -> TransformResult<Option<Id64>> {
        if !source_id.is_valid() {
            return Ok(None);
        }
        let mapped = self.remap.find_target_entity(source_id);
        if mapped.is_valid() {
            return Ok(Some(mapped));
        }
        if let Some(target_id) = self.index.entity(source_id).map(|entry| entry.target) {
            if self.target.get_entity(target_id)?.is_some() {
                self.remap.remap_entity(source_id, target_id)?;
                return Ok(Some(target_id));
            }
        }
        if self.config.was_source_copied_to_target
            && self.remap.find_source_entity(source_id).is_none()
            && self.target.get_entity(source_id)?.is_some()
        {
            self.remap.remap_entity(source_id, source_id)?;
            return Ok(Some(source_id));
        }
        Ok(None)
    }

    fn resolve_container(&mut self, source_id: Id64) -> TransformResult<Option<Id64>> {
        match self.resolve_entity(source_id)? {
            Some(target_id) if self.target.get_container(target_id)?.is_some() => {
                Ok(Some(target_id))
            }
            _ => Ok(None),
        }
    }

    fn dangling_reference(&mut self, referencer: Id64, missing: Id64) -> TransformResult<()> {
        match self.config.dangling_references {
            DanglingReferencesBehavior::Reject => Err(TransformError::DanglingReference {
                referencer,
                missing: vec![missing],
            }),
            DanglingReferencesBehavior::Ignore => {
                self.counters.unresolved_references += 1;
                Ok(())
            }
        }
    }

    fn lenient_drops(&self, id: Id64) -> bool {
        match self.leniency {
            Leniency::Strict => false,
            Leniency::RespectDeferred => self.states.get(&id) != Some(&EntityState::Deferred),
            Leniency::Force => true,
        }
    }

    fn structural(
        &mut self,
        referencer: Id64,
        id: Id64,
        dangling: &[Id64],
    ) -> TransformResult<Resolution> {
        if let Some(target_id) = self.resolve_entity(id)? {
            return Ok(Resolution::Mapped(target_id));
        }
        if dangling.contains(&id) {
            self.dangling_reference(referencer, id)?;
            return Ok(Resolution::Dropped);
        }
        if self.lenient_drops(id) {
            self.counters.unresolved_references += 1;
            return Ok(Resolution::Dropped);
        }
        Ok(Resolution::Missing)
    }

    /// Rewrites navigation values of `bag` to target ids.
    ///
    /// References to missing source entities follow the dangling policy.
    /// References not imported yet are nulled and returned with their
    /// paths so they can be patched later.
    fn remap_references(
        &mut self,
        referencer: Id64,
        bag: &mut PropertyBag,
        dangling: &[Id64],
    ) -> TransformResult<Vec<(Id64, PropertyPath)>> {
        let mut found = Vec::new();
        for_each_reference_mut(bag, &mut |path: &PropertyPath, nav: &mut NavigationValue| {
            if nav.id.is_valid() {
                found.push((path.clone(), nav.id));
            }
        });

        let mut unresolved = Vec::new();
        for (path, id) in found {
            let mapped = match self.resolve_entity(id)? {
                Some(target_id) => target_id,
                None if dangling.contains(&id) || self.source.get_entity(id)?.is_none() => {
                    self.dangling_reference(referencer, id)?;
                    Id64::INVALID
                }
                None => {
                    unresolved.push((id, path.clone()));
                    Id64::INVALID
                }
            };
            if let Some(PropertyValue::Navigation(nav)) = path.get_mut(bag) {
                nav.id = mapped;
            }
        }
        Ok(unresolved)
    }

    fn register_pending(
        &mut self,
        kind: ReferrerKind,
        referrer_source: Id64,
        referrer: Id64,
        unresolved: Vec<(Id64, PropertyPath)>,
    ) {
        for (referenced, path) in unresolved {
            self.pending.add(
                referenced,
                PendingReference {
                    kind,
                    referrer_source,
                    referrer,
                    path,
                },
            );
        }
    }

    fn finish_entity(&mut self, source_id: Id64) -> TransformResult<()> {
        self.states.set(source_id, EntityState::Imported)?;
        let waiting = self.pending.take(source_id);
        if waiting.is_empty() {
            return Ok(());
        }
        let target_id = self.remap.find_target_entity(source_id);
        for reference in waiting {
            self.patch_reference(&reference, target_id)?;
            self.counters.resolved_references += 1;
            if reference.kind == ReferrerKind::Entity {
                self.settle_version(reference.referrer_source, reference.referrer)?;
            }
        }
        Ok(())
    }

    /// Records the held-back fingerprint once the last pending reference
    /// of an entity is patched.
    fn settle_version(&mut self, source_id: Id64, target_id: Id64) -> TransformResult<()> {
        let Some((_, remaining)) = self.awaiting_version.get_mut(&source_id) else {
            return Ok(());
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return Ok(());
        }
        match self.awaiting_version.remove(&source_id) {
            Some((version, _)) => {
                self.record_entity_provenance(source_id, target_id, Some(version))
            }
            None => Ok(()),
        }
    }

    fn patch_reference(
        &mut self,
        reference: &PendingReference,
        value: Id64,
    ) -> TransformResult<()> {
        let set = |bag: &mut PropertyBag| {
            if let Some(PropertyValue::Navigation(nav)) = reference.path.get_mut(bag) {
                nav.id = value;
            }
        };
        let id = reference.referrer;
        match reference.kind {
            ReferrerKind::Entity => {
                if let Some(mut props) = self.target.get_entity(id)? {
                    set(&mut props.properties);
                    self.importer.import_entity(&props, Some(id), InsertMode::Allocate)?;
                }
            }
            ReferrerKind::Container => {
                if let Some(mut props) = self.target.get_container(id)? {
                    set(&mut props.properties);
                    self.importer.import_container(&props)?;
                }
            }
            ReferrerKind::Facet => {
                if let Some(mut props) = self.target.get_facet(id)? {
                    set(&mut props.properties);
                    self.importer.update_facet(&props)?;
                }
            }
            ReferrerKind::Relationship => {
                if let Some(mut props) = self.target.get_relationship(id)? {
                    set(&mut props.properties);
                    self.importer.import_relationship(&props, Some(id))?;
                }
            }
        }
        debug!(referrer = %id, path = %reference.path, "patched pending reference");
        Ok(())
    }

    fn defer(&mut self, record: DeferredRecord) -> TransformResult<bool> {
        if let DeferredRecord::Entity { entity, .. } = &record {
            self.states.set(entity.id, EntityState::Deferred)?;
        }
        self.deferred.push(record);
        Ok(false)
    }

    /// Imports a container once its defining entity is mapped.
    pub(super) fn import_container(&mut self, container: ContainerProps) -> TransformResult<bool> {
        if container.id.is_well_known() {
            return Ok(true);
        }
        let Some(target_id) = self.resolve_entity(container.id)? else {
            let missing = vec![container.id];
            return self.defer(DeferredRecord::Container { container, missing });
        };
        let mut props = container.clone();
        props.id = target_id;
        props.class_name = self.remap.target_class(&container.class_name);
        let unresolved = self.remap_references(container.id, &mut props.properties, &[])?;
        self.importer.import_container(&props)?;
        self.register_pending(ReferrerKind::Container, container.id, target_id, unresolved);
        Ok(true)
    }

    fn unchanged_since_last_run(
        &self,
        source_id: Id64,
        version: Option<&str>,
    ) -> TransformResult<Option<Id64>> {
        let Some(entry) = self.index.entity(source_id) else {
            return Ok(None);
        };
        if version.is_none() || entry.version.as_deref() != version {
            return Ok(None);
        }
        Ok(self.target.get_entity(entry.target)?.map(|_| entry.target))
    }

    fn find_existing_entity(
        &mut self,
        entity: &EntityProps,
        code: &Code,
    ) -> TransformResult<Option<Id64>> {
        if let Some(target_id) = self.resolve_entity(entity.id)? {
            return Ok(Some(target_id));
        }
        if self.config.match_by_federation_guid {
            if let Some(guid) = entity.federation_guid {
                if let Some(candidate) = self.target.find_entity_by_federation_guid(guid)? {
                    if self.remap.find_source_entity(candidate).is_none() {
                        return Ok(Some(candidate));
                    }
                }
            }
        }
        if self.config.match_by_code && !code.is_empty() {
            if let Some(candidate) = self.target.find_entity_by_code(code)? {
                if self.remap.find_source_entity(candidate).is_none() {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    /// Transforms and imports one entity, deferring it while a structural
    /// reference is unresolved. Returns false if it was deferred.
    pub(super) fn import_entity(
        &mut self,
        entity: EntityProps,
        dangling: Vec<Id64>,
    ) -> TransformResult<bool> {
        let id = entity.id;
        if id.is_well_known() {
            return Ok(true);
        }
        self.states.set(id, EntityState::Exporting)?;

        if self.config.was_source_copied_to_target
            && self.remap.find_source_entity(id).is_none_or(|mapped| mapped == id)
            && self.target.get_entity(id)?.is_some()
        {
            self.remap.remap_entity(id, id)?;
            let version = self.forward_version(&entity)?;
            self.record_entity_provenance(id, id, version)?;
            return self.finish_entity(id).map(|()| true);
        }

        let version = self.forward_version(&entity)?;
        if let Some(target_id) = self.unchanged_since_last_run(id, version.as_deref())? {
            self.remap.remap_entity(id, target_id)?;
            self.counters.skipped_unchanged += 1;
            return self.finish_entity(id).map(|()| true);
        }

        let unresolved_before = self.counters.unresolved_references;
        let mut missing = Vec::new();
        let container = match self.resolve_container(entity.container)? {
            Some(target_id) => target_id,
            None => {
                missing.push(entity.container);
                Id64::INVALID
            }
        };
        let parent = match entity.parent {
            None => None,
            Some(parent) => match self.structural(id, parent, &dangling)? {
                Resolution::Mapped(target_id) => Some(target_id),
                Resolution::Dropped => None,
                Resolution::Missing => {
                    missing.push(parent);
                    None
                }
            },
        };
        let code = self.transform_code(id, &entity.code, &dangling, &mut missing)?;
        if !missing.is_empty() {
            return self.defer(DeferredRecord::Entity { entity, dangling, missing });
        }

        let mut props = entity.clone();
        props.class_name = self.remap.target_class(&entity.class_name);
        props.container = container;
        props.parent = parent;
        props.code = code;
        let unresolved = self.remap_references(id, &mut props.properties, &dangling)?;
        self.states.set(id, EntityState::Transformed)?;
        // an entity imported with dropped references must not be skipped next time
        let clean = self.counters.unresolved_references == unresolved_before;
        let version = version.filter(|_| clean);
        let (version, awaiting) = if unresolved.is_empty() {
            (version, None)
        } else {
            (None, version.map(|version| (version, unresolved.len())))
        };

        let existing = self.find_existing_entity(&entity, &props.code)?;
        let mode = match existing {
            None if self.config.preserve_entity_ids => {
                let claimed = self
                    .remap
                    .find_source_entity(id)
                    .filter(|other| *other != id);
                if let Some(mapped_from) = claimed {
                    return Err(TransformError::IdPreservationConflict { id, mapped_from });
                }
                props.id = id;
                InsertMode::Preserve
            }
            _ => {
                props.id = existing.unwrap_or(Id64::INVALID);
                InsertMode::Allocate
            }
        };
        let target_id = self.importer.import_entity(&props, existing, mode)?;
        self.remap.remap_entity(id, target_id)?;
        self.record_entity_provenance(id, target_id, version)?;
        self.copy_source_provenance(id, target_id)?;
        match awaiting {
            Some(awaiting) => {
                self.awaiting_version.insert(id, awaiting);
            }
            None => {
                self.awaiting_version.remove(&id);
            }
        }
        self.register_pending(ReferrerKind::Entity, id, target_id, unresolved);
        self.finish_entity(id)?;
        Ok(true)
    }

    fn transform_code(
        &mut self,
        referencer: Id64,
        code: &Code,
        dangling: &[Id64],
        missing: &mut Vec<Id64>,
    ) -> TransformResult<Code> {
        if code.is_empty() {
            return Ok(Code::empty());
        }
        let spec = self.remap.find_target_code_spec(code.spec);
        if !spec.is_valid() {
            if self.lenient_drops(code.spec) {
                self.counters.unresolved_references += 1;
                return Ok(Code::empty());
            }
            missing.push(code.spec);
            return Ok(Code::empty());
        }
        let scope = match self.structural(referencer, code.scope, dangling)? {
            Resolution::Mapped(target_id) => target_id,
            Resolution::Dropped => Id64::ROOT_ENTITY,
            Resolution::Missing => {
                missing.push(code.scope);
                return Ok(Code::empty());
            }
        };
        Ok(Code::new(spec, scope, code.value.clone()))
    }

    /// Fingerprint stored as provenance version; reverse runs record none.
    fn forward_version(&self, entity: &EntityProps) -> TransformResult<Option<String>> {
        if self.config.no_provenance || self.config.is_reverse_synchronization {
            return Ok(None);
        }
        fingerprint(entity).map(Some)
    }

    /// Records the pairing of `source_id` and `target_id`.
    ///
    /// Forward runs write onto the target entity with the source id as
    /// identifier; reverse runs write onto the source entity with the
    /// target id as identifier.
    pub(super) fn record_entity_provenance(
        &mut self,
        source_id: Id64,
        target_id: Id64,
        version: Option<String>,
    ) -> TransformResult<()> {
        if self.config.no_provenance {
            return Ok(());
        }
        let reverse = self.config.is_reverse_synchronization;
        let (owner, paired, paired_repo) = if reverse {
            (source_id, target_id, self.target.id())
        } else {
            (target_id, source_id, self.source.id())
        };
        let repo = self.provenance_repo();

        if let Some(entry) = self.index.entity(source_id).cloned() {
            if entry.target == target_id && entry.owner == owner {
                if entry.version == version {
                    return Ok(());
                }
                let mut record =
                    ProvenanceRecord::for_entity(owner, self.scope(), paired, paired_repo);
                record.version = version.clone();
                record.facet_id = entry.facet_id;
                repo.update_facet(&record.to_facet())?;
                self.index.insert_entity(source_id, IndexEntry { version, ..entry })?;
                self.counters.provenance_writes += 1;
                return Ok(());
            }
            delete_tolerant(repo, entry.facet_id)?;
        }

        let mut record = ProvenanceRecord::for_entity(owner, self.scope(), paired, paired_repo);
        record.version = version.clone();
        let facet_id = repo.insert_facet(&record.to_facet(), InsertMode::Allocate)?;
        self.index.insert_entity(
            source_id,
            IndexEntry {
                facet_id,
                owner,
                target: target_id,
                version,
            },
        )?;
        self.counters.provenance_writes += 1;
        Ok(())
    }

    /// Copies provenance the source entity carries from other scopes.
    fn copy_source_provenance(&mut self, source_id: Id64, target_id: Id64) -> TransformResult<()> {
        if !self.config.include_source_provenance || self.config.is_reverse_synchronization {
            return Ok(());
        }
        let class_name = ClassName::new(PROVENANCE_CLASS);
        let existing: Vec<ProvenanceRecord> = self
            .target
            .get_facets(target_id, Some(&class_name))?
            .iter()
            .filter_map(ProvenanceRecord::from_facet)
            .collect();
        for facet in self.source.get_facets(source_id, Some(&class_name))? {
            let Some(mut record) = ProvenanceRecord::from_facet(&facet) else {
                continue;
            };
            if record.kind == ProvenanceKind::Scope {
                continue;
            }
            let Some(scope) = self.resolve_entity(record.scope)? else {
                continue;
            };
            if scope == self.scope() {
                continue;
            }
            record.scope = scope;
            record.owner = target_id;
            record.facet_id = Id64::INVALID;
            let duplicate = existing.iter().any(|other| ProvenanceRecord {
                facet_id: Id64::INVALID,
                ..other.clone()
            } == record);
            if !duplicate {
                self.target.insert_facet(&record.to_facet(), InsertMode::Allocate)?;
                self.counters.provenance_writes += 1;
            }
        }
        Ok(())
    }

    fn transform_facet(
        &mut self,
        facet: &FacetProps,
        owner: Id64,
    ) -> TransformResult<(FacetProps, Vec<(Id64, PropertyPath)>)> {
        let mut props = facet.clone();
        props.id = Id64::INVALID;
        props.owner = owner;
        props.class_name = self.remap.target_class(&facet.class_name);
        let unresolved = self.remap_references(facet.owner, &mut props.properties, &[])?;
        Ok((props, unresolved))
    }

    pub(super) fn import_unique_facet(&mut self, facet: FacetProps) -> TransformResult<bool> {
        if is_provenance_class(&facet.class_name) {
            return Ok(true);
        }
        let Some(owner) = self.resolve_entity(facet.owner)? else {
            let missing = vec![facet.owner];
            return self.defer(DeferredRecord::UniqueFacet { facet, missing });
        };
        let (props, unresolved) = self.transform_facet(&facet, owner)?;
        let id = self.importer.import_unique_facet(&props)?;
        self.remap.remap_facet(facet.id, id)?;
        self.register_pending(ReferrerKind::Facet, facet.id, id, unresolved);
        Ok(true)
    }

    pub(super) fn import_facet_group(&mut self, group: FacetGroup) -> TransformResult<bool> {
        let Some(owner) = self.resolve_entity(group.owner)? else {
            let missing = vec![group.owner];
            return self.defer(DeferredRecord::FacetGroup { group, missing });
        };
        let classes: Option<Vec<ClassName>> = group
            .classes
            .as_ref()
            .map(|classes| classes.iter().map(|name| self.remap.target_class(name)).collect());

        let facets: Vec<&FacetProps> = group
            .facets
            .iter()
            .filter(|facet| !is_provenance_class(&facet.class_name))
            .collect();
        let mut transformed = Vec::with_capacity(facets.len());
        let mut unresolved = Vec::with_capacity(facets.len());
        for facet in &facets {
            let (props, refs) = self.transform_facet(facet, owner)?;
            transformed.push(props);
            unresolved.push(refs);
        }

        let ids = self
            .importer
            .import_multi_facets(owner, classes.as_deref(), &transformed)?;
        for ((facet, id), refs) in facets.into_iter().zip(ids).zip(unresolved) {
            self.remap.remap_facet(facet.id, id)?;
            self.register_pending(ReferrerKind::Facet, facet.id, id, refs);
        }
        Ok(true)
    }

    fn endpoint(&mut self, referencer: Id64, id: Id64) -> TransformResult<Resolution> {
        if let Some(target_id) = self.resolve_entity(id)? {
            return Ok(Resolution::Mapped(target_id));
        }
        if self.source.get_entity(id)?.is_none() {
            self.dangling_reference(referencer, id)?;
            return Ok(Resolution::Dropped);
        }
        Ok(Resolution::Missing)
    }

    pub(super) fn import_relationship(
        &mut self,
        relationship: RelationshipProps,
    ) -> TransformResult<bool> {
        let id = relationship.id;
        let mut missing = Vec::new();
        let mut endpoints = [Id64::INVALID; 2];
        let pairs = endpoints
            .iter_mut()
            .zip([relationship.source, relationship.target]);
        for (slot, endpoint) in pairs {
            match self.endpoint(id, endpoint)? {
                Resolution::Mapped(target_id) => *slot = target_id,
                Resolution::Dropped => return Ok(true),
                Resolution::Missing => missing.push(endpoint),
            }
        }
        if !missing.is_empty() {
            return self.defer(DeferredRecord::Relationship { relationship, missing });
        }

        let mut props = relationship.clone();
        props.id = Id64::INVALID;
        props.source = endpoints[0];
        props.target = endpoints[1];
        props.class_name = self.remap.target_class(&relationship.class_name);
        let unresolved = self.remap_references(id, &mut props.properties, &[])?;

        let existing = match self.index.relationship(id).map(|entry| entry.target) {
            Some(target_id) if self.target.get_relationship(target_id)?.is_some() => {
                Some(target_id)
            }
            _ => self
                .target
                .find_relationship(&props.class_name, props.source, props.target)?,
        };
        let target_id = self.importer.import_relationship(&props, existing)?;
        self.record_relationship_provenance(&relationship, &props, target_id)?;
        self.register_pending(ReferrerKind::Relationship, id, target_id, unresolved);
        Ok(true)
    }

    /// Relationship provenance lives on the source entity of the
    /// relationship in the provenance repository.
    fn record_relationship_provenance(
        &mut self,
        relationship: &RelationshipProps,
        transformed: &RelationshipProps,
        target_id: Id64,
    ) -> TransformResult<()> {
        if self.config.no_provenance {
            return Ok(());
        }
        let (owner, local, paired, paired_repo) = if self.config.is_reverse_synchronization {
            (relationship.source, relationship.id, target_id, self.target.id())
        } else {
            (transformed.source, target_id, relationship.id, self.source.id())
        };
        let repo = self.provenance_repo();
        if let Some(entry) = self.index.relationship(relationship.id).cloned() {
            if entry.target == target_id && entry.owner == owner {
                return Ok(());
            }
            delete_tolerant(repo, entry.facet_id)?;
        }
        let record =
            ProvenanceRecord::for_relationship(owner, self.scope(), local, paired, paired_repo);
        let facet_id = repo.insert_facet(&record.to_facet(), InsertMode::Allocate)?;
        self.index.insert_relationship(
            relationship.id,
            IndexEntry {
                facet_id,
                owner,
                target: target_id,
                version: None,
            },
        );
        self.counters.provenance_writes += 1;
        Ok(())
    }

    fn retry(&mut self, record: DeferredRecord) -> TransformResult<bool> {
        match record {
            DeferredRecord::Entity { entity, dangling, .. } => self.import_entity(entity, dangling),
            DeferredRecord::Container { container, .. } => self.import_container(container),
            DeferredRecord::UniqueFacet { facet, .. } => self.import_unique_facet(facet),
            DeferredRecord::FacetGroup { group, .. } => self.import_facet_group(group),
            DeferredRecord::Relationship { relationship, .. } => {
                self.import_relationship(relationship)
            }
        }
    }

    fn retry_until_stable(&mut self) -> TransformResult<()> {
        while !self.deferred.is_empty() {
            self.counters.deferred_passes += 1;
            let records = std::mem::take(&mut self.deferred);
            let mut progressed = false;
            for record in records {
                progressed |= self.retry(record)?;
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Retries deferred records until no progress, then applies the
    /// dangling reference policy to whatever is left.
    pub(super) fn drain_deferred(&mut self) -> TransformResult<()> {
        self.retry_until_stable()?;
        if self.deferred.is_empty() && self.pending.is_empty() {
            return Ok(());
        }

        match self.config.dangling_references {
            DanglingReferencesBehavior::Reject => {
                if let Some(record) = self.deferred.first() {
                    return Err(TransformError::DanglingReference {
                        referencer: record.source_id(),
                        missing: record.missing().to_vec(),
                    });
                }
                match self.pending.first() {
                    Some((referencer, missing)) => {
                        Err(TransformError::DanglingReference { referencer, missing })
                    }
                    None => Ok(()),
                }
            }
            DanglingReferencesBehavior::Ignore => {
                for leniency in [Leniency::RespectDeferred, Leniency::Force] {
                    self.leniency = leniency;
                    let result = self.retry_until_stable();
                    self.leniency = Leniency::Strict;
                    result?;
                }
                if let Some(record) = self.deferred.iter().find(|record| record.is_entity()) {
                    return Err(TransformError::DanglingReference {
                        referencer: record.source_id(),
                        missing: record.missing().to_vec(),
                    });
                }
                let dropped = self.deferred.len();
                self.deferred.clear();
                let nulled = self.pending.clear();
                self.counters.unresolved_references += (dropped + nulled) as u64;
                if dropped + nulled > 0 {
                    warn!(dropped, nulled, "ignored unresolved references");
                }
                Ok(())
            }
        }
    }
}

pub(super) fn delete_tolerant(repo: &dyn Repository, facet_id: Id64) -> TransformResult<()> {
    match repo.delete_facet(facet_id) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl ExportHandler for TransformCore<'_> {
    fn on_schemas(&mut self, schemas: &[SchemaInfo]) -> TransformResult<()> {
        self.importer.import_schemas(schemas).map(|_| ())
    }

    fn on_code_spec(&mut self, spec: &CodeSpecProps) -> TransformResult<()> {
        if self.remap.find_target_code_spec(spec.id).is_valid() {
            return Ok(());
        }
        let target_id = self.importer.import_code_spec(spec)?;
        self.remap.remap_code_spec(spec.id, target_id)
    }

    fn on_container(&mut self, container: &ContainerProps) -> TransformResult<()> {
        self.import_container(container.clone()).map(|_| ())
    }

    fn on_entity(&mut self, event: &EntityEvent) -> TransformResult<()> {
        self.import_entity(event.entity.clone(), event.dangling.clone())
            .map(|_| ())
    }

    fn on_unique_facet(&mut self, facet: &FacetProps) -> TransformResult<()> {
        self.import_unique_facet(facet.clone()).map(|_| ())
    }

    fn on_multi_facets(&mut self, group: &FacetGroup) -> TransformResult<()> {
        self.import_facet_group(group.clone()).map(|_| ())
    }

    fn on_relationship(&mut self, relationship: &RelationshipProps) -> TransformResult<()> {
        self.import_relationship(relationship.clone()).map(|_| ())
    }

    fn on_replace_entity(&mut self, old: &EntityProps) -> TransformResult<()> {
        self.replace_entity(old)
    }

    fn on_delete_entity(&mut self, deleted: &DeletedEntity) -> TransformResult<()> {
        self.delete_entity(deleted)
    }

    fn on_delete_relationship(&mut self, old: &RelationshipProps) -> TransformResult<()> {
        self.delete_relationship(old)
    }

    fn on_delete_facet(&mut self, old: &FacetProps) -> TransformResult<()> {
        self.delete_unique_facet(old)
    }

    fn on_delete_container(&mut self, old: &ContainerProps) -> TransformResult<()> {
        self.delete_container(old)
    }
}
