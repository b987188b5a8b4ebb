//! Read-side traversal of a source repository.
//!
//! The exporter walks a repository, either completely or limited to the
//! records touched by a set of changesets, and emits ordered events to an
//! [`ExportHandler`]:
//!
//! - Schemas, then code specs, before any entity
//! - A container's defining entity before the container, and the
//!   container before its contents
//! - A parent before its children, and an entity before its facets
//! - Relationships after all entities
//! - In changeset mode, deletions after inserts and updates

use crate::changes::{ChangeEntry, ChangedIds};
use crate::config::{ClassChangePolicy, FacetExportMode};
use crate::context::TransformContext;
use crate::error::{TransformError, TransformResult};
use crate::facet_strategy::{export_owner_facets, DetachedFacets, FacetExportStrategy, InlineFacets};
use reposync_repo::{
    references, ChangeOp, ClassName, CodeSpecProps, ContainerProps, EntityProps, FacetKind,
    FacetProps, Id64, IdQuery, ProvenanceRecord, RecordKind, RelationshipProps, RepoError,
    Repository, RowImage, SchemaInfo,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// An exported entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    /// The entity as stored in the source.
    pub entity: EntityProps,
    /// Referenced entities that do not exist in the source.
    pub dangling: Vec<Id64>,
}

/// Multi facets of one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetGroup {
    /// Owning entity in the source.
    pub owner: Id64,
    /// Classes the group covers; `None` covers every multi facet class.
    pub classes: Option<Vec<ClassName>>,
    /// The facets, in source order.
    pub facets: Vec<FacetProps>,
}

/// An entity deleted from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedEntity {
    /// Source identifier.
    pub id: Id64,
    /// Image before deletion, when known.
    pub old: Option<EntityProps>,
    /// Provenance facets deleted together with the entity.
    pub provenance: Vec<ProvenanceRecord>,
}

/// Receiver of export events.
pub trait ExportHandler {
    /// All schemas of the source, in arbitrary order.
    fn on_schemas(&mut self, schemas: &[SchemaInfo]) -> TransformResult<()>;

    /// A code spec.
    fn on_code_spec(&mut self, spec: &CodeSpecProps) -> TransformResult<()>;

    /// A container, after its defining entity.
    fn on_container(&mut self, container: &ContainerProps) -> TransformResult<()>;

    /// An entity, before its facets and children.
    fn on_entity(&mut self, event: &EntityEvent) -> TransformResult<()>;

    /// A unique facet.
    fn on_unique_facet(&mut self, facet: &FacetProps) -> TransformResult<()>;

    /// The multi facets of one owner.
    fn on_multi_facets(&mut self, group: &FacetGroup) -> TransformResult<()>;

    /// A relationship.
    fn on_relationship(&mut self, relationship: &RelationshipProps) -> TransformResult<()>;

    /// An entity whose class changed; its subtree is exported again next.
    fn on_replace_entity(&mut self, _old: &EntityProps) -> TransformResult<()> {
        Ok(())
    }

    /// An entity deleted from the source.
    fn on_delete_entity(&mut self, _deleted: &DeletedEntity) -> TransformResult<()> {
        Ok(())
    }

    /// A relationship deleted from the source.
    fn on_delete_relationship(&mut self, _old: &RelationshipProps) -> TransformResult<()> {
        Ok(())
    }

    /// A unique facet deleted from the source while its owner remains.
    fn on_delete_facet(&mut self, _old: &FacetProps) -> TransformResult<()> {
        Ok(())
    }

    /// A container deleted from the source while its defining entity remains.
    fn on_delete_container(&mut self, _old: &ContainerProps) -> TransformResult<()> {
        Ok(())
    }
}

/// Exclusion rules applied before emission.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    entities: HashSet<Id64>,
    classes: Vec<ClassName>,
    skipped: HashSet<Id64>,
}

impl ExportFilter {
    /// Excludes one entity and everything below it.
    pub fn exclude_entity(&mut self, id: Id64) {
        self.entities.insert(id);
    }

    /// Excludes a class and its subclasses.
    pub fn exclude_class(&mut self, class_name: ClassName) {
        if !self.classes.contains(&class_name) {
            self.classes.push(class_name);
        }
    }

    /// Returns true if `class_name` or one of its bases is excluded.
    pub fn excludes_class(&self, source: &dyn Repository, class_name: &ClassName) -> bool {
        self.classes
            .iter()
            .any(|excluded| source.is_subclass_of(class_name, excluded))
    }

    /// Returns true if the entity is excluded by id or class.
    pub fn excludes_entity(&self, source: &dyn Repository, entity: &EntityProps) -> bool {
        self.entities.contains(&entity.id) || self.excludes_class(source, &entity.class_name)
    }

    /// Records that an entity was not exported because of an exclusion.
    pub fn mark_skipped(&mut self, id: Id64) {
        self.skipped.insert(id);
    }

    /// Returns true if the entity was skipped by an exclusion.
    pub fn was_skipped(&self, id: Id64) -> bool {
        self.skipped.contains(&id)
    }

    fn excludes_relationship(&self, source: &dyn Repository, rel: &RelationshipProps) -> bool {
        self.excludes_class(source, &rel.class_name)
            || self.was_skipped(rel.source)
            || self.was_skipped(rel.target)
            || self.entities.contains(&rel.source)
            || self.entities.contains(&rel.target)
    }
}

/// Bookkeeping of one changeset-mode walk.
#[derive(Default)]
struct ChangeWalk {
    visited: HashSet<Id64>,
    containers: HashSet<Id64>,
    replaced: HashSet<Id64>,
}

/// Source repository traversal.
pub struct Exporter {
    filter: ExportFilter,
    ranks: HashMap<Id64, i64>,
    strategy: Box<dyn FacetExportStrategy>,
    class_change_policy: ClassChangePolicy,
    exported: u64,
    tracking: Option<HashSet<Id64>>,
}

impl Exporter {
    /// Creates an exporter using the facet strategy for `mode`.
    pub fn new(mode: FacetExportMode, class_change_policy: ClassChangePolicy) -> Self {
        let strategy: Box<dyn FacetExportStrategy> = match mode {
            FacetExportMode::Inline => Box::new(InlineFacets),
            FacetExportMode::Detached { batch_size } => Box::new(DetachedFacets::new(batch_size)),
        };
        Self::with_strategy(strategy, class_change_policy)
    }

    /// Creates an exporter with a custom facet strategy.
    pub fn with_strategy(
        strategy: Box<dyn FacetExportStrategy>,
        class_change_policy: ClassChangePolicy,
    ) -> Self {
        Self {
            filter: ExportFilter::default(),
            ranks: HashMap::new(),
            strategy,
            class_change_policy,
            exported: 0,
            tracking: None,
        }
    }

    /// Excludes an entity and its subtree.
    pub fn exclude_entity(&mut self, id: Id64) {
        self.filter.exclude_entity(id);
    }

    /// Excludes a class and its subclasses.
    pub fn exclude_class(&mut self, class_name: ClassName) {
        self.filter.exclude_class(class_name);
    }

    /// Assigns an ordering rank within the entity's container. Lower ranks
    /// are exported first; the default is 0.
    pub fn set_export_rank(&mut self, id: Id64, rank: i64) {
        self.ranks.insert(id, rank);
    }

    /// The exclusion rules.
    pub fn filter(&self) -> &ExportFilter {
        &self.filter
    }

    /// Number of entities emitted so far.
    pub fn exported_entities(&self) -> u64 {
        self.exported
    }

    fn rank_key(&self, id: Id64) -> (i64, Id64) {
        (self.ranks.get(&id).copied().unwrap_or(0), id)
    }

    /// Emits every schema of the source.
    pub fn export_schemas(
        &mut self,
        source: &dyn Repository,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        let schemas = source.schemas()?;
        debug!(count = schemas.len(), "exporting schemas");
        handler.on_schemas(&schemas)
    }

    /// Emits every code spec of the source.
    pub fn export_code_specs(
        &mut self,
        source: &dyn Repository,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        for id in source.enumerate_ids(&IdQuery::new(RecordKind::CodeSpec))? {
            if let Some(spec) = source.get_code_spec(id)? {
                handler.on_code_spec(&spec)?;
            }
        }
        Ok(())
    }

    /// Full export: schemas, code specs, every container from the root
    /// down, detached facets, then relationships.
    pub fn export_all(
        &mut self,
        source: &dyn Repository,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        self.export_schemas(source, handler)?;
        self.export_code_specs(source, handler)?;
        self.walk_container(source, Id64::ROOT_CONTAINER, false, handler, ctx)?;
        self.strategy
            .export_remaining(source, &self.filter, handler, ctx)?;
        self.export_relationships(source, handler, ctx)
    }

    /// Emits a container, its contents and its sub-containers, each entity
    /// followed by its facets.
    pub fn export_container(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        self.walk_container(source, id, true, handler, ctx)
    }

    /// With `inline` unset, facets go through the configured strategy.
    fn walk_container(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        inline: bool,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let container = source
            .get_container(id)?
            .ok_or(RepoError::ContainerNotFound { id })?;
        if self.filter.excludes_class(source, &container.class_name) {
            self.skip_container(source, id)?;
            return Ok(());
        }
        handler.on_container(&container)?;

        let ids: Vec<Id64> = source
            .enumerate_ids(&IdQuery::entities().in_container(id))?
            .collect();
        let members: HashSet<Id64> = ids.iter().copied().collect();
        let mut top_level = Vec::new();
        let mut children: HashMap<Id64, Vec<Id64>> = HashMap::new();
        for entity_id in ids {
            let Some(entity) = source.get_entity(entity_id)? else {
                continue;
            };
            match entity.parent {
                Some(parent) if members.contains(&parent) && parent != entity_id => {
                    children.entry(parent).or_default().push(entity_id);
                }
                _ => top_level.push(entity_id),
            }
        }
        top_level.sort_by_key(|entity_id| self.rank_key(*entity_id));
        for kids in children.values_mut() {
            kids.sort_by_key(|entity_id| self.rank_key(*entity_id));
        }

        let mut sub_containers = Vec::new();
        for entity_id in top_level {
            ctx.check_cancelled()?;
            self.export_tree(
                source,
                entity_id,
                id,
                inline,
                &children,
                &mut sub_containers,
                handler,
                ctx,
            )?;
        }
        for sub in sub_containers {
            self.walk_container(source, sub, inline, handler, ctx)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn export_tree(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        container: Id64,
        inline: bool,
        children: &HashMap<Id64, Vec<Id64>>,
        sub_containers: &mut Vec<Id64>,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let Some(entity) = source.get_entity(id)? else {
            return Ok(());
        };
        if self.filter.excludes_entity(source, &entity) {
            self.skip_tree(source, id, container, children)?;
            return Ok(());
        }
        self.emit_entity(source, entity, inline, handler, ctx)?;
        if id != container && source.get_container(id)?.is_some() {
            sub_containers.push(id);
        }
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                self.export_tree(
                    source,
                    *kid,
                    container,
                    inline,
                    children,
                    sub_containers,
                    handler,
                    ctx,
                )?;
            }
        }
        Ok(())
    }

    fn skip_tree(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        container: Id64,
        children: &HashMap<Id64, Vec<Id64>>,
    ) -> TransformResult<()> {
        self.filter.mark_skipped(id);
        if id != container && source.get_container(id)?.is_some() {
            self.skip_container(source, id)?;
        }
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                self.skip_tree(source, *kid, container, children)?;
            }
        }
        Ok(())
    }

    fn skip_container(&mut self, source: &dyn Repository, id: Id64) -> TransformResult<()> {
        let contents: Vec<Id64> = source
            .enumerate_ids(&IdQuery::entities().in_container(id))?
            .filter(|member| *member != id)
            .collect();
        for member in contents {
            if self.filter.was_skipped(member) {
                continue;
            }
            self.filter.mark_skipped(member);
            if source.get_container(member)?.is_some() {
                self.skip_container(source, member)?;
            }
        }
        Ok(())
    }

    fn find_dangling(
        &self,
        source: &dyn Repository,
        entity: &EntityProps,
    ) -> TransformResult<Vec<Id64>> {
        let mut dangling = Vec::new();
        let candidates = entity.parent.into_iter().chain(references(&entity.properties));
        for referenced in candidates {
            if source.get_entity(referenced)?.is_none() && !dangling.contains(&referenced) {
                dangling.push(referenced);
            }
        }
        Ok(dangling)
    }

    fn emit_entity(
        &mut self,
        source: &dyn Repository,
        entity: EntityProps,
        inline_facets: bool,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let id = entity.id;
        let dangling = self.find_dangling(source, &entity)?;
        if !dangling.is_empty() {
            debug!(entity = %id, ?dangling, "entity has dangling references");
        }
        handler.on_entity(&EntityEvent { entity, dangling })?;
        if inline_facets {
            export_owner_facets(source, id, &self.filter, handler)?;
        } else {
            self.strategy
                .export_entity_facets(source, id, &self.filter, handler)?;
        }
        if let Some(tracked) = self.tracking.as_mut() {
            tracked.insert(id);
        }
        self.exported += 1;
        ctx.report_progress(self.exported);
        Ok(())
    }

    /// Emits one entity and its facets.
    pub fn export_entity(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let entity = source
            .get_entity(id)?
            .ok_or(RepoError::EntityNotFound { id })?;
        if self.filter.excludes_entity(source, &entity) {
            self.filter.mark_skipped(id);
            return Ok(());
        }
        self.emit_entity(source, entity, true, handler, ctx)
    }

    /// Emits every relationship not touching an excluded entity.
    pub fn export_relationships(
        &mut self,
        source: &dyn Repository,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        for id in source.enumerate_ids(&IdQuery::relationships())? {
            ctx.check_cancelled()?;
            let Some(rel) = source.get_relationship(id)? else {
                continue;
            };
            if !self.filter.excludes_relationship(source, &rel) {
                handler.on_relationship(&rel)?;
            }
        }
        Ok(())
    }

    /// Changeset-mode export of the records in `changes`.
    pub fn export_changes(
        &mut self,
        source: &dyn Repository,
        changes: &ChangedIds,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        self.export_schemas(source, handler)?;
        self.export_code_specs(source, handler)?;

        let mut walk = ChangeWalk::default();
        for (id, entry) in &changes.entities {
            if entry.op == ChangeOp::Deleted {
                continue;
            }
            ctx.check_cancelled()?;
            self.export_changed_entity(source, *id, changes, &mut walk, handler, ctx)?;
        }

        for (id, entry) in &changes.containers {
            if entry.op != ChangeOp::Deleted {
                self.emit_changed_container(source, *id, changes, &mut walk, handler)?;
            }
        }

        self.export_changed_facets(source, changes, &walk, handler)?;
        self.export_changed_relationships(source, changes, &walk, handler)?;
        self.export_deletions(changes, handler)
    }

    fn export_changed_entity(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        changes: &ChangedIds,
        walk: &mut ChangeWalk,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        if !walk.visited.insert(id) {
            return Ok(());
        }
        let Some(entity) = source.get_entity(id)? else {
            return Ok(());
        };
        if self.filter.excludes_entity(source, &entity) {
            self.filter.mark_skipped(id);
            return Ok(());
        }

        if let Some(parent) = entity.parent {
            if is_live_change(changes, parent) {
                self.export_changed_entity(source, parent, changes, walk, handler, ctx)?;
            }
        }
        if entity.container != id {
            if is_live_change(changes, entity.container) {
                self.export_changed_entity(source, entity.container, changes, walk, handler, ctx)?;
            }
            self.emit_changed_container(source, entity.container, changes, walk, handler)?;
        }

        if let Some(entry) = changes.entities.get(&id).filter(|entry| entry.class_changed()) {
            let old = entry
                .old_entity()
                .ok_or_else(|| {
                    TransformError::invalid_operation("class change without old image")
                })?;
            if self.class_change_policy == ClassChangePolicy::Reject {
                return Err(TransformError::ChangesetClassIdentityAnomaly {
                    id,
                    old_class: old.class_name.clone(),
                    new_class: entity.class_name.clone(),
                });
            }
            handler.on_replace_entity(old)?;
            return self.export_replaced_subtree(source, entity, walk, handler, ctx);
        }

        self.emit_entity(source, entity, true, handler, ctx)?;
        self.emit_changed_container(source, id, changes, walk, handler)
    }

    fn emit_changed_container(
        &mut self,
        source: &dyn Repository,
        id: Id64,
        changes: &ChangedIds,
        walk: &mut ChangeWalk,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        let changed = changes
            .containers
            .get(&id)
            .is_some_and(|entry| entry.op != ChangeOp::Deleted);
        if !changed || !walk.containers.insert(id) {
            return Ok(());
        }
        match source.get_container(id)? {
            Some(container) => handler.on_container(&container),
            None => Ok(()),
        }
    }

    /// Exports an entity again with everything below it: children,
    /// the container it defines, and that container's contents.
    fn export_replaced_subtree(
        &mut self,
        source: &dyn Repository,
        entity: EntityProps,
        walk: &mut ChangeWalk,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let outer = self.tracking.replace(HashSet::new());
        let result = self.export_subtree(source, entity, walk, handler, ctx);
        let tracked = std::mem::replace(&mut self.tracking, outer).unwrap_or_default();
        result?;

        debug!(entities = tracked.len(), "re-exported replaced subtree");
        walk.visited.extend(tracked.iter().copied());
        walk.replaced.extend(tracked);
        Ok(())
    }

    fn export_subtree(
        &mut self,
        source: &dyn Repository,
        entity: EntityProps,
        walk: &mut ChangeWalk,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let id = entity.id;
        self.emit_entity(source, entity, true, handler, ctx)?;
        if walk.containers.insert(id) && source.get_container(id)?.is_some() {
            self.export_container(source, id, handler, ctx)?;
        }

        let mut kids = Vec::new();
        for candidate in source.enumerate_ids(&IdQuery::entities())? {
            if let Some(child) = source.get_entity(candidate)? {
                if child.parent == Some(id) && child.id != id {
                    kids.push(child);
                }
            }
        }
        kids.sort_by_key(|child| self.rank_key(child.id));
        for child in kids {
            if self.tracking.as_ref().is_some_and(|tracked| tracked.contains(&child.id)) {
                continue;
            }
            if self.filter.excludes_entity(source, &child) {
                self.filter.mark_skipped(child.id);
                continue;
            }
            self.export_subtree(source, child, walk, handler, ctx)?;
        }
        Ok(())
    }

    fn export_changed_facets(
        &mut self,
        source: &dyn Repository,
        changes: &ChangedIds,
        walk: &ChangeWalk,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        for entry in changes.facets.values().filter(|entry| entry.class_changed()) {
            let Some(RowImage::Facet(old)) = &entry.old else {
                continue;
            };
            if self.class_change_policy == ClassChangePolicy::Reject {
                return Err(anomaly(entry, old.id));
            }
            if old.kind == FacetKind::Unique {
                handler.on_delete_facet(old)?;
            }
        }

        let mut owners = changes.facet_owners();
        owners.extend(changes.deleted_facets().map(|facet| facet.owner));
        owners.sort_unstable();
        owners.dedup();
        for owner in owners {
            if walk.visited.contains(&owner) || self.filter.was_skipped(owner) {
                continue;
            }
            let Some(entity) = source.get_entity(owner)? else {
                continue;
            };
            if self.filter.excludes_entity(source, &entity) {
                continue;
            }
            export_owner_facets(source, owner, &self.filter, handler)?;
        }
        Ok(())
    }

    fn export_changed_relationships(
        &mut self,
        source: &dyn Repository,
        changes: &ChangedIds,
        walk: &ChangeWalk,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        let mut emitted = HashSet::new();
        for (id, entry) in &changes.relationships {
            if entry.op == ChangeOp::Deleted {
                continue;
            }
            let Some(rel) = source.get_relationship(*id)? else {
                continue;
            };
            if self.filter.excludes_relationship(source, &rel) {
                continue;
            }
            if entry.class_changed() {
                let Some(RowImage::Relationship(old)) = &entry.old else {
                    continue;
                };
                if self.class_change_policy == ClassChangePolicy::Reject {
                    return Err(anomaly(entry, *id));
                }
                handler.on_delete_relationship(old)?;
            }
            handler.on_relationship(&rel)?;
            emitted.insert(*id);
        }

        if walk.replaced.is_empty() {
            return Ok(());
        }
        for id in source.enumerate_ids(&IdQuery::relationships())? {
            if emitted.contains(&id) {
                continue;
            }
            let Some(rel) = source.get_relationship(id)? else {
                continue;
            };
            let touches =
                walk.replaced.contains(&rel.source) || walk.replaced.contains(&rel.target);
            if touches && !self.filter.excludes_relationship(source, &rel) {
                handler.on_relationship(&rel)?;
            }
        }
        Ok(())
    }

    fn export_deletions(
        &mut self,
        changes: &ChangedIds,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        let deleted_entity =
            |id: Id64| changes.entities.get(&id).is_some_and(|entry| entry.op == ChangeOp::Deleted);

        for entry in changes.relationships.values() {
            if let (ChangeOp::Deleted, Some(RowImage::Relationship(old))) = (entry.op, &entry.old) {
                handler.on_delete_relationship(old)?;
            }
        }
        for facet in changes.deleted_unique_facets() {
            if !deleted_entity(facet.owner) {
                handler.on_delete_facet(facet)?;
            }
        }

        let mut provenance = changes.deleted_provenance();
        for (id, entry) in &changes.entities {
            if entry.op != ChangeOp::Deleted || self.filter.was_skipped(*id) {
                continue;
            }
            handler.on_delete_entity(&DeletedEntity {
                id: *id,
                old: entry.old_entity().cloned(),
                provenance: provenance.remove(id).unwrap_or_default(),
            })?;
        }

        for (id, entry) in &changes.containers {
            if entry.op != ChangeOp::Deleted || deleted_entity(*id) {
                continue;
            }
            if let Some(RowImage::Container(old)) = &entry.old {
                handler.on_delete_container(old)?;
            }
        }
        Ok(())
    }
}

fn is_live_change(changes: &ChangedIds, id: Id64) -> bool {
    changes
        .entities
        .get(&id)
        .is_some_and(|entry| entry.op != ChangeOp::Deleted)
}

fn anomaly(entry: &ChangeEntry, id: Id64) -> TransformError {
    let class_of = |image: &Option<RowImage>| {
        image
            .as_ref()
            .and_then(RowImage::class_name)
            .cloned()
            .unwrap_or_else(|| ClassName::new(""))
    };
    TransformError::ChangesetClassIdentityAnomaly {
        id,
        old_class: class_of(&entry.old),
        new_class: class_of(&entry.new),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use reposync_repo::{ChangesetRange, FacetProps, InsertMode, MemoryRepository, PropertyValue};

    /// Handler that records every event.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingHandler {
        pub schemas: usize,
        pub code_specs: Vec<String>,
        pub order: Vec<String>,
        pub entities: Vec<EntityEvent>,
        pub containers: Vec<Id64>,
        pub unique_facets: Vec<FacetProps>,
        pub facet_groups: Vec<FacetGroup>,
        pub relationships: Vec<Id64>,
        pub replaced: Vec<Id64>,
        pub deleted_entities: Vec<DeletedEntity>,
        pub deleted_relationships: Vec<Id64>,
        pub deleted_facets: Vec<Id64>,
    }

    impl ExportHandler for RecordingHandler {
        fn on_schemas(&mut self, schemas: &[SchemaInfo]) -> TransformResult<()> {
            self.schemas += schemas.len();
            Ok(())
        }

        fn on_code_spec(&mut self, spec: &CodeSpecProps) -> TransformResult<()> {
            self.code_specs.push(spec.name.clone());
            Ok(())
        }

        fn on_container(&mut self, container: &ContainerProps) -> TransformResult<()> {
            self.order.push(format!("container {}", container.id));
            self.containers.push(container.id);
            Ok(())
        }

        fn on_entity(&mut self, event: &EntityEvent) -> TransformResult<()> {
            self.order.push(format!("entity {}", event.entity.id));
            self.entities.push(event.clone());
            Ok(())
        }

        fn on_unique_facet(&mut self, facet: &FacetProps) -> TransformResult<()> {
            self.unique_facets.push(facet.clone());
            Ok(())
        }

        fn on_multi_facets(&mut self, group: &FacetGroup) -> TransformResult<()> {
            self.facet_groups.push(group.clone());
            Ok(())
        }

        fn on_relationship(&mut self, relationship: &RelationshipProps) -> TransformResult<()> {
            self.order.push(format!("relationship {}", relationship.id));
            self.relationships.push(relationship.id);
            Ok(())
        }

        fn on_replace_entity(&mut self, old: &EntityProps) -> TransformResult<()> {
            self.replaced.push(old.id);
            Ok(())
        }

        fn on_delete_entity(&mut self, deleted: &DeletedEntity) -> TransformResult<()> {
            self.order.push(format!("delete {}", deleted.id));
            self.deleted_entities.push(deleted.clone());
            Ok(())
        }

        fn on_delete_relationship(&mut self, old: &RelationshipProps) -> TransformResult<()> {
            self.deleted_relationships.push(old.id);
            Ok(())
        }

        fn on_delete_facet(&mut self, old: &FacetProps) -> TransformResult<()> {
            self.deleted_facets.push(old.id);
            Ok(())
        }
    }

    impl RecordingHandler {
        pub fn entity_ids(&self) -> Vec<Id64> {
            self.entities.iter().map(|event| event.entity.id).collect()
        }

        pub fn position(&self, line: &str) -> usize {
            self.order
                .iter()
                .position(|entry| entry == line)
                .unwrap_or_else(|| panic!("missing event {line}"))
        }

        /// Whether event `first` was emitted before event `second`.
        pub fn before(&self, first: &str, second: &str) -> bool {
            self.position(first) < self.position(second)
        }
    }

    fn element(container: Id64) -> EntityProps {
        EntityProps::new(ClassName::new("Core:Element"), container)
    }

    fn insert(repo: &MemoryRepository, props: EntityProps) -> Id64 {
        repo.insert_entity(&props, InsertMode::Allocate).unwrap()
    }

    fn root_element(repo: &MemoryRepository) -> Id64 {
        insert(repo, element(Id64::ROOT_CONTAINER))
    }

    fn full_export(repo: &MemoryRepository, exporter: &mut Exporter) -> RecordingHandler {
        let mut handler = RecordingHandler::default();
        exporter
            .export_all(repo, &mut handler, &TransformContext::default())
            .unwrap();
        handler
    }

    fn exporter() -> Exporter {
        Exporter::new(FacetExportMode::Inline, ClassChangePolicy::DeleteAndInsert)
    }

    #[test]
    fn parents_before_children_and_containers_before_contents() {
        let repo = MemoryRepository::new();
        let parent = root_element(&repo);
        let child = insert(&repo, element(Id64::ROOT_CONTAINER).with_parent(parent));
        let model = ContainerProps::new(ClassName::new("Core:Model"), parent);
        repo.insert_container(&model).unwrap();
        let inner = insert(&repo, element(parent));

        let handler = full_export(&repo, &mut exporter());

        assert!(handler.before(&format!("entity {parent}"), &format!("entity {child}")));
        assert!(handler.before(&format!("entity {parent}"), &format!("container {parent}")));
        assert!(handler.before(&format!("container {parent}"), &format!("entity {inner}")));
        assert_eq!(handler.schemas, 1);
    }

    #[test]
    fn export_rank_orders_siblings() {
        let repo = MemoryRepository::new();
        let a = root_element(&repo);
        let b = root_element(&repo);

        let mut exporter = exporter();
        exporter.set_export_rank(a, 5);
        let handler = full_export(&repo, &mut exporter);
        assert!(handler.before(&format!("entity {b}"), &format!("entity {a}")));
    }

    #[test]
    fn exclusions_skip_subtrees_and_relationships() {
        let repo = MemoryRepository::new();
        let kept = root_element(&repo);
        let excluded = root_element(&repo);
        let below = insert(&repo, element(Id64::ROOT_CONTAINER).with_parent(excluded));
        let subject = repo
            .insert_entity(
                &EntityProps::new(ClassName::new("Core:Subject"), Id64::ROOT_CONTAINER),
                InsertMode::Allocate,
            )
            .unwrap();
        repo.insert_relationship(
            &RelationshipProps::new(ClassName::new("Core:ElementRefersToElements"), kept, below),
            InsertMode::Allocate,
        )
        .unwrap();

        let mut exporter = exporter();
        exporter.exclude_entity(excluded);
        exporter.exclude_class(ClassName::new("Core:Subject"));
        let handler = full_export(&repo, &mut exporter);

        let ids = handler.entity_ids();
        assert!(ids.contains(&kept));
        assert!(!ids.contains(&excluded));
        assert!(!ids.contains(&below));
        assert!(!ids.contains(&subject));
        // the root entity is a subject too
        assert!(!ids.contains(&Id64::ROOT_ENTITY));
        assert!(handler.relationships.is_empty());
    }

    #[test]
    fn dangling_references_are_reported() {
        let repo = MemoryRepository::new();
        let missing = Id64::new(0x999);
        let props = element(Id64::ROOT_CONTAINER)
            .with_property("ref", PropertyValue::navigation(missing));
        let id = insert(&repo, props);

        let handler = full_export(&repo, &mut exporter());
        let event = handler.entities.iter().find(|event| event.entity.id == id).unwrap();
        assert_eq!(event.dangling, vec![missing]);
    }

    #[test]
    fn cancellation_stops_export() {
        let repo = MemoryRepository::new();
        root_element(&repo);
        let ctx = TransformContext::default();
        ctx.cancel_handle().cancel();

        let mut handler = RecordingHandler::default();
        let result = exporter().export_all(&repo, &mut handler, &ctx);
        assert!(matches!(result, Err(TransformError::Cancelled)));
    }

    fn changeset_export(repo: &MemoryRepository, changes: &ChangedIds) -> RecordingHandler {
        let mut handler = RecordingHandler::default();
        exporter()
            .export_changes(repo, changes, &mut handler, &TransformContext::default())
            .unwrap();
        handler
    }

    fn changes_since(repo: &MemoryRepository, first: u64) -> ChangedIds {
        let range = ChangesetRange::new(first, repo.changeset_index());
        ChangedIds::from_changesets(&repo.download_changesets(range).unwrap())
    }

    #[test]
    fn changeset_mode_exports_only_changes_with_deletes_last() {
        let repo = MemoryRepository::new();
        let stays = root_element(&repo);
        let goes = root_element(&repo);
        repo.save_changes("initial").unwrap();

        let added = root_element(&repo);
        repo.delete_entity(goes).unwrap();
        repo.save_changes("edit").unwrap();

        let handler = changeset_export(&repo, &changes_since(&repo, 2));

        assert_eq!(handler.entity_ids(), vec![added]);
        assert!(!handler.entity_ids().contains(&stays));
        assert!(handler.before(&format!("entity {added}"), &format!("delete {goes}")));
    }

    #[test]
    fn changeset_mode_orders_parent_before_child() {
        let repo = MemoryRepository::new();
        let child = root_element(&repo);
        let parent = root_element(&repo);
        let mut props = repo.get_entity(child).unwrap().unwrap();
        props.parent = Some(parent);
        repo.update_entity(&props).unwrap();
        repo.save_changes("edit").unwrap();
        assert!(child < parent);

        let handler = changeset_export(&repo, &changes_since(&repo, 1));
        assert_eq!(handler.entity_ids(), vec![parent, child]);
    }

    #[test]
    fn class_change_rejected_or_replaced() {
        let repo = MemoryRepository::new();
        let id = root_element(&repo);
        let child = insert(&repo, element(Id64::ROOT_CONTAINER).with_parent(id));
        repo.save_changes("initial").unwrap();
        let mut props = repo.get_entity(id).unwrap().unwrap();
        props.class_name = ClassName::new("Core:Subject");
        repo.update_entity(&props).unwrap();
        repo.save_changes("reclass").unwrap();
        let changes = changes_since(&repo, 2);

        let mut rejecting = Exporter::new(FacetExportMode::Inline, ClassChangePolicy::Reject);
        let result = rejecting.export_changes(
            &repo,
            &changes,
            &mut RecordingHandler::default(),
            &TransformContext::default(),
        );
        assert!(matches!(result, Err(TransformError::ChangesetClassIdentityAnomaly { .. })));

        let handler = changeset_export(&repo, &changes);
        assert_eq!(handler.replaced, vec![id]);
        assert_eq!(handler.entity_ids(), vec![id, child]);
    }

    #[test]
    fn facet_change_reexports_owner_facets() {
        let repo = MemoryRepository::new();
        let owner = root_element(&repo);
        repo.save_changes("initial").unwrap();
        repo.insert_facet(
            &FacetProps::new(ClassName::new("Core:MultiAspect"), FacetKind::Multi, owner),
            InsertMode::Allocate,
        )
        .unwrap();
        repo.save_changes("facet").unwrap();

        let handler = changeset_export(&repo, &changes_since(&repo, 2));
        assert!(handler.entities.is_empty());
        assert_eq!(handler.facet_groups.len(), 1);
        assert_eq!(handler.facet_groups[0].owner, owner);
        assert_eq!(handler.facet_groups[0].facets.len(), 1);
    }
}
