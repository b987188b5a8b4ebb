//! Propagation of source deletions to the target.

use super::handler::{delete_tolerant, TransformCore};
use crate::error::TransformResult;
use crate::exporter::DeletedEntity;
use reposync_repo::{
    is_provenance_class, ContainerProps, EntityProps, FacetKind, FacetProps, Id64, IdQuery,
    ProvenanceKind, ProvenanceRecord, RelationshipProps,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

impl TransformCore<'_> {
    fn deleted_target(&self, deleted: &DeletedEntity) -> Option<Id64> {
        let mapped = self.remap.find_target_entity(deleted.id);
        if mapped.is_valid() {
            return Some(mapped);
        }
        if let Some(entry) = self.index.entity(deleted.id) {
            return Some(entry.target);
        }
        if !self.config.is_reverse_synchronization {
            return None;
        }
        // the source provenance went away with the entity
        deleted
            .provenance
            .iter()
            .filter(|record| record.scope == self.config.target_scope_entity)
            .filter(|record| record.kind == ProvenanceKind::Entity)
            .find_map(ProvenanceRecord::paired_id)
    }

    fn forget_source_entity(&mut self, source_id: Id64) {
        self.remap.unmap_entity(source_id);
        self.index.remove_entity(source_id);
        self.states.delete(&source_id);
    }

    /// Deletes the target counterpart of a deleted source entity.
    pub(super) fn delete_entity(&mut self, deleted: &DeletedEntity) -> TransformResult<()> {
        let target_id = self.deleted_target(deleted);
        self.forget_source_entity(deleted.id);
        match target_id {
            Some(target_id) if !target_id.is_well_known() => {
                self.pending.forget_referrer(target_id);
                if self.importer.delete_entity(target_id)? {
                    debug!(source = %deleted.id, target = %target_id, "deleted entity");
                }
            }
            _ => debug!(source = %deleted.id, "deleted entity has no target counterpart"),
        }
        Ok(())
    }

    /// Deletes the target counterpart of a deleted source relationship
    /// together with its provenance.
    pub(super) fn delete_relationship(&mut self, old: &RelationshipProps) -> TransformResult<()> {
        let target_id = match self.index.remove_relationship(old.id) {
            Some(entry) => {
                delete_tolerant(self.provenance_repo(), entry.facet_id)?;
                Some(entry.target)
            }
            None => {
                let source = self.remap.find_target_entity(old.source);
                let target = self.remap.find_target_entity(old.target);
                if source.is_valid() && target.is_valid() {
                    let class_name = self.remap.target_class(&old.class_name);
                    self.target.find_relationship(&class_name, source, target)?
                } else {
                    None
                }
            }
        };
        if let Some(target_id) = target_id {
            self.pending.forget_referrer(target_id);
            self.importer.delete_relationship(target_id)?;
        }
        Ok(())
    }

    /// Deletes the owner's target unique facet of the same class.
    pub(super) fn delete_unique_facet(&mut self, old: &FacetProps) -> TransformResult<()> {
        if is_provenance_class(&old.class_name) {
            return Ok(());
        }
        let Some(owner) = self.resolve_entity(old.owner)? else {
            return Ok(());
        };
        let class_name = self.remap.target_class(&old.class_name);
        let doomed: Vec<Id64> = self
            .target
            .get_facets(owner, Some(&class_name))?
            .into_iter()
            .filter(|facet| facet.kind == FacetKind::Unique)
            .map(|facet| facet.id)
            .collect();
        for id in doomed {
            self.pending.forget_referrer(id);
            self.importer.delete_facet(id)?;
        }
        Ok(())
    }

    /// Deletes the target container of a container deleted without its
    /// defining entity.
    pub(super) fn delete_container(&mut self, old: &ContainerProps) -> TransformResult<()> {
        if old.id.is_well_known() {
            return Ok(());
        }
        if let Some(target_id) = self.resolve_entity(old.id)? {
            self.importer.delete_container(target_id)?;
        }
        Ok(())
    }

    /// Removes the target counterpart of an entity whose class changed,
    /// with its whole target subtree, so that it can be inserted again.
    pub(super) fn replace_entity(&mut self, old: &EntityProps) -> TransformResult<()> {
        let Some(target_id) = self.resolve_entity(old.id)? else {
            return Ok(());
        };
        if target_id.is_well_known() {
            return Ok(());
        }
        let doomed = self.target_subtree(target_id)?;

        let mut sources: HashSet<Id64> = doomed
            .iter()
            .filter_map(|id| self.remap.find_source_entity(*id))
            .collect();
        let mut facets = Vec::new();
        for (source_id, entry) in self.index.entities() {
            if doomed.contains(&entry.target) {
                sources.insert(*source_id);
                facets.push(entry.facet_id);
            }
        }
        for source_id in sources {
            self.forget_source_entity(source_id);
        }
        if self.config.is_reverse_synchronization {
            for facet_id in facets {
                delete_tolerant(self.provenance_repo(), facet_id)?;
            }
        }
        for id in &doomed {
            self.pending.forget_referrer(*id);
        }
        self.importer.delete_entity(target_id)?;
        info!(
            source = %old.id,
            target = %target_id,
            entities = doomed.len(),
            "replaced entity after class change"
        );
        Ok(())
    }

    /// `root` and every target entity below it, through parents and
    /// containers.
    fn target_subtree(&self, root: Id64) -> TransformResult<HashSet<Id64>> {
        let mut below: HashMap<Id64, Vec<Id64>> = HashMap::new();
        for id in self.target.enumerate_ids(&IdQuery::entities())? {
            let Some(entity) = self.target.get_entity(id)? else {
                continue;
            };
            if let Some(parent) = entity.parent.filter(|parent| *parent != id) {
                below.entry(parent).or_default().push(id);
            }
            if entity.container != id {
                below.entry(entity.container).or_default().push(id);
            }
        }

        let mut doomed = HashSet::from([root]);
        let mut queue = vec![root];
        while let Some(current) = queue.pop() {
            for id in below.remove(&current).unwrap_or_default() {
                if doomed.insert(id) {
                    queue.push(id);
                }
            }
        }
        Ok(doomed)
    }

    /// Full-run detection of source deletions through the provenance of
    /// earlier runs.
    pub(super) fn detect_deletions(&mut self) -> TransformResult<()> {
        if self.config.no_provenance {
            return Ok(());
        }
        if self.config.is_reverse_synchronization {
            warn!("deletion detection is skipped for reverse runs");
            return Ok(());
        }

        let mut stale_entities = Vec::new();
        for (source_id, entry) in self.index.entities() {
            if self.source.get_entity(*source_id)?.is_none() {
                stale_entities.push((*source_id, entry.target));
            }
        }
        for (source_id, target_id) in stale_entities {
            self.forget_source_entity(source_id);
            if !target_id.is_well_known() && self.importer.delete_entity(target_id)? {
                self.counters.deleted_by_detection += 1;
            }
        }

        let mut stale_relationships = Vec::new();
        for (source_id, entry) in self.index.relationships() {
            if self.source.get_relationship(*source_id)?.is_none() {
                stale_relationships.push((*source_id, entry.facet_id, entry.target));
            }
        }
        for (source_id, facet_id, target_id) in stale_relationships {
            self.index.remove_relationship(source_id);
            delete_tolerant(self.target, facet_id)?;
            if self.importer.delete_relationship(target_id)? {
                self.counters.deleted_by_detection += 1;
            }
        }
        if self.counters.deleted_by_detection > 0 {
            info!(
                count = self.counters.deleted_by_detection,
                "deleted records missing from source"
            );
        }
        Ok(())
    }

    /// Drops relationship provenance whose relationship is gone, as when
    /// an endpoint was deleted and the repository cascaded.
    pub(super) fn prune_relationship_provenance(&mut self) -> TransformResult<()> {
        if self.config.no_provenance {
            return Ok(());
        }
        let reverse = self.config.is_reverse_synchronization;
        let mut stale = Vec::new();
        for (source_id, entry) in self.index.relationships() {
            let local = if reverse { *source_id } else { entry.target };
            let repo = self.provenance_repo();
            if repo.get_relationship(local)?.is_none() {
                stale.push((*source_id, entry.facet_id));
            }
        }
        for (source_id, facet_id) in stale {
            self.index.remove_relationship(source_id);
            delete_tolerant(self.provenance_repo(), facet_id)?;
        }
        Ok(())
    }
}
