//! Strategies for visiting facets during export.

use crate::batcher::Batcher;
use crate::context::TransformContext;
use crate::error::TransformResult;
use crate::exporter::{ExportFilter, ExportHandler, FacetGroup};
use reposync_repo::{
    is_provenance_class, ClassName, FacetKind, FacetProps, Id64, IdQuery, RepoResult, Repository,
};
use tracing::debug;

/// Policy for when and how facets are exported.
pub trait FacetExportStrategy: Send {
    /// Called right after an entity was exported.
    fn export_entity_facets(
        &mut self,
        source: &dyn Repository,
        owner: Id64,
        filter: &ExportFilter,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()>;

    /// Called once after every entity of a full export.
    fn export_remaining(
        &mut self,
        source: &dyn Repository,
        filter: &ExportFilter,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()>;
}

/// Exports the facets of one owner: unique facets one by one, then all
/// multi facets as a single group covering every multi facet class.
///
/// Provenance facets are never exported.
pub fn export_owner_facets(
    source: &dyn Repository,
    owner: Id64,
    filter: &ExportFilter,
    handler: &mut dyn ExportHandler,
) -> TransformResult<()> {
    let mut multi = Vec::new();
    for facet in source.get_facets(owner, None)? {
        if is_provenance_class(&facet.class_name)
            || filter.excludes_class(source, &facet.class_name)
        {
            continue;
        }
        match facet.kind {
            FacetKind::Unique => handler.on_unique_facet(&facet)?,
            FacetKind::Multi => multi.push(facet),
        }
    }
    handler.on_multi_facets(&FacetGroup {
        owner,
        classes: None,
        facets: multi,
    })
}

/// Facets are exported together with their owner.
#[derive(Debug, Default)]
pub struct InlineFacets;

impl FacetExportStrategy for InlineFacets {
    fn export_entity_facets(
        &mut self,
        source: &dyn Repository,
        owner: Id64,
        filter: &ExportFilter,
        handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        export_owner_facets(source, owner, filter, handler)
    }

    fn export_remaining(
        &mut self,
        _source: &dyn Repository,
        _filter: &ExportFilter,
        _handler: &mut dyn ExportHandler,
        _ctx: &TransformContext,
    ) -> TransformResult<()> {
        Ok(())
    }
}

/// Facets are exported after all entities, one concrete class at a time.
///
/// Facet ids of each class are enumerated in owner order and loaded in
/// batches; consecutive multi facets of the same owner are emitted as one
/// group covering that class only.
#[derive(Debug)]
pub struct DetachedFacets {
    batch_size: usize,
}

impl DetachedFacets {
    /// Creates the strategy with the given load batch size.
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

/// Accumulates consecutive multi facets sharing an owner.
struct OwnerGroup {
    class_name: ClassName,
    owner: Option<Id64>,
    facets: Vec<FacetProps>,
    groups: usize,
}

impl OwnerGroup {
    fn new(class_name: ClassName) -> Self {
        Self {
            class_name,
            owner: None,
            facets: Vec::new(),
            groups: 0,
        }
    }

    fn push(&mut self, facet: FacetProps, handler: &mut dyn ExportHandler) -> TransformResult<()> {
        if self.owner != Some(facet.owner) {
            self.flush(handler)?;
            self.owner = Some(facet.owner);
        }
        self.facets.push(facet);
        Ok(())
    }

    fn flush(&mut self, handler: &mut dyn ExportHandler) -> TransformResult<()> {
        let Some(owner) = self.owner.take() else {
            return Ok(());
        };
        self.groups += 1;
        handler.on_multi_facets(&FacetGroup {
            owner,
            classes: Some(vec![self.class_name.clone()]),
            facets: std::mem::take(&mut self.facets),
        })
    }
}

impl DetachedFacets {
    fn export_class(
        &self,
        source: &dyn Repository,
        kind: FacetKind,
        class_name: &ClassName,
        filter: &ExportFilter,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        let load = |ids: Vec<Id64>| -> RepoResult<Vec<FacetProps>> {
            let mut facets = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(facet) = source.get_facet(id)? {
                    facets.push(facet);
                }
            }
            Ok(facets)
        };
        let mut batcher = Batcher::new(self.batch_size, load)?;
        let mut group = OwnerGroup::new(class_name.clone());

        let mut emit = |batch: Vec<FacetProps>, group: &mut OwnerGroup| -> TransformResult<()> {
            for facet in batch {
                if filter.was_skipped(facet.owner) {
                    continue;
                }
                match kind {
                    FacetKind::Unique => handler.on_unique_facet(&facet)?,
                    FacetKind::Multi => group.push(facet, handler)?,
                }
            }
            Ok(())
        };

        let ids = source.enumerate_ids(&IdQuery::facets().of_class(class_name.clone()))?;
        for id in ids {
            if let Some(batch) = batcher.add(id) {
                ctx.check_cancelled()?;
                emit(batch?, &mut group)?;
            }
        }
        if let Some(batch) = batcher.complete() {
            emit(batch?, &mut group)?;
        }
        drop(emit);
        group.flush(handler)?;

        debug!(
            class = %class_name,
            batches = batcher.batches_flushed(),
            groups = group.groups,
            "exported detached facets"
        );
        Ok(())
    }
}

impl FacetExportStrategy for DetachedFacets {
    fn export_entity_facets(
        &mut self,
        _source: &dyn Repository,
        _owner: Id64,
        _filter: &ExportFilter,
        _handler: &mut dyn ExportHandler,
    ) -> TransformResult<()> {
        Ok(())
    }

    fn export_remaining(
        &mut self,
        source: &dyn Repository,
        filter: &ExportFilter,
        handler: &mut dyn ExportHandler,
        ctx: &TransformContext,
    ) -> TransformResult<()> {
        for kind in [FacetKind::Unique, FacetKind::Multi] {
            for class_name in source.facet_classes(kind)? {
                if is_provenance_class(&class_name) || filter.excludes_class(source, &class_name) {
                    continue;
                }
                self.export_class(source, kind, &class_name, filter, handler, ctx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::tests::RecordingHandler;
    use reposync_repo::{EntityProps, InsertMode, MemoryRepository};

    fn repo_with_facets() -> (MemoryRepository, Id64, Id64) {
        let repo = MemoryRepository::new();
        let element = EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER);
        let a = repo.insert_entity(&element, InsertMode::Allocate).unwrap();
        let b = repo.insert_entity(&element, InsertMode::Allocate).unwrap();
        let multi = ClassName::new("Core:MultiAspect");
        for owner in [a, b, a, b, b] {
            let facet = FacetProps::new(multi.clone(), FacetKind::Multi, owner);
            repo.insert_facet(&facet, InsertMode::Allocate).unwrap();
        }
        repo.insert_facet(
            &FacetProps::new(ClassName::new("Core:UniqueAspect"), FacetKind::Unique, a),
            InsertMode::Allocate,
        )
        .unwrap();
        (repo, a, b)
    }

    #[test]
    fn inline_groups_all_multi_facets_of_owner() {
        let (repo, a, _) = repo_with_facets();
        let mut handler = RecordingHandler::default();
        InlineFacets
            .export_entity_facets(&repo, a, &ExportFilter::default(), &mut handler)
            .unwrap();

        assert_eq!(handler.unique_facets.len(), 1);
        assert_eq!(handler.facet_groups.len(), 1);
        let group = &handler.facet_groups[0];
        assert_eq!(group.owner, a);
        assert_eq!(group.classes, None);
        assert_eq!(group.facets.len(), 2);
    }

    #[test]
    fn detached_groups_by_owner_across_batches() {
        let (repo, a, b) = repo_with_facets();
        let mut handler = RecordingHandler::default();
        let mut strategy = DetachedFacets::new(2);
        let ctx = TransformContext::default();
        strategy
            .export_remaining(&repo, &ExportFilter::default(), &mut handler, &ctx)
            .unwrap();

        assert_eq!(handler.unique_facets.len(), 1);
        let owners: Vec<(Id64, usize)> = handler
            .facet_groups
            .iter()
            .map(|group| (group.owner, group.facets.len()))
            .collect();
        assert_eq!(owners, vec![(a, 2), (b, 3)]);
        assert_eq!(
            handler.facet_groups[0].classes,
            Some(vec![ClassName::new("Core:MultiAspect")])
        );
    }

    #[test]
    fn detached_skips_owners_that_were_skipped() {
        let (repo, a, b) = repo_with_facets();
        let mut filter = ExportFilter::default();
        filter.mark_skipped(a);
        let mut handler = RecordingHandler::default();
        DetachedFacets::new(10)
            .export_remaining(&repo, &filter, &mut handler, &TransformContext::default())
            .unwrap();

        assert!(handler.unique_facets.is_empty());
        assert_eq!(handler.facet_groups.len(), 1);
        assert_eq!(handler.facet_groups[0].owner, b);
    }
}
