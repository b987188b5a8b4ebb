//! Orchestration of export, transformation and import.
//!
//! A [`Transformer`] pairs a source and a target repository. Each run
//! exports source records, remaps their identifiers, imports them into the
//! target and records provenance, then commits the target with an updated
//! scope record.

mod deferred;
mod deletes;
mod fingerprint;
mod handler;
mod provenance_index;

pub use deferred::EntityState;

use crate::changes::ChangedIds;
use crate::config::TransformerConfig;
use crate::context::{CancelHandle, TransformContext};
use crate::error::{TransformError, TransformResult};
use crate::exporter::Exporter;
use crate::importer::ImportCounters;
use crate::remap::RemapContext;
use handler::TransformCore;
use provenance_index::{find_scope_record, ProvenanceIndex};
use reposync_repo::{
    Changeset, ChangesetRange, ClassName, Id64, InsertMode, ProvenanceRecord, RepoError,
    Repository,
};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Lifecycle of a transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, no run yet.
    Ready,
    /// A run is in progress.
    Running,
    /// The last run succeeded.
    Finished,
    /// The last run failed or was cancelled.
    Failed,
    /// Disposed; no further runs.
    Disposed,
}

impl RunState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running)
    }

    /// Returns true if a new run can start.
    pub fn can_start(&self) -> bool {
        matches!(self, RunState::Ready | RunState::Finished | RunState::Failed)
    }
}

/// Statistics of a transformer, accumulated over its runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformStats {
    /// Target writes per record kind.
    pub imported: ImportCounters,
    /// Entities emitted by the exporter.
    pub exported_entities: u64,
    /// Retry passes over deferred records.
    pub deferred_passes: u64,
    /// Pending references patched after their target was imported.
    pub resolved_references: u64,
    /// References dropped under `DanglingReferencesBehavior::Ignore`.
    pub unresolved_references: u64,
    /// Entities skipped because their fingerprint was unchanged.
    pub skipped_unchanged: u64,
    /// Target records deleted because their source no longer exists.
    pub deleted_by_detection: u64,
    /// Provenance facets inserted or updated.
    pub provenance_writes: u64,
    /// Duration of the last run.
    pub duration: Duration,
}

/// Transforms a source repository into a target repository.
///
/// # Example
///
/// ```rust
/// use reposync_core::{Transformer, TransformerConfig};
/// use reposync_repo::MemoryRepository;
///
/// let source = MemoryRepository::new();
/// let target = MemoryRepository::new();
/// let mut transformer = Transformer::new(&source, &target, TransformerConfig::new())?;
/// let stats = transformer.process()?;
/// assert_eq!(stats.unresolved_references, 0);
/// # Ok::<(), reposync_core::TransformError>(())
/// ```
pub struct Transformer<'a> {
    source: &'a dyn Repository,
    target: &'a dyn Repository,
    ctx: TransformContext,
    exporter: Exporter,
    core: TransformCore<'a>,
    state: RunState,
    duration: Duration,
}

impl<'a> Transformer<'a> {
    /// Creates a transformer.
    ///
    /// Unless provenance is disabled, the scope entity must exist in the
    /// repository that holds provenance (the target, or the source for a
    /// reverse run) and must not be paired with another repository.
    pub fn new(
        source: &'a dyn Repository,
        target: &'a dyn Repository,
        config: TransformerConfig,
    ) -> TransformResult<Self> {
        let mut remap = RemapContext::new();
        let index = if config.no_provenance {
            ProvenanceIndex::default()
        } else {
            let reverse = config.is_reverse_synchronization;
            let (provenance_repo, master) = if reverse {
                (source, target.id())
            } else {
                (target, source.id())
            };
            let scope = config.target_scope_entity;
            if provenance_repo.get_entity(scope)?.is_none() {
                return Err(RepoError::EntityNotFound { id: scope }.into());
            }
            if let Some(existing) = find_scope_record(provenance_repo, scope)?
                .and_then(|record| record.source_repository)
            {
                remap.validate_scope(scope, existing)?;
            }
            remap.validate_scope(scope, master)?;
            ProvenanceIndex::load(provenance_repo, scope, reverse)?
        };

        let ctx = TransformContext::new(config.progress_interval);
        ctx.span().in_scope(|| {
            info!(
                source = %source.id(),
                target = %target.id(),
                reverse = config.is_reverse_synchronization,
                indexed = index.len(),
                "created transformer"
            );
        });
        let exporter = Exporter::new(config.facet_export, config.class_change_policy);
        Ok(Self {
            source,
            target,
            ctx,
            exporter,
            core: TransformCore::new(source, target, config, remap, index),
            state: RunState::Ready,
            duration: Duration::ZERO,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &TransformerConfig {
        &self.core.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The run context.
    pub fn context(&self) -> &TransformContext {
        &self.ctx
    }

    /// Returns a handle that cancels the current or next run.
    ///
    /// A cancelled run stops before the next top-level entity, commits
    /// the work done so far without advancing the changeset cursor, and
    /// fails with `Cancelled`. The request is consumed by that run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.ctx.cancel_handle()
    }

    /// Identifier mappings established so far.
    pub fn remap_context(&self) -> &RemapContext {
        &self.core.remap
    }

    /// State of a source entity in the current transformer.
    pub fn entity_state(&self, source_id: Id64) -> EntityState {
        self.core
            .states
            .get(&source_id)
            .copied()
            .unwrap_or(EntityState::Pending)
    }

    /// Excludes a source entity and everything below it.
    pub fn exclude_entity(&mut self, id: Id64) {
        self.exporter.exclude_entity(id);
    }

    /// Excludes a source class and its subclasses.
    pub fn exclude_class(&mut self, class_name: ClassName) {
        self.exporter.exclude_class(class_name);
    }

    /// Orders an entity within its container; lower ranks go first.
    pub fn set_export_rank(&mut self, id: Id64, rank: i64) {
        self.exporter.set_export_rank(id, rank);
    }

    /// Maps a source class to a different target class.
    pub fn remap_class(&mut self, source: ClassName, target: ClassName) {
        self.core.remap.remap_class(source, target);
    }

    /// Maps a source entity to an existing target entity before a run.
    pub fn remap_entity(&mut self, source: Id64, target: Id64) -> TransformResult<()> {
        self.core.remap.remap_entity(source, target)
    }

    /// Statistics accumulated over every run of this transformer.
    pub fn stats(&self) -> TransformStats {
        let counters = &self.core.counters;
        TransformStats {
            imported: *self.core.importer.counters(),
            exported_entities: self.exporter.exported_entities(),
            deferred_passes: counters.deferred_passes,
            resolved_references: counters.resolved_references,
            unresolved_references: counters.unresolved_references,
            skipped_unchanged: counters.skipped_unchanged,
            deleted_by_detection: counters.deleted_by_detection,
            provenance_writes: counters.provenance_writes,
            duration: self.duration,
        }
    }

    /// Full run: every schema, code spec, container, entity, facet and
    /// relationship, then detection of source deletions.
    pub fn process(&mut self) -> TransformResult<TransformStats> {
        let source = self.source;
        self.run("process", |exporter, core, ctx| {
            exporter.export_all(source, core, ctx)?;
            core.drain_deferred()?;
            core.detect_deletions()?;
            Ok(Some(source.changeset_index()))
        })
    }

    /// Incremental run over a range of source changesets.
    ///
    /// With `None` the run resumes after the last changeset recorded in
    /// the scope record.
    pub fn process_changes(
        &mut self,
        range: Option<ChangesetRange>,
    ) -> TransformResult<TransformStats> {
        let range = match range {
            Some(range) => range,
            None => self.resume_range()?,
        };
        let source = self.source;
        self.run("process_changes", |exporter, core, ctx| {
            let changesets = if range.is_empty() {
                Vec::new()
            } else {
                source.download_changesets(range)?
            };
            let changes = ChangedIds::from_changesets(&changesets);
            info!(
                first = range.first,
                last = range.last,
                records = changes.len(),
                "processing changes"
            );
            exporter.export_changes(source, &changes, core, ctx)?;
            core.drain_deferred()?;
            Ok((!range.is_empty()).then_some(range.last))
        })
    }

    /// Incremental run over changesets supplied by the caller, such as
    /// changeset files.
    pub fn process_changesets(
        &mut self,
        changesets: &[Changeset],
    ) -> TransformResult<TransformStats> {
        let source = self.source;
        self.run("process_changesets", |exporter, core, ctx| {
            let changes = ChangedIds::from_changesets(changesets);
            exporter.export_changes(source, &changes, core, ctx)?;
            core.drain_deferred()?;
            Ok(changesets
                .iter()
                .filter(|changeset| changeset.repository == source.id())
                .map(|changeset| changeset.index)
                .max())
        })
    }

    /// Imports the source schemas only.
    pub fn process_schemas(&mut self) -> TransformResult<TransformStats> {
        let source = self.source;
        self.run("process_schemas", |exporter, core, _| {
            exporter.export_schemas(source, core)?;
            Ok(None)
        })
    }

    /// Imports one source entity with its facets.
    pub fn process_entity(&mut self, id: Id64) -> TransformResult<TransformStats> {
        let source = self.source;
        self.run("process_entity", |exporter, core, ctx| {
            exporter.export_code_specs(source, core)?;
            exporter.export_entity(source, id, core, ctx)?;
            core.drain_deferred()?;
            Ok(None)
        })
    }

    /// Imports one source container with everything it holds.
    pub fn process_container(&mut self, id: Id64) -> TransformResult<TransformStats> {
        let source = self.source;
        self.run("process_container", |exporter, core, ctx| {
            exporter.export_code_specs(source, core)?;
            if let Some(entity) = source.get_entity(id)? {
                if !entity.id.is_well_known() {
                    exporter.export_entity(source, id, core, ctx)?;
                }
            }
            exporter.export_container(source, id, core, ctx)?;
            core.drain_deferred()?;
            Ok(None)
        })
    }

    /// Ends the transformer; later runs fail.
    pub fn dispose(&mut self) {
        if self.state != RunState::Disposed {
            info!(parent: self.ctx.span(), stats = ?self.stats(), "disposed transformer");
            self.state = RunState::Disposed;
        }
    }

    fn resume_range(&self) -> TransformResult<ChangesetRange> {
        let config = &self.core.config;
        if config.no_provenance {
            return Err(TransformError::invalid_operation(
                "resuming changes requires provenance",
            ));
        }
        let record = find_scope_record(self.core.provenance_repo(), config.target_scope_entity)?;
        let cursor = record
            .and_then(|record| {
                if config.is_reverse_synchronization {
                    record.reverse_synced_changeset
                } else {
                    record.synced_changeset
                }
            })
            .unwrap_or(0);
        Ok(ChangesetRange::new(cursor + 1, self.source.changeset_index()))
    }

    /// Runs `body`, then commits and advances the cursor it returns.
    fn run<F>(&mut self, operation: &'static str, body: F) -> TransformResult<TransformStats>
    where
        F: FnOnce(
            &mut Exporter,
            &mut TransformCore<'a>,
            &TransformContext,
        ) -> TransformResult<Option<u64>>,
    {
        if !self.state.can_start() {
            return Err(TransformError::invalid_operation(format!(
                "cannot start {operation} in state {:?}",
                self.state
            )));
        }
        self.state = RunState::Running;
        let span = self.ctx.span().clone();
        let _entered = span.enter();
        info!(operation, "starting run");
        let started = Instant::now();

        let result = body(&mut self.exporter, &mut self.core, &self.ctx)
            .and_then(|cursor| self.commit(operation, cursor));
        self.duration = started.elapsed();

        match result {
            Ok(()) => {
                self.state = RunState::Finished;
                let stats = self.stats();
                info!(
                    operation,
                    writes = stats.imported.total_writes(),
                    deferred_passes = stats.deferred_passes,
                    unresolved = stats.unresolved_references,
                    duration_ms = self.duration.as_millis() as u64,
                    "run finished"
                );
                Ok(stats)
            }
            Err(TransformError::Cancelled) => {
                self.ctx.reset_cancel();
                self.state = RunState::Failed;
                let description = format!("reposync: {operation} (partial)");
                self.target.save_changes(&description)?;
                if self.core.config.is_reverse_synchronization && !self.core.config.no_provenance {
                    self.source.save_changes(&description)?;
                }
                warn!(operation, "run cancelled, partial work saved");
                Err(TransformError::Cancelled)
            }
            Err(err) => {
                self.state = RunState::Failed;
                warn!(operation, error = %err, "run failed");
                Err(err)
            }
        }
    }

    /// Saves the target and the scope record.
    ///
    /// Own changesets are folded into the opposite cursor so a later run
    /// in the other direction does not replay them.
    fn commit(&mut self, operation: &str, cursor: Option<u64>) -> TransformResult<()> {
        self.core.prune_relationship_provenance()?;
        let description = format!("reposync: {operation}");
        let config = &self.core.config;
        if config.no_provenance {
            self.target.save_changes(&description)?;
            return Ok(());
        }
        let scope = config.target_scope_entity;

        if config.is_reverse_synchronization {
            let (master, branch) = (self.target, self.source);
            let before = master.changeset_index();
            let saved = master.save_changes(&description)?;

            let existing = find_scope_record(branch, scope)?;
            let mut record = existing
                .clone()
                .unwrap_or_else(|| ProvenanceRecord::for_scope(scope, master.id()));
            if let Some(saved) = saved {
                if record.synced_changeset.is_some_and(|synced| synced >= before) {
                    record.synced_changeset = Some(saved);
                }
            }
            if let Some(cursor) = cursor {
                record.reverse_synced_changeset = Some(cursor);
            }
            let pending = branch.changeset_index();
            let saving = branch.has_pending_changes() || existing.as_ref() != Some(&record);
            if saving && record.reverse_synced_changeset.is_some_and(|synced| synced >= pending) {
                record.reverse_synced_changeset = Some(pending + 1);
            }
            write_scope_record(branch, existing.as_ref(), &record)?;
            branch.save_changes(&description)?;
        } else {
            let branch = self.target;
            let existing = find_scope_record(branch, scope)?;
            let mut record = existing
                .clone()
                .unwrap_or_else(|| ProvenanceRecord::for_scope(scope, self.source.id()));
            if let Some(cursor) = cursor {
                record.synced_changeset = Some(cursor);
            }
            let pending = branch.changeset_index();
            let saving = branch.has_pending_changes() || existing.as_ref() != Some(&record);
            if record.reverse_synced_changeset.is_none_or(|synced| synced >= pending) {
                record.reverse_synced_changeset = Some(if saving { pending + 1 } else { pending });
            }
            write_scope_record(branch, existing.as_ref(), &record)?;
            branch.save_changes(&description)?;
        }
        Ok(())
    }
}

fn write_scope_record(
    repo: &dyn Repository,
    existing: Option<&ProvenanceRecord>,
    record: &ProvenanceRecord,
) -> TransformResult<()> {
    match existing {
        Some(existing) if existing == record => {}
        Some(_) => repo.update_facet(&record.to_facet())?,
        None => {
            repo.insert_facet(&record.to_facet(), InsertMode::Allocate)?;
        }
    }
    Ok(())
}
