//! Configuration for transformation runs.

use reposync_repo::Id64;
use serde::{Deserialize, Serialize};

/// Default number of facets loaded per batch in detached facet export.
pub const DEFAULT_FACET_BATCH_SIZE: usize = 1000;

/// Default number of entities between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000;

/// What to do with references that cannot be resolved once a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DanglingReferencesBehavior {
    /// Fail the run with `DanglingReference`.
    #[default]
    Reject,
    /// Null the references, continue, and report the count.
    Ignore,
}

/// How an updated changeset row that changes its record's class is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClassChangePolicy {
    /// Delete the mapped target record and insert it again with the new class.
    #[default]
    DeleteAndInsert,
    /// Fail with `ChangesetClassIdentityAnomaly`.
    Reject,
}

/// How facets are visited during a full export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FacetExportMode {
    /// Facets are exported right after their owner.
    #[default]
    Inline,
    /// Facets are exported per class after all entities, in batches.
    Detached {
        /// Number of facets loaded per batch.
        batch_size: usize,
    },
}

impl FacetExportMode {
    /// Detached export with the default batch size.
    pub fn detached() -> Self {
        FacetExportMode::Detached {
            batch_size: DEFAULT_FACET_BATCH_SIZE,
        }
    }
}

/// Configuration for a [`crate::Transformer`].
///
/// # Example
///
/// ```rust
/// use reposync_core::{DanglingReferencesBehavior, TransformerConfig};
///
/// let config = TransformerConfig::new()
///     .dangling_references(DanglingReferencesBehavior::Ignore)
///     .preserve_entity_ids(true);
/// assert!(config.preserve_entity_ids);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Entity in the provenance repository that scopes provenance records.
    pub target_scope_entity: Id64,
    /// Do not read or write provenance.
    pub no_provenance: bool,
    /// The target is a raw copy of the source; map identically and only
    /// seed provenance.
    pub was_source_copied_to_target: bool,
    /// The source is the branch and the target is the master.
    pub is_reverse_synchronization: bool,
    /// Insert target records with the source identifier.
    pub preserve_entity_ids: bool,
    /// Copy provenance facets found in the source to the target.
    pub include_source_provenance: bool,
    /// Handling of unresolved references.
    pub dangling_references: DanglingReferencesBehavior,
    /// Handling of class-changing updates in changesets.
    pub class_change_policy: ClassChangePolicy,
    /// Facet export strategy for full runs.
    pub facet_export: FacetExportMode,
    /// Match unmapped entities to existing target entities by code.
    pub match_by_code: bool,
    /// Match unmapped entities to existing target entities by federation GUID.
    pub match_by_federation_guid: bool,
    /// Number of entities between progress log lines.
    pub progress_interval: u64,
}

impl TransformerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            target_scope_entity: Id64::ROOT_ENTITY,
            no_provenance: false,
            was_source_copied_to_target: false,
            is_reverse_synchronization: false,
            preserve_entity_ids: false,
            include_source_provenance: false,
            dangling_references: DanglingReferencesBehavior::Reject,
            class_change_policy: ClassChangePolicy::DeleteAndInsert,
            facet_export: FacetExportMode::Inline,
            match_by_code: true,
            match_by_federation_guid: true,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Sets the scope entity.
    #[must_use]
    pub fn target_scope_entity(mut self, scope: Id64) -> Self {
        self.target_scope_entity = scope;
        self
    }

    /// Disables provenance.
    #[must_use]
    pub fn no_provenance(mut self, value: bool) -> Self {
        self.no_provenance = value;
        self
    }

    /// Marks the target as a raw copy of the source.
    #[must_use]
    pub fn was_source_copied_to_target(mut self, value: bool) -> Self {
        self.was_source_copied_to_target = value;
        self
    }

    /// Runs from branch to master.
    #[must_use]
    pub fn reverse_synchronization(mut self, value: bool) -> Self {
        self.is_reverse_synchronization = value;
        self
    }

    /// Preserves source identifiers in the target.
    #[must_use]
    pub fn preserve_entity_ids(mut self, value: bool) -> Self {
        self.preserve_entity_ids = value;
        self
    }

    /// Copies source provenance facets to the target.
    #[must_use]
    pub fn include_source_provenance(mut self, value: bool) -> Self {
        self.include_source_provenance = value;
        self
    }

    /// Sets the dangling reference behavior.
    #[must_use]
    pub fn dangling_references(mut self, behavior: DanglingReferencesBehavior) -> Self {
        self.dangling_references = behavior;
        self
    }

    /// Sets the class change policy.
    #[must_use]
    pub fn class_change_policy(mut self, policy: ClassChangePolicy) -> Self {
        self.class_change_policy = policy;
        self
    }

    /// Sets the facet export mode.
    #[must_use]
    pub fn facet_export(mut self, mode: FacetExportMode) -> Self {
        self.facet_export = mode;
        self
    }

    /// Enables or disables matching by code.
    #[must_use]
    pub fn match_by_code(mut self, value: bool) -> Self {
        self.match_by_code = value;
        self
    }

    /// Enables or disables matching by federation GUID.
    #[must_use]
    pub fn match_by_federation_guid(mut self, value: bool) -> Self {
        self.match_by_federation_guid = value;
        self
    }

    /// Sets the progress interval. Zero disables progress logging.
    #[must_use]
    pub fn progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransformerConfig::default();
        assert_eq!(config.target_scope_entity, Id64::ROOT_ENTITY);
        assert_eq!(config.dangling_references, DanglingReferencesBehavior::Reject);
        assert_eq!(config.class_change_policy, ClassChangePolicy::DeleteAndInsert);
        assert_eq!(config.facet_export, FacetExportMode::Inline);
        assert!(!config.is_reverse_synchronization);
    }

    #[test]
    fn builder() {
        let config = TransformerConfig::new()
            .target_scope_entity(Id64::new(0x40))
            .reverse_synchronization(true)
            .facet_export(FacetExportMode::Detached { batch_size: 3 })
            .progress_interval(0);

        assert_eq!(config.target_scope_entity, Id64::new(0x40));
        assert!(config.is_reverse_synchronization);
        assert_eq!(config.facet_export, FacetExportMode::Detached { batch_size: 3 });
        assert_eq!(config.progress_interval, 0);
    }

    #[test]
    fn detached_default_batch_size() {
        assert_eq!(
            FacetExportMode::detached(),
            FacetExportMode::Detached {
                batch_size: DEFAULT_FACET_BATCH_SIZE
            }
        );
    }
}
