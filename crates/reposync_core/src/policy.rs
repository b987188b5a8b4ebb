//! Fork and synchronization policies.
//!
//! A branch starts as a raw copy of its master. [`init_fork`] seeds the
//! provenance that pairs the two without moving data; afterwards
//! [`forward_sync`] carries master changesets to the branch and
//! [`reverse_sync`] carries branch changesets, deletions included, back to
//! the master. Both resume after the changesets recorded in the branch's
//! scope record.

use crate::config::TransformerConfig;
use crate::error::TransformResult;
use crate::transformer::{TransformStats, Transformer};
use reposync_repo::Repository;
use tracing::info;

/// Seeds provenance in `branch`, a raw copy of `master`.
///
/// Every master entity is mapped to the branch entity with the same
/// identifier. The branch cursors are set so that later synchronizations
/// start after the fork.
pub fn init_fork(
    master: &dyn Repository,
    branch: &dyn Repository,
    config: TransformerConfig,
) -> TransformResult<TransformStats> {
    let config = config
        .was_source_copied_to_target(true)
        .reverse_synchronization(false)
        .no_provenance(false);
    info!(master = %master.id(), branch = %branch.id(), "initializing fork");
    let mut transformer = Transformer::new(master, branch, config)?;
    let stats = transformer.process()?;
    transformer.dispose();
    Ok(stats)
}

/// Applies master changesets not yet synchronized to `branch`.
pub fn forward_sync(
    master: &dyn Repository,
    branch: &dyn Repository,
    config: TransformerConfig,
) -> TransformResult<TransformStats> {
    let config = config
        .was_source_copied_to_target(false)
        .reverse_synchronization(false)
        .no_provenance(false);
    let mut transformer = Transformer::new(master, branch, config)?;
    let stats = transformer.process_changes(None)?;
    transformer.dispose();
    Ok(stats)
}

/// Applies branch changesets not yet synchronized back to `master`.
pub fn reverse_sync(
    branch: &dyn Repository,
    master: &dyn Repository,
    config: TransformerConfig,
) -> TransformResult<TransformStats> {
    let config = config
        .was_source_copied_to_target(false)
        .reverse_synchronization(true)
        .no_provenance(false);
    let mut transformer = Transformer::new(branch, master, config)?;
    let stats = transformer.process_changes(None)?;
    transformer.dispose();
    Ok(stats)
}
