//! # reposync core
//!
//! Entity transformation and synchronization engine.
//!
//! This crate provides:
//! - Sharded identifier tables and size-triggered batching for large
//!   repositories
//! - An exporter that walks a repository fully or by changesets
//! - A remap context pairing source and target identifiers
//! - An importer with per-kind write counters
//! - A transformer that resolves cyclic references, records provenance
//!   and propagates deletions
//! - Fork, forward-sync and reverse-sync policies
//!
//! ## Design Principles
//!
//! - Repositories are only reached through [`reposync_repo::Repository`]
//! - Runs are single-threaded; cancellation is cooperative
//! - Every run commits with a scope record so the next one resumes
//! - Deferral retries are silent; every other failure is a typed error
//!
//! ## Example
//!
//! ```rust
//! use reposync_core::{init_fork, forward_sync, TransformerConfig};
//! use reposync_repo::{ClassName, EntityProps, Id64, InsertMode, MemoryRepository, Repository};
//!
//! let master = MemoryRepository::new();
//! let branch = master.fork();
//! init_fork(&master, &branch, TransformerConfig::new())?;
//!
//! let pump = EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER);
//! master.insert_entity(&pump, InsertMode::Allocate)?;
//! master.save_changes("add pump")?;
//!
//! let stats = forward_sync(&master, &branch, TransformerConfig::new())?;
//! assert_eq!(stats.imported.entities.inserted, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod changes;
mod config;
mod context;
mod error;
mod exporter;
mod facet_strategy;
mod id_table;
mod importer;
mod policy;
mod remap;
mod transformer;

pub use batcher::Batcher;
pub use changes::{ChangeEntry, ChangedIds};
pub use config::{
    ClassChangePolicy, DanglingReferencesBehavior, FacetExportMode, TransformerConfig,
    DEFAULT_FACET_BATCH_SIZE, DEFAULT_PROGRESS_INTERVAL,
};
pub use context::{CancelHandle, TransformContext};
pub use error::{TransformError, TransformResult};
pub use exporter::{DeletedEntity, EntityEvent, ExportFilter, ExportHandler, Exporter, FacetGroup};
pub use facet_strategy::{export_owner_facets, DetachedFacets, FacetExportStrategy, InlineFacets};
pub use id_table::{ScopedIdTable, ShardKey, SHARD_COUNT};
pub use importer::{ImportCounters, Importer, KindCounters};
pub use policy::{forward_sync, init_fork, reverse_sync};
pub use remap::RemapContext;
pub use transformer::{EntityState, RunState, TransformStats, Transformer};
