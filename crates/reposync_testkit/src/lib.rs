//! # reposync Testkit
//!
//! Test utilities for reposync.
//!
//! This crate provides:
//! - Sample repositories with containers, codes, facets, relationships
//!   and cyclic references
//! - Label-based snapshots for comparing repositories whose identifiers
//!   differ
//! - Changeset file helpers on temporary directories
//! - Property-based test generators using proptest
//! - Tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust
//! use reposync_testkit::prelude::*;
//!
//! let (repo, ids) = plant_repository(2);
//! assert_eq!(ids.pumps.len(), 2);
//! let snapshot = snapshot(&repo).unwrap();
//! assert!(snapshot["entities"]["pump-0"].is_object());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
