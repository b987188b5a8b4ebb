//! Error types for transformation runs.

use reposync_repo::{ClassName, Id64, RepoError, RepositoryId, SchemaVersion};
use thiserror::Error;

/// Result type for transformation operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// Errors that can occur while transforming or synchronizing repositories.
#[derive(Error, Debug)]
pub enum TransformError {
    /// A repository call failed.
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    /// The key has no shard in a scoped id table.
    #[error("unsupported id table key: {key}")]
    UnsupportedKey {
        /// The rejected key.
        key: String,
    },

    /// A batcher was created with a size that cannot hold any item.
    #[error("invalid batch size: {size}")]
    InvalidBatchSize {
        /// The rejected size.
        size: usize,
    },

    /// A record references entities that could not be resolved.
    #[error("{referencer} references unresolved entities {missing:?}")]
    DanglingReference {
        /// Source record holding the references.
        referencer: Id64,
        /// Source identifiers that could not be resolved.
        missing: Vec<Id64>,
    },

    /// The target scope is already paired with another repository.
    #[error("scope {scope} is paired with repository {existing}, not {requested}")]
    ScopeConflict {
        /// Scope entity in the provenance repository.
        scope: Id64,
        /// Repository the scope is paired with.
        existing: RepositoryId,
        /// Repository the run tried to pair it with.
        requested: RepositoryId,
    },

    /// A source record is already mapped to a different target record.
    #[error("{kind} {source_id} is mapped to {existing}, cannot remap to {requested}")]
    RemapConflict {
        /// Kind of mapping.
        kind: &'static str,
        /// Source identifier.
        source_id: Id64,
        /// Target it is mapped to.
        existing: Id64,
        /// Target the caller tried to map it to.
        requested: Id64,
    },

    /// Preserving a source identifier would overwrite another source's record.
    #[error("cannot preserve {id}: target record is mapped from source {mapped_from}")]
    IdPreservationConflict {
        /// The identifier to preserve.
        id: Id64,
        /// Source record already mapped to it.
        mapped_from: Id64,
    },

    /// Preserving a source identifier failed because an unrelated record
    /// occupies it.
    #[error("cannot preserve {id}: identifier in use by an unrelated record")]
    IdentifierInUse {
        /// The occupied identifier.
        id: Id64,
    },

    /// The target holds a newer schema than the source.
    #[error("schema {schema}: target version {target} is newer than source version {source_version}")]
    SchemaVersionIncompatible {
        /// Schema name.
        schema: String,
        /// Version in the source.
        source_version: SchemaVersion,
        /// Version in the target.
        target: SchemaVersion,
    },

    /// An updated changeset row changed the class of its record.
    #[error("changeset updates {id} from class {old_class} to {new_class}")]
    ChangesetClassIdentityAnomaly {
        /// The record whose class changed.
        id: Id64,
        /// Class before the change.
        old_class: ClassName,
        /// Class after the change.
        new_class: ClassName,
    },

    /// A record could not be encoded for fingerprinting.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The run was cancelled.
    #[error("transformation cancelled")]
    Cancelled,

    /// Invalid operation.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Error message.
        message: String,
    },
}

impl TransformError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the run stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransformError::Cancelled)
    }
}
