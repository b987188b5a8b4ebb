//! Error types for repository operations.

use crate::id::Id64;
use std::io;
use thiserror::Error;

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors reported by a repository implementation.
#[derive(Debug, Error)]
pub enum RepoError {
    /// An I/O error occurred while reading or writing a changeset file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A changeset file could not be encoded or decoded.
    #[error("changeset codec error: {0}")]
    ChangesetCodec(String),

    /// Entity not found.
    #[error("entity not found: {id}")]
    EntityNotFound {
        /// The missing entity.
        id: Id64,
    },

    /// Container not found.
    #[error("container not found: {id}")]
    ContainerNotFound {
        /// The missing container.
        id: Id64,
    },

    /// Relationship not found.
    #[error("relationship not found: {id}")]
    RelationshipNotFound {
        /// The missing relationship.
        id: Id64,
    },

    /// Facet not found.
    #[error("facet not found: {id}")]
    FacetNotFound {
        /// The missing facet.
        id: Id64,
    },

    /// Code specification not found.
    #[error("code spec not found: {id}")]
    CodeSpecNotFound {
        /// The missing code spec.
        id: Id64,
    },

    /// The identifier is already occupied by another record.
    #[error("identifier already in use: {id}")]
    IdentifierInUse {
        /// The occupied identifier.
        id: Id64,
    },

    /// A non-empty code is already used within its spec and scope.
    #[error("duplicate code '{value}' (spec {spec}, scope {scope}) already used by {existing}")]
    DuplicateCode {
        /// Code spec of the conflicting code.
        spec: Id64,
        /// Code scope of the conflicting code.
        scope: Id64,
        /// Code value.
        value: String,
        /// Entity that already carries the code.
        existing: Id64,
    },

    /// The owner already has a unique facet of this class.
    #[error("entity {owner} already has a unique facet of class {class_name}")]
    DuplicateUniqueFacet {
        /// The owning entity.
        owner: Id64,
        /// The facet class.
        class_name: String,
    },

    /// A schema references another schema that is neither present nor
    /// earlier in the same import batch.
    #[error("schema {schema} references missing schema {reference}")]
    SchemaReferenceMissing {
        /// Schema being imported.
        schema: String,
        /// The unresolved reference.
        reference: String,
    },

    /// Requested changesets are outside the recorded history.
    #[error("changeset range {first}..={last} is not available (history has {available})")]
    ChangesetUnavailable {
        /// First requested index.
        first: u64,
        /// Last requested index.
        last: u64,
        /// Number of changesets in the history.
        available: u64,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl RepoError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a changeset codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::ChangesetCodec(message.into())
    }

    /// Returns true if the error reports a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RepoError::EntityNotFound { .. }
                | RepoError::ContainerNotFound { .. }
                | RepoError::RelationshipNotFound { .. }
                | RepoError::FacetNotFound { .. }
                | RepoError::CodeSpecNotFound { .. }
        )
    }
}
