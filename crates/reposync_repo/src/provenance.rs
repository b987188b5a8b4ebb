//! Provenance facets: recorded linkage between a record and its origin.
//!
//! Provenance is stored as ordinary multi facets of class
//! [`PROVENANCE_CLASS`]. A facet records which scope it belongs to, the
//! identifier of the record it was synchronized with, and what kind of
//! record that is. The scope facet, owned by the scope entity itself,
//! records which repository the scope is paired with and how far
//! synchronization has progressed.

use crate::id::{Id64, RepositoryId};
use crate::records::{ClassName, FacetKind, FacetProps};
use crate::value::{PropertyBag, PropertyValue};

/// Class of provenance facets.
pub const PROVENANCE_CLASS: &str = "Core:ExternalSourceAspect";

const PROP_SCOPE: &str = "scope";
const PROP_IDENTIFIER: &str = "identifier";
const PROP_KIND: &str = "kind";
const PROP_VERSION: &str = "version";
const PROP_SOURCE_REPOSITORY: &str = "sourceRepository";
const PROP_TARGET_RELATIONSHIP: &str = "targetRelationship";
const PROP_SYNCED: &str = "syncedChangeset";
const PROP_REVERSE_SYNCED: &str = "reverseSyncedChangeset";

/// Returns true if `class_name` is the provenance facet class.
#[must_use]
pub fn is_provenance_class(class_name: &ClassName) -> bool {
    class_name.as_str() == PROVENANCE_CLASS
}

/// What a provenance facet describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProvenanceKind {
    /// The owner corresponds to an entity in the paired repository.
    Entity,
    /// The facet maps a relationship; the owner is its source entity.
    Relationship,
    /// The owner is a scope entity paired with a repository.
    Scope,
    /// Provenance written by some other tool.
    Other(String),
}

impl ProvenanceKind {
    fn as_str(&self) -> &str {
        match self {
            ProvenanceKind::Entity => "Element",
            ProvenanceKind::Relationship => "Relationship",
            ProvenanceKind::Scope => "Scope",
            ProvenanceKind::Other(kind) => kind,
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "Element" => ProvenanceKind::Entity,
            "Relationship" => ProvenanceKind::Relationship,
            "Scope" => ProvenanceKind::Scope,
            other => ProvenanceKind::Other(other.to_string()),
        }
    }
}

/// Decoded provenance facet.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvenanceRecord {
    /// Facet identifier (invalid until inserted).
    pub facet_id: Id64,
    /// Entity owning the facet.
    pub owner: Id64,
    /// Scope entity the record belongs to.
    pub scope: Id64,
    /// Identifier of the corresponding record in the paired repository.
    pub identifier: String,
    /// What the record describes.
    pub kind: ProvenanceKind,
    /// Content fingerprint of the paired record when last synchronized.
    pub version: Option<String>,
    /// Repository the identifier belongs to.
    pub source_repository: Option<RepositoryId>,
    /// Relationship in the owner's repository, for relationship provenance.
    pub target_relationship: Option<Id64>,
    /// Last changeset synchronized forward (scope facets only).
    pub synced_changeset: Option<u64>,
    /// Last changeset synchronized in reverse (scope facets only).
    pub reverse_synced_changeset: Option<u64>,
}

impl ProvenanceRecord {
    fn base(owner: Id64, scope: Id64, identifier: String, kind: ProvenanceKind) -> Self {
        Self {
            facet_id: Id64::INVALID,
            owner,
            scope,
            identifier,
            kind,
            version: None,
            source_repository: None,
            target_relationship: None,
            synced_changeset: None,
            reverse_synced_changeset: None,
        }
    }

    /// Provenance linking entity `owner` to `paired` in `repository`.
    #[must_use]
    pub fn for_entity(owner: Id64, scope: Id64, paired: Id64, repository: RepositoryId) -> Self {
        let mut record = Self::base(owner, scope, paired.to_hex(), ProvenanceKind::Entity);
        record.source_repository = Some(repository);
        record
    }

    /// Provenance linking relationship `relationship` (owned by its source
    /// entity `owner`) to relationship `paired` in `repository`.
    #[must_use]
    pub fn for_relationship(
        owner: Id64,
        scope: Id64,
        relationship: Id64,
        paired: Id64,
        repository: RepositoryId,
    ) -> Self {
        let mut record = Self::base(owner, scope, paired.to_hex(), ProvenanceKind::Relationship);
        record.source_repository = Some(repository);
        record.target_relationship = Some(relationship);
        record
    }

    /// Scope record pairing `scope_entity` with `repository`.
    #[must_use]
    pub fn for_scope(scope_entity: Id64, repository: RepositoryId) -> Self {
        let mut record = Self::base(
            scope_entity,
            Id64::ROOT_ENTITY,
            repository.to_string(),
            ProvenanceKind::Scope,
        );
        record.source_repository = Some(repository);
        record
    }

    /// Sets the content fingerprint.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The paired identifier, if it is a canonical repository identifier.
    ///
    /// Records written by other provenance sources carry identifiers such
    /// as document keys; those return `None`.
    #[must_use]
    pub fn paired_id(&self) -> Option<Id64> {
        if Id64::is_canonical_hex(&self.identifier) {
            Id64::from_hex(&self.identifier)
        } else {
            None
        }
    }

    /// Encodes the record as a facet.
    #[must_use]
    pub fn to_facet(&self) -> FacetProps {
        let mut properties = PropertyBag::new();
        properties.insert(PROP_SCOPE.into(), PropertyValue::navigation(self.scope));
        properties.insert(PROP_IDENTIFIER.into(), PropertyValue::text(&self.identifier));
        properties.insert(PROP_KIND.into(), PropertyValue::text(self.kind.as_str()));
        if let Some(version) = &self.version {
            properties.insert(PROP_VERSION.into(), PropertyValue::text(version));
        }
        if let Some(repository) = &self.source_repository {
            properties.insert(
                PROP_SOURCE_REPOSITORY.into(),
                PropertyValue::text(repository.to_string()),
            );
        }
        if let Some(relationship) = self.target_relationship {
            properties.insert(
                PROP_TARGET_RELATIONSHIP.into(),
                PropertyValue::text(relationship.to_hex()),
            );
        }
        if let Some(index) = self.synced_changeset {
            properties.insert(PROP_SYNCED.into(), PropertyValue::Integer(index as i64));
        }
        if let Some(index) = self.reverse_synced_changeset {
            properties.insert(PROP_REVERSE_SYNCED.into(), PropertyValue::Integer(index as i64));
        }

        FacetProps {
            id: self.facet_id,
            class_name: ClassName::new(PROVENANCE_CLASS),
            kind: FacetKind::Multi,
            owner: self.owner,
            properties,
        }
    }

    /// Decodes a provenance facet.
    ///
    /// Returns `None` for facets of another class or with missing
    /// required properties.
    #[must_use]
    pub fn from_facet(facet: &FacetProps) -> Option<Self> {
        if !is_provenance_class(&facet.class_name) {
            return None;
        }
        let props = &facet.properties;
        let scope = props.get(PROP_SCOPE)?.as_navigation()?.id;
        let identifier = props.get(PROP_IDENTIFIER)?.as_text()?.to_string();
        let kind = ProvenanceKind::parse(props.get(PROP_KIND)?.as_text()?);

        let text = |name: &str| props.get(name).and_then(PropertyValue::as_text);
        let index = |name: &str| {
            props
                .get(name)
                .and_then(PropertyValue::as_integer)
                .and_then(|value| u64::try_from(value).ok())
        };

        Some(Self {
            facet_id: facet.id,
            owner: facet.owner,
            scope,
            identifier,
            kind,
            version: text(PROP_VERSION).map(str::to_string),
            source_repository: text(PROP_SOURCE_REPOSITORY).and_then(RepositoryId::parse),
            target_relationship: text(PROP_TARGET_RELATIONSHIP).and_then(Id64::from_hex),
            synced_changeset: index(PROP_SYNCED),
            reverse_synced_changeset: index(PROP_REVERSE_SYNCED),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_record_roundtrip() {
        let repository = RepositoryId::new();
        let record = ProvenanceRecord::for_entity(
            Id64::new(0x40),
            Id64::ROOT_ENTITY,
            Id64::new(0x2a),
            repository,
        )
        .with_version("abc");

        let facet = record.to_facet();
        assert_eq!(facet.owner, Id64::new(0x40));
        assert_eq!(facet.kind, FacetKind::Multi);

        let decoded = ProvenanceRecord::from_facet(&facet).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.paired_id(), Some(Id64::new(0x2a)));
    }

    #[test]
    fn scope_record_keeps_sync_indices() {
        let mut record = ProvenanceRecord::for_scope(Id64::ROOT_ENTITY, RepositoryId::new());
        record.synced_changeset = Some(7);
        record.reverse_synced_changeset = Some(2);

        let decoded = ProvenanceRecord::from_facet(&record.to_facet()).unwrap();
        assert_eq!(decoded.kind, ProvenanceKind::Scope);
        assert_eq!(decoded.synced_changeset, Some(7));
        assert_eq!(decoded.reverse_synced_changeset, Some(2));
        assert_eq!(decoded.paired_id(), None);
    }

    #[test]
    fn foreign_provenance_has_no_paired_id() {
        let mut record = ProvenanceRecord::for_entity(
            Id64::new(0x40),
            Id64::ROOT_ENTITY,
            Id64::new(0x2a),
            RepositoryId::new(),
        );
        record.identifier = "doc-17/sheet-2".into();
        record.kind = ProvenanceKind::Other("Document".into());

        let decoded = ProvenanceRecord::from_facet(&record.to_facet()).unwrap();
        assert_eq!(decoded.kind, ProvenanceKind::Other("Document".into()));
        assert_eq!(decoded.paired_id(), None);
    }

    #[test]
    fn other_classes_are_not_provenance() {
        let facet =
            FacetProps::new(ClassName::new("Plant:Inspection"), FacetKind::Multi, Id64::new(0x20));
        assert!(ProvenanceRecord::from_facet(&facet).is_none());
    }
}
