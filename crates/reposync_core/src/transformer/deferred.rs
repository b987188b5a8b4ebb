//! Records waiting for references to resolve.

use crate::exporter::FacetGroup;
use reposync_repo::{ContainerProps, EntityProps, FacetProps, Id64, PropertyPath, RelationshipProps};
use std::collections::HashMap;

/// Lifecycle of a source entity within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Seen but not yet handled.
    Pending,
    /// Being transformed.
    Exporting,
    /// Waiting for a structural reference.
    Deferred,
    /// Transformed, not yet written.
    Transformed,
    /// Written to the target.
    Imported,
}

/// A record whose structural references could not be resolved yet.
#[derive(Debug, Clone)]
pub(crate) enum DeferredRecord {
    Entity {
        entity: EntityProps,
        dangling: Vec<Id64>,
        missing: Vec<Id64>,
    },
    Container {
        container: ContainerProps,
        missing: Vec<Id64>,
    },
    UniqueFacet {
        facet: FacetProps,
        missing: Vec<Id64>,
    },
    FacetGroup {
        group: FacetGroup,
        missing: Vec<Id64>,
    },
    Relationship {
        relationship: RelationshipProps,
        missing: Vec<Id64>,
    },
}

impl DeferredRecord {
    /// Source identifier of the deferred record.
    pub(crate) fn source_id(&self) -> Id64 {
        match self {
            DeferredRecord::Entity { entity, .. } => entity.id,
            DeferredRecord::Container { container, .. } => container.id,
            DeferredRecord::UniqueFacet { facet, .. } => facet.id,
            DeferredRecord::FacetGroup { group, .. } => group.owner,
            DeferredRecord::Relationship { relationship, .. } => relationship.id,
        }
    }

    /// Source identifiers the record is waiting for.
    pub(crate) fn missing(&self) -> &[Id64] {
        match self {
            DeferredRecord::Entity { missing, .. }
            | DeferredRecord::Container { missing, .. }
            | DeferredRecord::UniqueFacet { missing, .. }
            | DeferredRecord::FacetGroup { missing, .. }
            | DeferredRecord::Relationship { missing, .. } => missing,
        }
    }

    pub(crate) fn is_entity(&self) -> bool {
        matches!(self, DeferredRecord::Entity { .. })
    }
}

/// Kind of target record holding a pending reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReferrerKind {
    Entity,
    Container,
    Facet,
    Relationship,
}

/// A navigation reference written as null until its target is imported.
#[derive(Debug, Clone)]
pub(crate) struct PendingReference {
    pub kind: ReferrerKind,
    /// Source record holding the reference.
    pub referrer_source: Id64,
    /// Target record to patch.
    pub referrer: Id64,
    pub path: PropertyPath,
}

/// Pending references keyed by the source entity they wait for.
#[derive(Debug, Default)]
pub(crate) struct PendingReferences {
    by_referenced: HashMap<Id64, Vec<PendingReference>>,
}

impl PendingReferences {
    pub(crate) fn add(&mut self, referenced: Id64, reference: PendingReference) {
        self.by_referenced.entry(referenced).or_default().push(reference);
    }

    pub(crate) fn take(&mut self, referenced: Id64) -> Vec<PendingReference> {
        self.by_referenced.remove(&referenced).unwrap_or_default()
    }

    /// Drops references held by a target record that no longer exists.
    pub(crate) fn forget_referrer(&mut self, referrer: Id64) {
        for references in self.by_referenced.values_mut() {
            references.retain(|reference| reference.referrer != referrer);
        }
        self.by_referenced.retain(|_, references| !references.is_empty());
    }

    pub(crate) fn len(&self) -> usize {
        self.by_referenced.values().map(Vec::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_referenced.is_empty()
    }

    /// First unresolved reference, as (referrer source, referenced source).
    pub(crate) fn first(&self) -> Option<(Id64, Vec<Id64>)> {
        let mut referenced: Vec<&Id64> = self.by_referenced.keys().collect();
        referenced.sort_unstable();
        let first = **referenced.first()?;
        let referrer = self.by_referenced.get(&first)?.first()?.referrer_source;
        let missing = self
            .by_referenced
            .iter()
            .filter(|(_, references)| references.iter().any(|r| r.referrer_source == referrer))
            .map(|(id, _)| *id)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        Some((referrer, missing))
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.len();
        self.by_referenced.clear();
        count
    }
}
