//! Consolidation of changesets into per-record net changes.

use reposync_repo::{
    is_provenance_class, ChangeOp, Changeset, ChangesetRow, EntityProps, FacetKind, FacetProps,
    Id64, ProvenanceRecord, RowImage, TableKind,
};
use std::collections::{BTreeMap, HashMap};

/// Net change of one record across a sequence of changesets.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Consolidated operation.
    pub op: ChangeOp,
    /// Image before the first change.
    pub old: Option<RowImage>,
    /// Image after the last change.
    pub new: Option<RowImage>,
}

impl ChangeEntry {
    /// Returns true for an update whose class differs between old and new.
    pub fn class_changed(&self) -> bool {
        if self.op != ChangeOp::Updated {
            return false;
        }
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => old.class_name() != new.class_name(),
            _ => false,
        }
    }

    /// Entity image before the change, for entity entries.
    pub fn old_entity(&self) -> Option<&EntityProps> {
        match &self.old {
            Some(RowImage::Entity(props)) => Some(props),
            _ => None,
        }
    }

    /// Facet image before the change, for facet entries.
    pub fn old_facet(&self) -> Option<&FacetProps> {
        match &self.old {
            Some(RowImage::Facet(props)) => Some(props),
            _ => None,
        }
    }

    fn current_facet(&self) -> Option<&FacetProps> {
        match self.new.as_ref().or(self.old.as_ref()) {
            Some(RowImage::Facet(props)) => Some(props),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RowHistory {
    first_op: ChangeOp,
    last_op: ChangeOp,
    old: Option<RowImage>,
    new: Option<RowImage>,
}

impl RowHistory {
    fn consolidate(self) -> Option<ChangeEntry> {
        let op = match (self.first_op, self.last_op) {
            (ChangeOp::Inserted, ChangeOp::Deleted) => return None,
            (ChangeOp::Inserted, _) => ChangeOp::Inserted,
            (_, ChangeOp::Deleted) => ChangeOp::Deleted,
            _ => ChangeOp::Updated,
        };
        let (old, new) = match op {
            ChangeOp::Inserted => (None, self.new),
            ChangeOp::Deleted => (self.old, None),
            ChangeOp::Updated => (self.old, self.new),
        };
        Some(ChangeEntry { op, old, new })
    }
}

/// Changed record identifiers per table, derived from changesets.
///
/// Each identifier appears once with its net change: a record inserted and
/// later deleted within the range does not appear at all.
#[derive(Debug, Clone, Default)]
pub struct ChangedIds {
    /// Entity changes.
    pub entities: BTreeMap<Id64, ChangeEntry>,
    /// Container changes.
    pub containers: BTreeMap<Id64, ChangeEntry>,
    /// Relationship changes.
    pub relationships: BTreeMap<Id64, ChangeEntry>,
    /// Facet changes.
    pub facets: BTreeMap<Id64, ChangeEntry>,
    /// Code spec changes.
    pub code_specs: BTreeMap<Id64, ChangeEntry>,
}

impl ChangedIds {
    /// Consolidates `changesets`, which must be in history order.
    pub fn from_changesets(changesets: &[Changeset]) -> Self {
        let mut histories: BTreeMap<(TableKind, Id64), RowHistory> = BTreeMap::new();
        for row in changesets.iter().flat_map(|changeset| changeset.rows.iter()) {
            let Some(table) = row.table() else {
                continue;
            };
            record(&mut histories, table, row);
        }

        let mut changed = Self::default();
        for ((table, id), history) in histories {
            let Some(entry) = history.consolidate() else {
                continue;
            };
            let target = match table {
                TableKind::Entity => &mut changed.entities,
                TableKind::Container => &mut changed.containers,
                TableKind::Relationship => &mut changed.relationships,
                TableKind::Facet => &mut changed.facets,
                TableKind::CodeSpec => &mut changed.code_specs,
            };
            target.insert(id, entry);
        }
        changed
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.containers.is_empty()
            && self.relationships.is_empty()
            && self.facets.is_empty()
            && self.code_specs.is_empty()
    }

    /// Total number of changed records.
    pub fn len(&self) -> usize {
        self.entities.len()
            + self.containers.len()
            + self.relationships.len()
            + self.facets.len()
            + self.code_specs.len()
    }

    /// Owners of inserted or updated facets, excluding provenance facets.
    pub fn facet_owners(&self) -> Vec<Id64> {
        let mut owners: Vec<Id64> = self
            .facets
            .values()
            .filter(|entry| entry.op != ChangeOp::Deleted)
            .filter_map(ChangeEntry::current_facet)
            .filter(|facet| !is_provenance_class(&facet.class_name))
            .map(|facet| facet.owner)
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Deleted non-provenance facets. Multi facets are included so their
    /// owners can be re-exported.
    pub fn deleted_facets(&self) -> impl Iterator<Item = &FacetProps> {
        self.facets
            .values()
            .filter(|entry| entry.op == ChangeOp::Deleted)
            .filter_map(ChangeEntry::old_facet)
            .filter(|facet| !is_provenance_class(&facet.class_name))
    }

    /// Deleted unique facets, excluding provenance facets.
    pub fn deleted_unique_facets(&self) -> impl Iterator<Item = &FacetProps> {
        self.deleted_facets()
            .filter(|facet| facet.kind == FacetKind::Unique)
    }

    /// Provenance records whose facets were deleted, keyed by owner.
    ///
    /// A deleted entity takes its provenance with it; the old row image is
    /// the only remaining link to its paired record.
    pub fn deleted_provenance(&self) -> HashMap<Id64, Vec<ProvenanceRecord>> {
        let mut by_owner: HashMap<Id64, Vec<ProvenanceRecord>> = HashMap::new();
        for facet in self
            .facets
            .values()
            .filter(|entry| entry.op == ChangeOp::Deleted)
            .filter_map(ChangeEntry::old_facet)
        {
            if let Some(record) = ProvenanceRecord::from_facet(facet) {
                by_owner.entry(facet.owner).or_default().push(record);
            }
        }
        by_owner
    }
}

fn record(
    histories: &mut BTreeMap<(TableKind, Id64), RowHistory>,
    table: TableKind,
    row: &ChangesetRow,
) {
    let key = (table, row.id());
    match histories.get_mut(&key) {
        Some(history) => {
            history.last_op = row.op;
            history.new = row.new.clone();
        }
        None => {
            histories.insert(
                key,
                RowHistory {
                    first_op: row.op,
                    last_op: row.op,
                    old: row.old.clone(),
                    new: row.new.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposync_repo::{ClassName, RepositoryId};

    fn entity(id: u64, class: &str) -> RowImage {
        let mut props = EntityProps::new(ClassName::new(class), Id64::ROOT_CONTAINER);
        props.id = Id64::new(id);
        RowImage::Entity(props)
    }

    fn changeset(index: u64, rows: Vec<ChangesetRow>) -> Changeset {
        let mut cs = Changeset::new(index, RepositoryId::new(), "test");
        cs.rows = rows;
        cs
    }

    #[test]
    fn insert_then_delete_vanishes() {
        let changes = ChangedIds::from_changesets(&[
            changeset(1, vec![ChangesetRow::inserted(entity(0x20, "Plant:Pump"))]),
            changeset(2, vec![ChangesetRow::deleted(entity(0x20, "Plant:Pump"))]),
        ]);
        assert!(changes.is_empty());
    }

    #[test]
    fn insert_then_update_is_insert() {
        let changes = ChangedIds::from_changesets(&[changeset(
            1,
            vec![
                ChangesetRow::inserted(entity(0x20, "Plant:Pump")),
                ChangesetRow::updated(entity(0x20, "Plant:Pump"), entity(0x20, "Plant:Pump")),
            ],
        )]);
        let entry = &changes.entities[&Id64::new(0x20)];
        assert_eq!(entry.op, ChangeOp::Inserted);
        assert!(entry.old.is_none());
    }

    #[test]
    fn update_then_delete_is_delete_with_first_image() {
        let changes = ChangedIds::from_changesets(&[changeset(
            1,
            vec![
                ChangesetRow::updated(entity(0x21, "Plant:Pump"), entity(0x21, "Plant:Valve")),
                ChangesetRow::deleted(entity(0x21, "Plant:Valve")),
            ],
        )]);
        let entry = &changes.entities[&Id64::new(0x21)];
        assert_eq!(entry.op, ChangeOp::Deleted);
        assert_eq!(entry.old_entity().unwrap().class_name.as_str(), "Plant:Pump");
        assert!(!entry.class_changed());
    }

    #[test]
    fn class_change_detected() {
        let changes = ChangedIds::from_changesets(&[changeset(
            1,
            vec![ChangesetRow::updated(entity(0x22, "Plant:Pump"), entity(0x22, "Plant:Valve"))],
        )]);
        assert!(changes.entities[&Id64::new(0x22)].class_changed());
    }

    #[test]
    fn deleted_provenance_is_recovered() {
        let mut record = ProvenanceRecord::for_entity(
            Id64::new(0x30),
            Id64::ROOT_ENTITY,
            Id64::new(0x44),
            RepositoryId::new(),
        );
        record.facet_id = Id64::new(0x31);
        let changes = ChangedIds::from_changesets(&[changeset(
            1,
            vec![
                ChangesetRow::deleted(RowImage::Facet(record.to_facet())),
                ChangesetRow::deleted(entity(0x30, "Plant:Pump")),
            ],
        )]);

        let deleted = changes.deleted_provenance();
        assert_eq!(deleted[&Id64::new(0x30)][0].paired_id(), Some(Id64::new(0x44)));
        assert_eq!(changes.deleted_facets().count(), 0);
        assert!(changes.facet_owners().is_empty());
    }
}
