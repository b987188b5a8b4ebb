//! In-memory index of the provenance facets of one scope.

use crate::error::TransformResult;
use crate::id_table::ScopedIdTable;
use reposync_repo::{
    ClassName, Id64, IdQuery, ProvenanceKind, ProvenanceRecord, RepoResult, Repository,
    PROVENANCE_CLASS,
};
use std::collections::HashMap;
use tracing::debug;

/// One indexed provenance facet.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexEntry {
    /// The provenance facet in the provenance repository.
    pub facet_id: Id64,
    /// Entity owning the facet.
    pub owner: Id64,
    /// Target-side identifier paired with the key.
    pub target: Id64,
    /// Content fingerprint, when recorded.
    pub version: Option<String>,
}

/// Provenance of one scope, keyed by source identifiers.
///
/// In a forward run the facets live in the target: the key is the paired
/// source identifier and the entry target is the owner. In a reverse run
/// they live in the source: the key is the owner and the entry target is
/// the paired identifier. Facets written by other tools, whose identifiers
/// are not canonical repository identifiers, are not indexed.
#[derive(Debug, Default)]
pub(crate) struct ProvenanceIndex {
    entities: ScopedIdTable<Id64, IndexEntry>,
    relationships: HashMap<Id64, IndexEntry>,
    foreign: usize,
}

impl ProvenanceIndex {
    /// Reads every provenance facet of `scope` from `repo`.
    pub(crate) fn load(repo: &dyn Repository, scope: Id64, reverse: bool) -> TransformResult<Self> {
        let mut index = Self::default();
        let query = IdQuery::facets().of_class(ClassName::new(PROVENANCE_CLASS));
        for id in repo.enumerate_ids(&query)? {
            let facet = repo.get_facet(id)?;
            let Some(record) = facet.as_ref().and_then(ProvenanceRecord::from_facet) else {
                continue;
            };
            if record.scope != scope {
                continue;
            }
            let Some(paired) = record.paired_id() else {
                if record.kind != ProvenanceKind::Scope {
                    index.foreign += 1;
                }
                continue;
            };
            match record.kind {
                ProvenanceKind::Entity => {
                    let (key, target) = if reverse {
                        (record.owner, paired)
                    } else {
                        (paired, record.owner)
                    };
                    index.insert_entity(key, entry(&record, target))?;
                }
                ProvenanceKind::Relationship => {
                    let Some(local) = record.target_relationship else {
                        continue;
                    };
                    let (key, target) = if reverse { (local, paired) } else { (paired, local) };
                    index.relationships.insert(key, entry(&record, target));
                }
                ProvenanceKind::Scope | ProvenanceKind::Other(_) => index.foreign += 1,
            }
        }
        debug!(
            entities = index.entities.len(),
            relationships = index.relationships.len(),
            foreign = index.foreign,
            "loaded provenance index"
        );
        Ok(index)
    }

    pub(crate) fn entity(&self, source: Id64) -> Option<&IndexEntry> {
        self.entities.get(&source)
    }

    pub(crate) fn insert_entity(&mut self, source: Id64, entry: IndexEntry) -> TransformResult<()> {
        self.entities.set(source, entry)?;
        Ok(())
    }

    pub(crate) fn remove_entity(&mut self, source: Id64) -> Option<IndexEntry> {
        self.entities.delete(&source)
    }

    /// Source identifiers and entries of every indexed entity.
    pub(crate) fn entities(&self) -> impl Iterator<Item = (&Id64, &IndexEntry)> {
        self.entities.iter()
    }

    pub(crate) fn relationship(&self, source: Id64) -> Option<&IndexEntry> {
        self.relationships.get(&source)
    }

    pub(crate) fn insert_relationship(&mut self, source: Id64, entry: IndexEntry) {
        self.relationships.insert(source, entry);
    }

    pub(crate) fn remove_relationship(&mut self, source: Id64) -> Option<IndexEntry> {
        self.relationships.remove(&source)
    }

    pub(crate) fn relationships(&self) -> impl Iterator<Item = (&Id64, &IndexEntry)> {
        self.relationships.iter()
    }

    /// Number of indexed entity and relationship facets.
    pub(crate) fn len(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }
}

fn entry(record: &ProvenanceRecord, target: Id64) -> IndexEntry {
    IndexEntry {
        facet_id: record.facet_id,
        owner: record.owner,
        target,
        version: record.version.clone(),
    }
}

/// Finds the scope record owned by `scope` in `repo`.
pub(crate) fn find_scope_record(
    repo: &dyn Repository,
    scope: Id64,
) -> RepoResult<Option<ProvenanceRecord>> {
    let class_name = ClassName::new(PROVENANCE_CLASS);
    Ok(repo
        .get_facets(scope, Some(&class_name))?
        .iter()
        .filter_map(ProvenanceRecord::from_facet)
        .find(|record| record.kind == ProvenanceKind::Scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposync_repo::{EntityProps, InsertMode, MemoryRepository, RepositoryId};

    #[test]
    fn forward_and_reverse_keys() {
        let repo = MemoryRepository::new();
        let owner = repo
            .insert_entity(
                &EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER),
                InsertMode::Allocate,
            )
            .unwrap();
        let master = RepositoryId::new();
        let record = ProvenanceRecord::for_entity(owner, Id64::ROOT_ENTITY, Id64::new(0x77), master)
            .with_version("v1");
        repo.insert_facet(&record.to_facet(), InsertMode::Allocate).unwrap();

        let mut foreign =
            ProvenanceRecord::for_entity(owner, Id64::ROOT_ENTITY, Id64::new(0x78), master);
        foreign.identifier = "sheet-4".into();
        repo.insert_facet(&foreign.to_facet(), InsertMode::Allocate).unwrap();

        let forward = ProvenanceIndex::load(&repo, Id64::ROOT_ENTITY, false).unwrap();
        let entry = forward.entity(Id64::new(0x77)).unwrap();
        assert_eq!(entry.target, owner);
        assert_eq!(entry.version.as_deref(), Some("v1"));
        assert_eq!(forward.len(), 1);

        let reverse = ProvenanceIndex::load(&repo, Id64::ROOT_ENTITY, true).unwrap();
        assert_eq!(reverse.entity(owner).unwrap().target, Id64::new(0x77));

        let other_scope = ProvenanceIndex::load(&repo, Id64::DICTIONARY, false).unwrap();
        assert_eq!(other_scope.len(), 0);
    }

    #[test]
    fn scope_record_lookup() {
        let repo = MemoryRepository::new();
        assert!(find_scope_record(&repo, Id64::ROOT_ENTITY).unwrap().is_none());
        let master = RepositoryId::new();
        let scope_record = ProvenanceRecord::for_scope(Id64::ROOT_ENTITY, master);
        repo.insert_facet(&scope_record.to_facet(), InsertMode::Allocate).unwrap();
        let record = find_scope_record(&repo, Id64::ROOT_ENTITY).unwrap().unwrap();
        assert_eq!(record.source_repository, Some(master));
    }
}
