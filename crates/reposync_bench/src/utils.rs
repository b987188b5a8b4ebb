//! Benchmark utilities.

use rand::Rng;
use reposync_repo::{
    ClassName, EntityProps, FacetKind, FacetProps, Id64, InsertMode, MemoryRepository,
    PropertyValue, RepoResult, Repository,
};

/// Generate `count` random user identifiers.
pub fn random_ids(count: usize) -> Vec<Id64> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| Id64::new(rng.gen_range(Id64::FIRST_USER_ID..u64::MAX)))
        .collect()
}

/// Generate a repository with `count` elements.
///
/// Each element references a random earlier or later element, so about
/// half of the references point forward and force deferral, and carries
/// `facets` multi facets.
pub fn populated_repository(count: usize, facets: usize) -> RepoResult<MemoryRepository> {
    let repo = MemoryRepository::new();
    let mut rng = rand::thread_rng();
    let ids = (0..count)
        .map(|i| {
            repo.insert_entity(
                &EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER)
                    .with_label(format!("element-{i}")),
                InsertMode::Allocate,
            )
        })
        .collect::<RepoResult<Vec<_>>>()?;
    for &id in &ids {
        let other = ids[rng.gen_range(0..ids.len())];
        if let Some(mut entity) = repo.get_entity(id)? {
            entity
                .properties
                .insert("peer".to_string(), PropertyValue::navigation(other));
            repo.update_entity(&entity)?;
        }
        for n in 0..facets {
            repo.insert_facet(
                &FacetProps::new(ClassName::new("Core:Note"), FacetKind::Multi, id)
                    .with_property("n", PropertyValue::Integer(n as i64)),
                InsertMode::Allocate,
            )?;
        }
    }
    repo.save_changes("populate")?;
    Ok(repo)
}
