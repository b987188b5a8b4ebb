//! Integration tests for forks and synchronization in both directions.

use reposync_core::{
    forward_sync, init_fork, reverse_sync, TransformError, Transformer, TransformerConfig,
};
use reposync_repo::{ChangesetRange, MemoryRepository, PropertyValue, Repository};
use reposync_testkit::prelude::*;

/// A master with a plant and a spare element, and its initialized fork.
fn forked_plant() -> (MemoryRepository, MemoryRepository, PlantIds) {
    let (master, ids) = plant_repository(2);
    insert_element(&master, "spare").unwrap();
    master.save_changes("spare").unwrap();
    let branch = master.fork();
    init_fork(&master, &branch, TransformerConfig::new()).unwrap();
    (master, branch, ids)
}

#[test]
fn fork_initialization_only_records_provenance() {
    init_tracing();
    let (master, ids) = plant_repository(2);
    let branch = master.fork();

    let stats = init_fork(&master, &branch, TransformerConfig::new()).unwrap();

    assert_eq!(stats.imported.total_writes(), 0);
    assert!(stats.provenance_writes > 0);
    assert_eq!(snapshot(&branch).unwrap(), snapshot(&master).unwrap());
    // identity mapping of the raw copy
    let pump = find_by_label(&branch, "pump-0").unwrap();
    assert_eq!(pump, Some(ids.pumps[0]));
}

#[test]
fn forward_sync_carries_master_changes() {
    let (master, branch, ids) = forked_plant();

    set_property(&master, ids.pumps[0], "rating", PropertyValue::Integer(55)).unwrap();
    insert_element(&master, "extra").unwrap();
    master.save_changes("edit master").unwrap();

    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();

    assert_eq!(stats.imported.entities.inserted, 1);
    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(snapshot(&branch).unwrap(), snapshot(&master).unwrap());
}

#[test]
fn repeated_forward_sync_is_idle() {
    let (master, branch, ids) = forked_plant();
    set_property(&master, ids.valves[1], "open", PropertyValue::Bool(true)).unwrap();
    master.save_changes("open valve").unwrap();
    forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    let index = branch.changeset_index();

    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();

    assert_eq!(stats.imported.total_writes(), 0);
    assert_eq!(stats.exported_entities, 0);
    assert_eq!(branch.changeset_index(), index);
}

#[test]
fn forward_sync_propagates_deletions() {
    let (master, branch, ids) = forked_plant();

    master.delete_entity(ids.pumps[1]).unwrap();
    master.save_changes("remove pump").unwrap();

    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();

    assert_eq!(stats.imported.entities.deleted, 1);
    assert_eq!(find_by_label(&branch, "pump-1").unwrap(), None);
    assert_eq!(branch.relationship_count(), 1);
    assert!(find_by_label(&branch, "valve-1").unwrap().is_some());
}

#[test]
fn reverse_sync_carries_branch_changes() {
    let (master, branch, ids) = forked_plant();

    let spare = find_by_label(&branch, "spare").unwrap().unwrap();
    branch.delete_entity(spare).unwrap();
    set_property(&branch, ids.pumps[0], "rating", PropertyValue::Integer(7)).unwrap();
    insert_element(&branch, "branch-only").unwrap();
    branch.save_changes("edit branch").unwrap();

    let stats = reverse_sync(&branch, &master, TransformerConfig::new()).unwrap();

    assert_eq!(stats.imported.entities.inserted, 1);
    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(stats.imported.entities.deleted, 1);
    assert_eq!(find_by_label(&master, "spare").unwrap(), None);
    assert_eq!(snapshot(&master).unwrap(), snapshot(&branch).unwrap());
}

#[test]
fn reverse_sync_does_not_echo_back() {
    let (master, branch, _) = forked_plant();
    insert_element(&branch, "branch-only").unwrap();
    branch.save_changes("edit branch").unwrap();
    reverse_sync(&branch, &master, TransformerConfig::new()).unwrap();
    let master_index = master.changeset_index();

    let forward = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    let reverse = reverse_sync(&branch, &master, TransformerConfig::new()).unwrap();

    assert_eq!(forward.imported.total_writes(), 0);
    assert_eq!(reverse.imported.total_writes(), 0);
    assert_eq!(master.changeset_index(), master_index);
    assert_eq!(snapshot(&master).unwrap(), snapshot(&branch).unwrap());
}

#[test]
fn changes_flow_both_ways() {
    let (master, branch, ids) = forked_plant();

    set_property(&master, ids.pumps[1], "rating", PropertyValue::Integer(1)).unwrap();
    master.save_changes("master edit").unwrap();
    set_property(&branch, ids.valves[0], "open", PropertyValue::Bool(false)).unwrap();
    branch.save_changes("branch edit").unwrap();

    forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    reverse_sync(&branch, &master, TransformerConfig::new()).unwrap();

    assert_eq!(snapshot(&master).unwrap(), snapshot(&branch).unwrap());
}

#[test]
fn other_master_conflicts_with_scope() {
    let (_master, branch, _) = forked_plant();
    let (stranger, _) = plant_repository(1);

    let result = forward_sync(&stranger, &branch, TransformerConfig::new());

    assert!(matches!(result, Err(TransformError::ScopeConflict { .. })));
}

#[test]
fn explicit_range_is_applied() {
    let (master, branch, ids) = forked_plant();
    set_property(&master, ids.pumps[0], "rating", PropertyValue::Integer(1)).unwrap();
    let first = master.save_changes("first").unwrap().unwrap();
    set_property(&master, ids.pumps[1], "rating", PropertyValue::Integer(2)).unwrap();
    master.save_changes("second").unwrap();

    let config = TransformerConfig::new();
    let mut transformer = Transformer::new(&master, &branch, config).unwrap();
    let stats = transformer
        .process_changes(Some(ChangesetRange::single(first)))
        .unwrap();
    assert_eq!(stats.imported.entities.updated, 1);

    // the second changeset is still ahead of the cursor
    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(snapshot(&branch).unwrap(), snapshot(&master).unwrap());
}

#[test]
fn changeset_files_drive_a_run() {
    let (master, branch, ids) = forked_plant();
    let start = master.changeset_index() + 1;
    set_property(&master, ids.valves[0], "open", PropertyValue::Bool(true)).unwrap();
    master.save_changes("open").unwrap();
    insert_element(&master, "from-file").unwrap();
    master.save_changes("insert").unwrap();

    let dir = ChangesetDir::new();
    let paths = dir
        .export(&master, ChangesetRange::new(start, master.changeset_index()))
        .unwrap();
    let changesets = dir.load(&paths).unwrap();
    assert_eq!(changesets.len(), 2);

    let mut transformer = Transformer::new(&master, &branch, TransformerConfig::new()).unwrap();
    let stats = transformer.process_changesets(&changesets).unwrap();
    assert_eq!(stats.imported.entities.inserted, 1);
    assert_eq!(snapshot(&branch).unwrap(), snapshot(&master).unwrap());

    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    assert_eq!(stats.imported.total_writes(), 0);
}

#[test]
fn cancelled_sync_resumes() {
    let (master, branch, _) = forked_plant();
    insert_element(&master, "late").unwrap();
    master.save_changes("late").unwrap();

    let config = TransformerConfig::new();
    let mut transformer = Transformer::new(&master, &branch, config).unwrap();
    transformer.cancel_handle().cancel();
    assert!(transformer.process_changes(None).unwrap_err().is_cancelled());
    drop(transformer);

    let stats = forward_sync(&master, &branch, TransformerConfig::new()).unwrap();
    assert_eq!(stats.imported.entities.inserted, 1);
    assert_eq!(snapshot(&branch).unwrap(), snapshot(&master).unwrap());
}
