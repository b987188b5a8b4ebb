//! Integration tests for one-directional transformation runs.

use proptest::prelude::*;
use reposync_core::{
    ClassChangePolicy, DanglingReferencesBehavior, FacetExportMode, RunState, TransformError,
    TransformStats, Transformer, TransformerConfig,
};
use reposync_repo::{
    ClassName, Code, CodeSpecProps, EntityProps, Id64, IdQuery, InsertMode, MemoryRepository,
    PropertyValue, ProvenanceKind, ProvenanceRecord, RepoError, Repository, RepositoryId,
    SchemaVersion, PROVENANCE_CLASS,
};
use reposync_testkit::prelude::*;
use uuid::Uuid;

fn copy(
    source: &MemoryRepository,
    target: &MemoryRepository,
    config: TransformerConfig,
) -> TransformStats {
    let mut transformer = Transformer::new(source, target, config).unwrap();
    transformer.process().unwrap()
}

#[test]
fn full_copy_reproduces_source() {
    init_tracing();
    let (source, ids) = plant_repository(3);
    let target = MemoryRepository::new();

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(snapshot(&target).unwrap(), snapshot(&source).unwrap());
    assert_eq!(stats.imported.entities.inserted, 2 + 2 * ids.pumps.len() as u64);
    assert_eq!(stats.imported.relationships.inserted, 3);
    assert_eq!(stats.imported.facets.inserted, 9);
    assert_eq!(stats.unresolved_references, 0);
    // each pump's downstream valve is imported after the pump
    assert!(stats.resolved_references >= 3);
}

#[test]
fn second_run_writes_nothing() {
    let (source, _) = plant_repository(2);
    let target = MemoryRepository::new();
    copy(&source, &target, TransformerConfig::new());
    let index = target.changeset_index();

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(stats.imported.total_writes(), 0);
    assert_eq!(stats.provenance_writes, 0);
    assert_eq!(stats.skipped_unchanged, 6);
    assert_eq!(target.changeset_index(), index);
}

#[test]
fn source_edits_are_carried_by_a_full_run() {
    let (source, ids) = plant_repository(2);
    let target = MemoryRepository::new();
    copy(&source, &target, TransformerConfig::new());

    set_property(&source, ids.pumps[1], "rating", PropertyValue::Integer(99)).unwrap();
    source.delete_entity(ids.valves[0]).unwrap();
    source.save_changes("edit").unwrap();

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(stats.deleted_by_detection, 1);
    assert_eq!(find_by_label(&target, "valve-0").unwrap(), None);
    let pump = find_by_label(&target, "pump-1").unwrap().unwrap();
    let rating = target.get_entity(pump).unwrap().unwrap().properties["rating"].clone();
    assert_eq!(rating, PropertyValue::Integer(99));
}

#[test]
fn detached_facets_match_inline_export() {
    let (source, _) = plant_repository(3);
    let inline = MemoryRepository::new();
    let detached = MemoryRepository::new();

    copy(&source, &inline, TransformerConfig::new());
    let stats = copy(
        &source,
        &detached,
        TransformerConfig::new().facet_export(FacetExportMode::Detached { batch_size: 2 }),
    );

    assert_eq!(snapshot(&detached).unwrap(), snapshot(&inline).unwrap());
    assert_eq!(stats.imported.facets.inserted, 9);
}

#[test]
fn cyclic_references_resolve() {
    let source = MemoryRepository::new();
    build_graph(&source, &GraphSpec::ring(5)).unwrap();
    let target = MemoryRepository::new();

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(snapshot(&target).unwrap(), snapshot(&source).unwrap());
    // every node but the last points at a node exported after it
    assert_eq!(stats.resolved_references, 4);
    assert_eq!(stats.unresolved_references, 0);
}

#[test]
fn self_reference_resolves() {
    let source = MemoryRepository::new();
    build_graph(&source, &GraphSpec { nodes: 1, edges: vec![(0, 0)] }).unwrap();
    let target = MemoryRepository::new();

    copy(&source, &target, TransformerConfig::new());

    let node = find_by_label(&target, "node-0").unwrap().unwrap();
    let entity = target.get_entity(node).unwrap().unwrap();
    assert_eq!(entity.properties["ref-0"].as_navigation().unwrap().id, node);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_graphs_copy_exactly(spec in graph_strategy(8)) {
        let source = MemoryRepository::new();
        build_graph(&source, &spec).unwrap();
        let target = MemoryRepository::new();

        let stats = copy(&source, &target, TransformerConfig::new());

        prop_assert_eq!(snapshot(&target).unwrap(), snapshot(&source).unwrap());
        prop_assert_eq!(stats.unresolved_references, 0);
        prop_assert!(stats.resolved_references as usize <= spec.edges.len());
        prop_assert_eq!(stats.deferred_passes, 0);
    }
}

#[test]
fn dangling_reference_is_rejected_by_default() {
    let (source, ids) = plant_repository(1);
    let ghost = PropertyValue::navigation(Id64::new(0xdead));
    set_property(&source, ids.pumps[0], "ghost", ghost).unwrap();
    let target = MemoryRepository::new();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    let err = transformer.process().unwrap_err();

    assert!(matches!(
        err,
        TransformError::DanglingReference { referencer, .. } if referencer == ids.pumps[0]
    ));
    assert_eq!(transformer.state(), RunState::Failed);
}

#[test]
fn dangling_reference_is_nulled_when_ignored() {
    let (source, ids) = plant_repository(1);
    let ghost = PropertyValue::navigation(Id64::new(0xdead));
    set_property(&source, ids.pumps[0], "ghost", ghost).unwrap();
    let target = MemoryRepository::new();

    let stats = copy(
        &source,
        &target,
        TransformerConfig::new().dangling_references(DanglingReferencesBehavior::Ignore),
    );

    assert_eq!(stats.unresolved_references, 1);
    let pump = find_by_label(&target, "pump-0").unwrap().unwrap();
    let entity = target.get_entity(pump).unwrap().unwrap();
    assert!(!entity.properties["ghost"].as_navigation().unwrap().id.is_valid());
    assert!(entity.properties["downstream"].as_navigation().unwrap().id.is_valid());
}

#[test]
fn excluded_class_is_left_out() {
    let (source, _) = plant_repository(2);
    let target = MemoryRepository::new();
    let config = TransformerConfig::new().dangling_references(DanglingReferencesBehavior::Ignore);

    let mut transformer = Transformer::new(&source, &target, config).unwrap();
    transformer.exclude_class(ClassName::new(VALVE));
    let stats = transformer.process().unwrap();

    assert_eq!(find_by_label(&target, "valve-0").unwrap(), None);
    assert!(find_by_label(&target, "pump-0").unwrap().is_some());
    assert_eq!(target.relationship_count(), 0);
    assert!(stats.unresolved_references >= 2);
}

#[test]
fn preserved_ids_match_source() {
    let source = MemoryRepository::new();
    let nodes = build_graph(&source, &GraphSpec::ring(4)).unwrap();
    let target = MemoryRepository::new();

    copy(
        &source,
        &target,
        TransformerConfig::new().preserve_entity_ids(true).no_provenance(true),
    );

    for (n, id) in nodes.iter().enumerate() {
        let entity = target.get_entity(*id).unwrap().unwrap();
        assert_eq!(entity.user_label.as_deref(), Some(format!("node-{n}").as_str()));
    }
}

#[test]
fn preserved_id_in_use_fails() {
    let source = MemoryRepository::new();
    build_graph(&source, &GraphSpec::ring(2)).unwrap();
    let target = MemoryRepository::new();
    insert_element(&target, "occupant").unwrap();

    let mut transformer = Transformer::new(
        &source,
        &target,
        TransformerConfig::new().preserve_entity_ids(true).no_provenance(true),
    )
    .unwrap();

    assert!(matches!(
        transformer.process(),
        Err(TransformError::IdentifierInUse { .. })
    ));
}

#[test]
fn preserved_id_already_claimed_by_a_remap_fails() {
    let source = MemoryRepository::new();
    let node = build_graph(&source, &GraphSpec { nodes: 1, edges: vec![] }).unwrap()[0];
    let target = MemoryRepository::new();

    let mut transformer = Transformer::new(
        &source,
        &target,
        TransformerConfig::new().preserve_entity_ids(true).no_provenance(true),
    )
    .unwrap();
    let other = Id64::new(0x999);
    transformer.remap_entity(other, node).unwrap();

    match transformer.process() {
        Err(TransformError::IdPreservationConflict { id, mapped_from }) => {
            assert_eq!(id, node);
            assert_eq!(mapped_from, other);
        }
        result => panic!("expected an id preservation conflict, got {result:?}"),
    }
}

#[test]
fn source_provenance_is_carried_once() {
    let source = MemoryRepository::new();
    let tool_scope = insert_element(&source, "tool-scope").unwrap();
    let tracked = source
        .insert_entity(
            &EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER)
                .with_parent(tool_scope)
                .with_label("tracked"),
            InsertMode::Allocate,
        )
        .unwrap();
    let mut foreign =
        ProvenanceRecord::for_entity(tracked, tool_scope, Id64::new(0x777), RepositoryId::new());
    foreign.identifier = "doc-17/sheet".to_string();
    foreign.kind = ProvenanceKind::Other("Document".to_string());
    source
        .insert_facet(&foreign.to_facet(), InsertMode::Allocate)
        .unwrap();
    source.save_changes("tracked").unwrap();
    let target = MemoryRepository::new();
    let config = || TransformerConfig::new().include_source_provenance(true);
    let provenance_of = |id: Id64| -> Vec<ProvenanceRecord> {
        target
            .get_facets(id, Some(&ClassName::new(PROVENANCE_CLASS)))
            .unwrap()
            .iter()
            .filter_map(ProvenanceRecord::from_facet)
            .collect()
    };

    copy(&source, &target, config());

    let target_scope = find_by_label(&target, "tool-scope").unwrap().unwrap();
    let target_tracked = find_by_label(&target, "tracked").unwrap().unwrap();
    let records = provenance_of(target_tracked);
    assert_eq!(records.len(), 2);
    let copied = records
        .iter()
        .find(|record| record.kind == ProvenanceKind::Other("Document".to_string()))
        .unwrap();
    assert_eq!(copied.scope, target_scope);
    assert_eq!(copied.owner, target_tracked);
    assert_eq!(copied.identifier, "doc-17/sheet");

    let stats = copy(&source, &target, config());
    assert_eq!(stats.provenance_writes, 0);
    assert_eq!(provenance_of(target_tracked).len(), 2);

    // an edited entity is imported again and still carries a single copy
    set_property(&source, tracked, "note", PropertyValue::Integer(1)).unwrap();
    source.save_changes("edit tracked").unwrap();
    let stats = copy(&source, &target, config());
    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(provenance_of(target_tracked).len(), 2);
}

#[test]
fn remapped_entity_updates_existing_target() {
    let source = MemoryRepository::new();
    let node = build_graph(&source, &GraphSpec { nodes: 1, edges: vec![] }).unwrap()[0];
    let target = MemoryRepository::new();
    let anchor = insert_element(&target, "anchor").unwrap();
    target.save_changes("anchor").unwrap();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    transformer.remap_entity(node, anchor).unwrap();
    let stats = transformer.process().unwrap();

    assert_eq!(stats.imported.entities.inserted, 0);
    assert_eq!(stats.imported.entities.updated, 1);
    let updated = target.get_entity(anchor).unwrap().unwrap();
    assert_eq!(updated.user_label.as_deref(), Some("node-0"));
}

/// Inserts a labelled element with the given code and federation GUID.
fn insert_matchable(
    repo: &MemoryRepository,
    label: &str,
    code: Option<(&str, &str)>,
    guid: Option<Uuid>,
) -> Id64 {
    let mut props = EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER)
        .with_label(label);
    if let Some((spec_name, value)) = code {
        let spec = match repo.find_code_spec(spec_name).unwrap() {
            Some(spec) => spec,
            None => repo
                .insert_code_spec(&CodeSpecProps::new(spec_name), InsertMode::Allocate)
                .unwrap(),
        };
        props = props.with_code(Code::new(spec, Id64::ROOT_ENTITY, value));
    }
    if let Some(guid) = guid {
        props = props.with_federation_guid(guid);
    }
    let id = repo.insert_entity(&props, InsertMode::Allocate).unwrap();
    repo.save_changes(label).unwrap();
    id
}

#[test]
fn unmapped_entity_matches_by_federation_guid() {
    let guid = Uuid::new_v4();
    let source = MemoryRepository::new();
    insert_matchable(&source, "shared", None, Some(guid));
    let target = MemoryRepository::new();
    let anchor = insert_matchable(&target, "anchor", None, Some(guid));

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(stats.imported.entities.inserted, 0);
    assert_eq!(stats.imported.entities.updated, 1);
    let matched = target.get_entity(anchor).unwrap().unwrap();
    assert_eq!(matched.user_label.as_deref(), Some("shared"));
}

#[test]
fn unmapped_entity_matches_by_code() {
    let source = MemoryRepository::new();
    // shift the source code spec id away from the target's
    source
        .insert_code_spec(&CodeSpecProps::new("Test:Other"), InsertMode::Allocate)
        .unwrap();
    insert_matchable(&source, "coded", Some(("Test:Tag", "T-1")), None);
    let target = MemoryRepository::new();
    let anchor = insert_matchable(&target, "anchor", Some(("Test:Tag", "T-1")), None);

    let stats = copy(&source, &target, TransformerConfig::new());

    assert_eq!(stats.imported.entities.inserted, 0);
    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(find_by_label(&target, "coded").unwrap(), Some(anchor));
}

#[test]
fn code_collision_fails_without_code_matching() {
    let source = MemoryRepository::new();
    insert_matchable(&source, "coded", Some(("Test:Tag", "T-1")), None);
    let target = MemoryRepository::new();
    insert_matchable(&target, "anchor", Some(("Test:Tag", "T-1")), None);

    let mut transformer =
        Transformer::new(&source, &target, TransformerConfig::new().match_by_code(false)).unwrap();
    let result = transformer.process();

    assert!(matches!(
        result,
        Err(TransformError::Repository(RepoError::DuplicateCode { .. }))
    ));
}

#[test]
fn class_remap_applies_to_target() {
    let (source, _) = plant_repository(1);
    let target = MemoryRepository::new();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    transformer.remap_class(ClassName::new(PUMP), ClassName::new("Core:Element"));
    transformer.process().unwrap();

    let pump = find_by_label(&target, "pump-0").unwrap().unwrap();
    assert_eq!(
        target.get_entity(pump).unwrap().unwrap().class_name,
        ClassName::new("Core:Element")
    );
}

#[test]
fn schemas_are_imported_alone() {
    let (source, _) = plant_repository(1);
    let target = MemoryRepository::new();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    transformer.process_schemas().unwrap();

    assert_eq!(
        target.query_schema_version(PLANT_SCHEMA).unwrap(),
        Some(SchemaVersion::new(1, 0, 0))
    );
    assert_eq!(target.enumerate_ids(&IdQuery::entities()).unwrap().count(), 2);
}

#[test]
fn newer_target_schema_is_rejected() {
    let (source, _) = plant_repository(1);
    let target = MemoryRepository::new();
    target
        .import_schemas(&[plant_schema_version(SchemaVersion::new(2, 0, 0))])
        .unwrap();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    assert!(matches!(
        transformer.process_schemas(),
        Err(TransformError::SchemaVersionIncompatible { .. })
    ));
}

#[test]
fn single_entity_run_updates_target() {
    let (source, ids) = plant_repository(2);
    let target = MemoryRepository::new();
    copy(&source, &target, TransformerConfig::new());

    set_property(&source, ids.pumps[0], "rating", PropertyValue::Integer(7)).unwrap();
    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    let stats = transformer.process_entity(ids.pumps[0]).unwrap();

    assert_eq!(stats.imported.entities.updated, 1);
    assert_eq!(stats.imported.entities.inserted, 0);
    let pump = find_by_label(&target, "pump-0").unwrap().unwrap();
    assert_eq!(
        target.get_entity(pump).unwrap().unwrap().properties["rating"],
        PropertyValue::Integer(7)
    );
}

#[test]
fn container_run_copies_its_contents() {
    let (source, ids) = plant_repository(2);
    let target = MemoryRepository::new();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    transformer.process_container(ids.partition).unwrap();

    let expected = snapshot(&source).unwrap();
    assert_eq!(snapshot(&target).unwrap()["entities"], expected["entities"]);
    assert_eq!(target.relationship_count(), 0);
}

#[test]
fn class_change_replaces_subtree() {
    let (source, ids) = plant_repository(2);
    let target = MemoryRepository::new();
    copy(&source, &target, TransformerConfig::new());
    let old_system = find_by_label(&target, "system").unwrap().unwrap();

    let mut system = source.get_entity(ids.system).unwrap().unwrap();
    system.class_name = ClassName::new("Plant:Unit");
    source.update_entity(&system).unwrap();
    source.save_changes("reclassify").unwrap();

    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();
    transformer.process_changes(None).unwrap();

    let new_system = find_by_label(&target, "system").unwrap().unwrap();
    assert_ne!(new_system, old_system);
    assert_eq!(
        target.get_entity(new_system).unwrap().unwrap().class_name,
        ClassName::new("Plant:Unit")
    );
    assert_eq!(snapshot(&target).unwrap(), snapshot(&source).unwrap());
}

#[test]
fn class_change_can_be_rejected() {
    let (source, ids) = plant_repository(1);
    let target = MemoryRepository::new();
    copy(&source, &target, TransformerConfig::new());

    let mut pump = source.get_entity(ids.pumps[0]).unwrap().unwrap();
    pump.class_name = ClassName::new(VALVE);
    source.update_entity(&pump).unwrap();
    source.save_changes("reclassify").unwrap();

    let config = TransformerConfig::new().class_change_policy(ClassChangePolicy::Reject);
    let mut transformer = Transformer::new(&source, &target, config).unwrap();
    assert!(matches!(
        transformer.process_changes(None),
        Err(TransformError::ChangesetClassIdentityAnomaly { id, .. }) if id == ids.pumps[0]
    ));
}

#[test]
fn cancelled_run_can_be_repeated() {
    let (source, _) = plant_repository(2);
    let target = MemoryRepository::new();
    let mut transformer = Transformer::new(&source, &target, TransformerConfig::new()).unwrap();

    transformer.cancel_handle().cancel();
    let err = transformer.process().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(transformer.state(), RunState::Failed);

    transformer.process().unwrap();
    assert_eq!(transformer.state(), RunState::Finished);
    assert_eq!(snapshot(&target).unwrap(), snapshot(&source).unwrap());
}
