//! Sample repositories and comparison helpers.
//!
//! The plant fixture is a small piping model: a partition defining a
//! container, a system entity, and per unit a pump and a valve that
//! reference each other, a nameplate unique facet on the pump, two
//! inspection multi facets on the valve and a `Feeds` relationship.

use reposync_repo::{
    is_provenance_class, Changeset, ChangesetRange, ClassDef, ClassKind, ClassName, Code,
    CodeSpecProps, ContainerProps, EntityProps, FacetKind, FacetProps, Id64, IdQuery, InsertMode,
    MemoryRepository, PropertyValue, RelationshipProps, RepoResult, Repository, SchemaInfo,
    SchemaVersion,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// Plant schema name.
pub const PLANT_SCHEMA: &str = "Plant";
/// Pump entity class.
pub const PUMP: &str = "Plant:Pump";
/// Valve entity class.
pub const VALVE: &str = "Plant:Valve";
/// System entity class.
pub const SYSTEM: &str = "Plant:System";
/// Piping container class.
pub const PIPING_MODEL: &str = "Plant:PipingModel";
/// Nameplate unique facet class.
pub const NAMEPLATE: &str = "Plant:Nameplate";
/// Inspection multi facet class.
pub const INSPECTION: &str = "Plant:Inspection";
/// Pump-to-valve relationship class.
pub const FEEDS: &str = "Plant:Feeds";
/// Code spec of plant tags.
pub const TAG_SPEC: &str = "Plant:Tag";

/// The plant schema at `01.00.00`.
pub fn plant_schema() -> SchemaInfo {
    plant_schema_version(SchemaVersion::new(1, 0, 0))
}

/// The plant schema at a given version.
pub fn plant_schema_version(version: SchemaVersion) -> SchemaInfo {
    SchemaInfo::new(PLANT_SCHEMA, version)
        .with_reference("Core")
        .with_class(ClassDef::new(SYSTEM, ClassKind::Entity, Some("Core:Element")))
        .with_class(ClassDef::new(PUMP, ClassKind::Entity, Some("Core:Element")))
        .with_class(ClassDef::new(VALVE, ClassKind::Entity, Some("Core:Element")))
        .with_class(ClassDef::new(PIPING_MODEL, ClassKind::Container, Some("Core:Model")))
        .with_class(ClassDef::new(NAMEPLATE, ClassKind::UniqueFacet, Some("Core:UniqueAspect")))
        .with_class(ClassDef::new(INSPECTION, ClassKind::MultiFacet, Some("Core:MultiAspect")))
        .with_class(ClassDef::new(
            FEEDS,
            ClassKind::Relationship,
            Some("Core:ElementRefersToElements"),
        ))
}

/// Identifiers of a built plant.
#[derive(Debug, Clone)]
pub struct PlantIds {
    /// The tag code spec.
    pub tag_spec: Id64,
    /// Partition entity defining the piping container.
    pub partition: Id64,
    /// System entity, parent of every pump and valve.
    pub system: Id64,
    /// Pumps, one per unit.
    pub pumps: Vec<Id64>,
    /// Valves, one per unit.
    pub valves: Vec<Id64>,
    /// Feeds relationships, one per unit.
    pub feeds: Vec<Id64>,
}

/// Builds the plant fixture into `repo` and saves it as one changeset.
pub fn build_plant(repo: &dyn Repository, units: usize) -> RepoResult<PlantIds> {
    repo.import_schemas(&[plant_schema()])?;
    let tag_spec = repo.insert_code_spec(&CodeSpecProps::new(TAG_SPEC), InsertMode::Allocate)?;

    let partition = repo.insert_entity(
        &EntityProps::new(ClassName::new("Core:Partition"), Id64::ROOT_CONTAINER)
            .with_parent(Id64::ROOT_ENTITY)
            .with_code(Code::new(tag_spec, Id64::ROOT_ENTITY, "piping"))
            .with_label("piping"),
        InsertMode::Allocate,
    )?;
    repo.insert_container(&ContainerProps::new(ClassName::new(PIPING_MODEL), partition))?;

    let system = repo.insert_entity(
        &EntityProps::new(ClassName::new(SYSTEM), partition)
            .with_code(Code::new(tag_spec, partition, "SYS"))
            .with_label("system"),
        InsertMode::Allocate,
    )?;

    let mut ids = PlantIds {
        tag_spec,
        partition,
        system,
        pumps: Vec::with_capacity(units),
        valves: Vec::with_capacity(units),
        feeds: Vec::with_capacity(units),
    };
    for unit in 0..units {
        let pump = repo.insert_entity(
            &EntityProps::new(ClassName::new(PUMP), partition)
                .with_parent(system)
                .with_code(Code::new(tag_spec, system, format!("P-{unit}")))
                .with_label(format!("pump-{unit}"))
                .with_property("rating", PropertyValue::Integer(40 + unit as i64)),
            InsertMode::Allocate,
        )?;
        let valve = repo.insert_entity(
            &EntityProps::new(ClassName::new(VALVE), partition)
                .with_parent(system)
                .with_code(Code::new(tag_spec, system, format!("V-{unit}")))
                .with_label(format!("valve-{unit}"))
                .with_property("pump", PropertyValue::navigation(pump)),
            InsertMode::Allocate,
        )?;
        set_property(repo, pump, "downstream", PropertyValue::navigation(valve))?;

        repo.insert_facet(
            &FacetProps::new(ClassName::new(NAMEPLATE), FacetKind::Unique, pump)
                .with_property("maker", PropertyValue::text("Acme")),
            InsertMode::Allocate,
        )?;
        for year in [2020, 2024] {
            repo.insert_facet(
                &FacetProps::new(ClassName::new(INSPECTION), FacetKind::Multi, valve)
                    .with_property("year", PropertyValue::Integer(year)),
                InsertMode::Allocate,
            )?;
        }
        let feeds = repo.insert_relationship(
            &RelationshipProps::new(ClassName::new(FEEDS), pump, valve),
            InsertMode::Allocate,
        )?;
        ids.pumps.push(pump);
        ids.valves.push(valve);
        ids.feeds.push(feeds);
    }
    repo.save_changes("build plant")?;
    Ok(ids)
}

/// A fresh in-memory repository holding the plant fixture.
pub fn plant_repository(units: usize) -> (MemoryRepository, PlantIds) {
    let repo = MemoryRepository::new();
    let ids = build_plant(&repo, units).expect("failed to build plant fixture");
    (repo, ids)
}

/// Sets one property of an entity.
pub fn set_property(
    repo: &dyn Repository,
    id: Id64,
    name: &str,
    value: PropertyValue,
) -> RepoResult<()> {
    let mut entity = repo
        .get_entity(id)?
        .ok_or(reposync_repo::RepoError::EntityNotFound { id })?;
    entity.properties.insert(name.to_string(), value);
    repo.update_entity(&entity)
}

/// Inserts a labelled element in the root container.
pub fn insert_element(repo: &dyn Repository, label: &str) -> RepoResult<Id64> {
    repo.insert_entity(
        &EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER).with_label(label),
        InsertMode::Allocate,
    )
}

/// Finds the entity with the given label.
pub fn find_by_label(repo: &dyn Repository, label: &str) -> RepoResult<Option<Id64>> {
    for id in repo.enumerate_ids(&IdQuery::entities())? {
        if let Some(entity) = repo.get_entity(id)? {
            if entity.user_label.as_deref() == Some(label) {
                return Ok(Some(id));
            }
        }
    }
    Ok(None)
}

/// Identifier-independent view of a repository's content.
///
/// Entities are keyed by label; navigation values, parents, containers
/// and code scopes are rendered as the label of the referenced entity.
/// Provenance facets and unlabelled entities are left out.
pub fn snapshot(repo: &dyn Repository) -> RepoResult<Value> {
    let mut labels: HashMap<Id64, String> = HashMap::from([
        (Id64::ROOT_ENTITY, "<root>".to_string()),
        (Id64::DICTIONARY, "<dictionary>".to_string()),
    ]);
    let mut entities = Vec::new();
    for id in repo.enumerate_ids(&IdQuery::entities())? {
        if let Some(entity) = repo.get_entity(id)? {
            if let Some(label) = &entity.user_label {
                labels.insert(id, label.clone());
                entities.push(entity);
            }
        }
    }
    let label = |id: Id64| -> Value {
        match labels.get(&id) {
            Some(label) => Value::String(label.clone()),
            None if id.is_valid() => Value::String(format!("<unlabelled {id}>")),
            None => Value::Null,
        }
    };

    let mut rendered = Map::new();
    for entity in entities {
        let mut facets: Vec<Value> = repo
            .get_facets(entity.id, None)?
            .into_iter()
            .filter(|facet| !is_provenance_class(&facet.class_name))
            .map(|facet| {
                json!({
                    "class": facet.class_name.as_str(),
                    "properties": render_bag(&facet.properties, &label),
                })
            })
            .collect();
        facets.sort_by_key(|facet| facet.to_string());
        let container = repo.get_container(entity.id)?;
        let code = if entity.code.is_empty() {
            Value::Null
        } else {
            json!({ "scope": label(entity.code.scope), "value": entity.code.value })
        };
        rendered.insert(
            entity.user_label.clone().unwrap_or_default(),
            json!({
                "class": entity.class_name.as_str(),
                "container": label(entity.container),
                "parent": entity.parent.map_or(Value::Null, &label),
                "code": code,
                "properties": render_bag(&entity.properties, &label),
                "facets": facets,
                "defines": container.map(|container| container.class_name.as_str().to_string()),
            }),
        );
    }

    let mut relationships = Vec::new();
    for id in repo.enumerate_ids(&IdQuery::relationships())? {
        if let Some(rel) = repo.get_relationship(id)? {
            relationships.push(format!(
                "{} {} -> {}",
                rel.class_name,
                label(rel.source),
                label(rel.target)
            ));
        }
    }
    relationships.sort();
    Ok(json!({ "entities": rendered, "relationships": relationships }))
}

fn render_bag(bag: &reposync_repo::PropertyBag, label: &dyn Fn(Id64) -> Value) -> Value {
    let mut map = Map::new();
    for (name, value) in bag {
        map.insert(name.clone(), render_value(value, label));
    }
    Value::Object(map)
}

fn render_value(value: &PropertyValue, label: &dyn Fn(Id64) -> Value) -> Value {
    match value {
        PropertyValue::Navigation(nav) => json!({ "nav": label(nav.id) }),
        PropertyValue::Array(items) => {
            Value::Array(items.iter().map(|item| render_value(item, label)).collect())
        }
        PropertyValue::Struct(bag) => render_bag(bag, label),
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

/// Changeset files in a temporary directory.
pub struct ChangesetDir {
    dir: TempDir,
}

impl ChangesetDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
        }
    }

    /// Directory holding the files.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Writes the changesets of `range` to files, one per changeset.
    pub fn export(&self, repo: &dyn Repository, range: ChangesetRange) -> RepoResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for changeset in repo.download_changesets(range)? {
            let path = self.dir.path().join(format!("{:06}.cs", changeset.index));
            changeset.write_to(&path)?;
            paths.push(path);
        }
        Ok(paths)
    }

    /// Reads back every changeset file in index order.
    pub fn load(&self, paths: &[PathBuf]) -> RepoResult<Vec<Changeset>> {
        paths.iter().map(|path| Changeset::read_from(path)).collect()
    }
}

impl Default for ChangesetDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plant_fixture_shape() {
        let (repo, ids) = plant_repository(3);
        assert_eq!(ids.pumps.len(), 3);
        assert_eq!(repo.changeset_index(), 1);
        assert_eq!(repo.relationship_count(), 3);

        let valve = repo.get_entity(ids.valves[1]).unwrap().unwrap();
        assert_eq!(valve.parent, Some(ids.system));
        assert_eq!(valve.properties["pump"].as_navigation().unwrap().id, ids.pumps[1]);
        assert_eq!(find_by_label(&repo, "pump-2").unwrap(), Some(ids.pumps[2]));
    }

    #[test]
    fn snapshots_ignore_identifiers() {
        let (first, _) = plant_repository(2);
        let second = MemoryRepository::new();
        insert_element(&second, "padding").unwrap();
        build_plant(&second, 2).unwrap();

        let mut expected = snapshot(&first).unwrap();
        let actual = snapshot(&second).unwrap();
        expected["entities"]["padding"] = actual["entities"]["padding"].clone();
        assert_eq!(actual, expected);
        assert_eq!(actual["entities"]["valve-0"]["properties"]["pump"]["nav"], "pump-0");
    }

    #[test]
    fn changeset_files_roundtrip() {
        let (repo, _) = plant_repository(1);
        let dir = ChangesetDir::new();
        let paths = dir.export(&repo, ChangesetRange::single(1)).unwrap();
        assert_eq!(paths.len(), 1);
        let read = Changeset::read_from(&paths[0]).unwrap();
        assert_eq!(read.index, 1);
        assert!(!read.rows.is_empty());
    }
}
