//! Property-based test generators using proptest.
//!
//! Provides strategies for identifiers and for random entity graphs whose
//! navigation properties may form cycles.

use proptest::prelude::*;
use reposync_repo::{
    ClassName, EntityProps, Id64, InsertMode, PropertyValue, RepoResult, Repository,
};

/// Strategy for user identifiers (never invalid or well-known).
pub fn id64_strategy() -> impl Strategy<Value = Id64> {
    (Id64::FIRST_USER_ID..u64::MAX).prop_map(Id64::new)
}

/// Strategy for identifiers clustered in a small range, so that keys
/// collide across shards and repeat.
pub fn dense_id64_strategy(span: u64) -> impl Strategy<Value = Id64> {
    let first = Id64::FIRST_USER_ID;
    (first..first + span.max(1)).prop_map(Id64::new)
}

/// Strategy for canonical hexadecimal identifier keys.
pub fn hex_key_strategy() -> impl Strategy<Value = String> {
    id64_strategy().prop_map(Id64::to_hex)
}

/// Shape of a random entity graph.
///
/// Node `i` is an element labelled `node-i`; each edge `(from, to)` is a
/// navigation property on `from` pointing at `to`. Self edges and cycles
/// are allowed.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    /// Number of nodes.
    pub nodes: usize,
    /// Navigation edges as node indices.
    pub edges: Vec<(usize, usize)>,
}

impl GraphSpec {
    /// A ring `node-0 -> node-1 -> ... -> node-0`.
    pub fn ring(nodes: usize) -> Self {
        Self {
            nodes,
            edges: (0..nodes).map(|i| (i, (i + 1) % nodes)).collect(),
        }
    }

    /// Whether any edge is part of a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut adjacency = vec![Vec::new(); self.nodes];
        for &(from, to) in &self.edges {
            adjacency[from].push(to);
        }
        // 0 unvisited, 1 on stack, 2 done
        let mut marks = vec![0u8; self.nodes];
        fn visit(node: usize, adjacency: &[Vec<usize>], marks: &mut [u8]) -> bool {
            marks[node] = 1;
            for &next in &adjacency[node] {
                if marks[next] == 1 || (marks[next] == 0 && visit(next, adjacency, marks)) {
                    return true;
                }
            }
            marks[node] = 2;
            false
        }
        (0..self.nodes).any(|node| marks[node] == 0 && visit(node, &adjacency, &mut marks))
    }
}

/// Strategy for graphs with 1 to `max_nodes` nodes.
pub fn graph_strategy(max_nodes: usize) -> impl Strategy<Value = GraphSpec> {
    (1..=max_nodes.max(1)).prop_flat_map(|nodes| {
        prop::collection::vec((0..nodes, 0..nodes), 0..nodes * 2)
            .prop_map(move |edges| GraphSpec { nodes, edges })
    })
}

/// Inserts `spec` into the root container of `repo` and saves it.
///
/// Edges are written as properties `ref-<k>` on their source node.
/// Returns the node identifiers in index order.
pub fn build_graph(repo: &dyn Repository, spec: &GraphSpec) -> RepoResult<Vec<Id64>> {
    let mut ids = Vec::with_capacity(spec.nodes);
    for node in 0..spec.nodes {
        ids.push(repo.insert_entity(
            &EntityProps::new(ClassName::new("Core:Element"), Id64::ROOT_CONTAINER)
                .with_label(format!("node-{node}")),
            InsertMode::Allocate,
        )?);
    }
    for (k, &(from, to)) in spec.edges.iter().enumerate() {
        if let Some(mut entity) = repo.get_entity(ids[from])? {
            entity
                .properties
                .insert(format!("ref-{k}"), PropertyValue::navigation(ids[to]));
            repo.update_entity(&entity)?;
        }
    }
    repo.save_changes("build graph")?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposync_repo::MemoryRepository;

    #[test]
    fn ring_is_cyclic() {
        assert!(GraphSpec::ring(3).has_cycle());
        assert!(!GraphSpec { nodes: 3, edges: vec![(0, 1), (1, 2)] }.has_cycle());
    }

    #[test]
    fn build_graph_wires_references() {
        let repo = MemoryRepository::new();
        let ids = build_graph(&repo, &GraphSpec::ring(2)).unwrap();
        let first = repo.get_entity(ids[0]).unwrap().unwrap();
        assert_eq!(first.properties["ref-0"].as_navigation().unwrap().id, ids[1]);
    }

    proptest! {
        #[test]
        fn generated_ids_are_user_ids(id in id64_strategy()) {
            prop_assert!(id.is_valid());
            prop_assert!(!id.is_well_known());
        }

        #[test]
        fn dense_ids_start_at_first_user_id(id in dense_id64_strategy(16)) {
            prop_assert!(id.value() >= Id64::FIRST_USER_ID);
            prop_assert!(id.value() < Id64::FIRST_USER_ID + 16);
        }

        #[test]
        fn generated_edges_stay_in_range(spec in graph_strategy(6)) {
            for (from, to) in spec.edges {
                prop_assert!(from < spec.nodes && to < spec.nodes);
            }
        }
    }
}
