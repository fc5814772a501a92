use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rvm_startup::{DependencyGraph, GraphError};
use std::collections::HashMap;

/// Node `i` may only depend on nodes with a lower index, so the graph is
/// acyclic whatever order the nodes are added in.
fn acyclic_spec() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..24usize).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(4)))
            .collect::<Vec<_>>()
            .prop_map(|deps| {
                deps.into_iter()
                    .enumerate()
                    .map(|(i, d)| d.into_iter().filter(|j| *j < i).collect())
                    .collect()
            })
    })
}

fn build(spec: &[Vec<usize>], reversed: bool) -> Result<DependencyGraph, GraphError> {
    let mut graph = DependencyGraph::new();
    let mut indices: Vec<usize> = (0..spec.len()).collect();
    if reversed {
        indices.reverse();
    }
    for i in indices {
        graph.add_service(format!("s{i}"), spec[i].iter().map(|j| format!("s{j}")))?;
    }
    graph.finalize()?;
    Ok(graph)
}

proptest! {
    #[test]
    fn prop_startup_order_respects_dependencies(spec in acyclic_spec(), reversed in any::<bool>()) {
        let graph = build(&spec, reversed).unwrap();
        let order = graph.startup_order();
        prop_assert_eq!(order.len(), spec.len());

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(p, name)| (name.as_str(), p)).collect();
        for (i, deps) in spec.iter().enumerate() {
            let me = position[format!("s{i}").as_str()];
            for j in deps {
                let dep = format!("s{j}");
                prop_assert!(position[dep.as_str()] < me);
            }
        }
    }

    #[test]
    fn prop_shutdown_is_reverse_of_startup(spec in acyclic_spec()) {
        let graph = build(&spec, false).unwrap();
        let mut reversed = graph.startup_order().to_vec();
        reversed.reverse();
        prop_assert_eq!(graph.shutdown_order(), reversed.as_slice());
    }

    #[test]
    fn prop_order_is_deterministic(spec in acyclic_spec(), reversed in any::<bool>()) {
        let first = build(&spec, reversed).unwrap();
        let second = build(&spec, reversed).unwrap();
        prop_assert_eq!(first.startup_order(), second.startup_order());
    }

    #[test]
    fn prop_ring_is_reported_as_closed_cycle(n in 1..12usize) {
        let mut graph = DependencyGraph::new();
        for i in 0..n {
            graph.add_service(format!("s{i}"), [format!("s{}", (i + 1) % n)]).unwrap();
        }
        match graph.finalize() {
            Err(GraphError::CircularDependency { cycle }) => {
                prop_assert_eq!(cycle.len(), n + 1);
                prop_assert_eq!(cycle.first(), cycle.last());
                prop_assert_eq!(cycle[0].as_str(), "s0");
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
        prop_assert!(!graph.is_finalized());
        prop_assert!(graph.startup_order().is_empty());
    }
}

#[test]
fn test_rejects_simple_cycle() {
    let mut graph = DependencyGraph::new();
    graph.add_service("a", ["b"]).unwrap();
    graph.add_service("b", ["a"]).unwrap();

    assert_eq!(
        graph.finalize(),
        Err(GraphError::CircularDependency {
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        })
    );
}

#[test]
fn test_reference_topology() {
    let mut graph = DependencyGraph::new();
    graph.add_service("db", Vec::<String>::new()).unwrap();
    graph.add_service("api", ["db"]).unwrap();
    graph.add_service("app", ["db", "api"]).unwrap();

    let (startup, shutdown) = graph.finalize().unwrap();
    assert_eq!(startup, vec!["db", "api", "app"]);
    assert_eq!(shutdown, vec!["app", "api", "db"]);
}

#[test]
fn test_add_after_finalize_fails() {
    let mut graph = DependencyGraph::new();
    graph.add_service("db", Vec::<String>::new()).unwrap();
    graph.finalize().unwrap();
    assert_eq!(graph.add_service("late", Vec::<String>::new()), Err(GraphError::GraphFinalized));
}
