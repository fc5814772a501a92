//! Service dependency graph
//!
//! Services are added with the names they require; `finalize` turns the
//! graph into a linear startup order (and its reverse for shutdown). After
//! that the graph is frozen.
//!
//! Edges point from a dependency to its dependent. Among services whose
//! dependencies are all satisfied, the one added first starts first, so the
//! same configuration always yields the same order.

use crate::error::GraphError;
use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rvm_core::StepConfig;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// A named service and what it requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    pub name: String,
    pub dependencies: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Orders {
    startup: Vec<String>,
    shutdown: Vec<String>,
}

/// Dependency graph with a derived startup/shutdown order
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<ServiceNode, ()>,
    index: HashMap<String, NodeIndex>,
    orders: Option<Orders>,
}

impl DependencyGraph {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and finalize a graph from configured steps, in file order
    ///
    /// # Errors
    /// Any `GraphError` from `add_service` or `finalize`.
    pub fn from_steps(steps: &IndexMap<String, StepConfig>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for (name, step) in steps {
            graph.add_service(name.clone(), step.dependencies.iter().cloned())?;
        }
        graph.finalize()?;
        Ok(graph)
    }

    /// Add a service
    ///
    /// Dependencies may reference services that are added later; they are
    /// resolved by `finalize`.
    ///
    /// # Errors
    /// - `GraphError::GraphFinalized` once the order has been computed
    /// - `GraphError::DuplicateService` if `name` is already present
    pub fn add_service<I, S>(&mut self, name: impl Into<String>, dependencies: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.orders.is_some() {
            return Err(GraphError::GraphFinalized);
        }
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateService(name));
        }

        let node = ServiceNode {
            name: name.clone(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        };
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        Ok(())
    }

    /// Compute `(startup_order, shutdown_order)` and freeze the graph
    ///
    /// Calling it again on a finalized graph returns the same orders.
    ///
    /// # Errors
    /// - `GraphError::UnknownDependency` for a dependency that was never added
    /// - `GraphError::CircularDependency` with the offending cycle
    ///
    /// On error the graph stays open and no order is recorded.
    pub fn finalize(&mut self) -> Result<(Vec<String>, Vec<String>), GraphError> {
        if let Some(orders) = &self.orders {
            return Ok((orders.startup.clone(), orders.shutdown.clone()));
        }

        self.graph.clear_edges();
        let mut edges = Vec::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            for dependency in &node.dependencies {
                let dep_idx = self.index.get(dependency).ok_or_else(|| GraphError::UnknownDependency {
                    service: node.name.clone(),
                    dependency: dependency.clone(),
                })?;
                edges.push((*dep_idx, idx));
            }
        }
        for (from, to) in edges {
            self.graph.add_edge(from, to, ());
        }

        let startup = match self.topological_order() {
            Some(order) => order,
            None => {
                let cycle = self.find_cycle();
                self.graph.clear_edges();
                return Err(GraphError::CircularDependency { cycle });
            }
        };
        let shutdown: Vec<String> = startup.iter().rev().cloned().collect();

        tracing::debug!(startup = ?startup, "dependency graph finalized");
        self.orders = Some(Orders {
            startup: startup.clone(),
            shutdown: shutdown.clone(),
        });
        Ok((startup, shutdown))
    }

    /// Kahn's algorithm; ready nodes are taken lowest insertion index first
    fn topological_order(&self) -> Option<Vec<String>> {
        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(self.graph[idx].name.clone());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let d = &mut indegree[next.index()];
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        (order.len() == self.graph.node_count()).then_some(order)
    }

    /// Closed path through the earliest-added strongly connected component
    /// that contains a cycle, following "requires" edges.
    fn find_cycle(&self) -> Vec<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .min_by_key(|scc| scc.iter().map(|i| i.index()).min().unwrap_or(usize::MAX));

        let Some(component) = component else {
            return Vec::new();
        };
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = component
            .iter()
            .copied()
            .min_by_key(|i| i.index())
            .unwrap_or(component[0]);

        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        self.walk_back_to(start, start, &members, &mut visited, &mut path);
        path.into_iter().map(|i| self.graph[i].name.clone()).collect()
    }

    fn walk_back_to(
        &self,
        current: NodeIndex,
        start: NodeIndex,
        members: &HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        // Incoming edges come from dependencies, i.e. what `current` requires.
        let mut requires: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(current, Direction::Incoming)
            .filter(|n| members.contains(n))
            .collect();
        requires.sort_by_key(|n| n.index());

        for next in requires {
            if next == start {
                path.push(start);
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.walk_back_to(next, start, members, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    #[inline]
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.orders.is_some()
    }

    /// Startup order; empty until `finalize` succeeds
    #[must_use]
    pub fn startup_order(&self) -> &[String] {
        self.orders.as_ref().map_or(&[], |o| o.startup.as_slice())
    }

    /// Exactly the reverse of `startup_order`
    #[must_use]
    pub fn shutdown_order(&self) -> &[String] {
        self.orders.as_ref().map_or(&[], |o| o.shutdown.as_slice())
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceNode> {
        self.index.get(name).map(|i| &self.graph[*i])
    }

    #[must_use]
    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.service(name).map(|n| &n.dependencies)
    }

    /// Services that directly require `name`
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.graph
            .node_indices()
            .filter(|i| self.graph[*i].dependencies.contains(name) && i != idx)
            .map(|i| self.graph[i].name.as_str())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Services in insertion order
    pub fn services(&self) -> impl Iterator<Item = &ServiceNode> + '_ {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
