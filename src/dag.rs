//! Step dependency graph
//!
//! Kahn's algorithm over explicit in-degree counts, grouped into layers so a
//! caller can see (and potentially parallelize) independent steps. Nodes left
//! with nonzero in-degree after the queue drains are the cycle participants
//! and are named in the error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::SluiceError;

/// Directed dependency graph over string-named nodes.
///
/// BTree containers keep iteration (and therefore layer ordering) stable for
/// a fixed edge set.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    /// node -> set of nodes it depends on
    upstream: BTreeMap<String, BTreeSet<String>>,
    /// node -> set of nodes depending on it
    downstream: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) {
        self.nodes.insert(name.into());
    }

    /// Record that `dependent` needs `dependency` to run first. Both
    /// endpoints are added implicitly.
    pub fn add_edge(&mut self, dependency: impl Into<String>, dependent: impl Into<String>) {
        let dependency = dependency.into();
        let dependent = dependent.into();
        self.nodes.insert(dependency.clone());
        self.nodes.insert(dependent.clone());
        self.upstream
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        self.downstream
            .entry(dependency)
            .or_default()
            .insert(dependent);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.downstream
            .get(name)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    /// Topological layers: layer zero is every node with no dependencies,
    /// each subsequent layer the nodes whose dependencies are all in earlier
    /// layers. A cycle leaves nodes unplaced and is a configuration error
    /// naming them.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, SluiceError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                let deg = self.upstream.get(n).map_or(0, BTreeSet::len);
                (n.as_str(), deg)
            })
            .collect();

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut layers = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let layer: Vec<String> = ready.iter().map(|n| n.to_string()).collect();
            placed += layer.len();

            let mut next = VecDeque::new();
            for node in ready.drain(..) {
                for dependent in self.dependents_of(node) {
                    let deg = in_degree
                        .get_mut(dependent)
                        .ok_or_else(|| SluiceError::UnknownPort {
                            port: dependent.to_string(),
                        })?;
                    *deg -= 1;
                    if *deg == 0 {
                        next.push_back(dependent);
                    }
                }
            }
            layers.push(layer);
            ready = next;
        }

        if placed != self.nodes.len() {
            let remaining = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(SluiceError::CyclicWorkflow { remaining });
        }
        Ok(layers)
    }
}
