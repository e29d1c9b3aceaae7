//! Dependency graph representation for level-based execution.
//!
//! This module provides a directed graph of step dependencies and the Kahn-style
//! leveling that partitions it into groups of steps that can run concurrently.

use crate::plan::StepId;
use std::collections::{BTreeMap, BTreeSet};

/// A directed graph representing step dependencies.
///
/// The graph maintains both forward edges (dependencies) and reverse edges (dependents)
/// for efficient traversal in both directions. This is crucial for:
/// - Computing execution levels
/// - Propagating failures to dependent steps
///
/// References to ids that are not nodes of the graph are kept aside as *missing*
/// dependencies instead of creating phantom nodes.
///
/// # Examples
///
/// ```ignore
/// use plan_runtime::executor::DependencyGraph;
///
/// let mut graph = DependencyGraph::new();
/// graph.add_node(1);
/// graph.add_node(2);
/// graph.add_dependency(2, 1); // step 2 depends on step 1
///
/// assert!(graph.get_dependencies(2).contains(&1));
/// assert!(graph.get_dependents(1).contains(&2));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Forward edges: step_id -> set of step_ids it depends on
    nodes: BTreeMap<StepId, BTreeSet<StepId>>,
    /// Reverse edges: step_id -> set of step_ids that depend on it
    reverse_edges: BTreeMap<StepId, BTreeSet<StepId>>,
    /// step_id -> referenced ids that are not part of the graph
    missing: BTreeMap<StepId, BTreeSet<StepId>>,
    /// step_id -> references whose id does not fit a step id
    unknown_references: BTreeMap<StepId, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the graph without any dependencies.
    ///
    /// If the node already exists, this is a no-op.
    pub fn add_node(&mut self, step_id: StepId) {
        self.nodes.entry(step_id).or_default();
        self.reverse_edges.entry(step_id).or_default();
    }

    pub fn contains(&self, step_id: StepId) -> bool {
        self.nodes.contains_key(&step_id)
    }

    /// Adds a dependency edge: `step_id` depends on `depends_on`.
    ///
    /// Both nodes are created if they don't exist.
    pub fn add_dependency(&mut self, step_id: StepId, depends_on: StepId) {
        self.nodes.entry(step_id).or_default().insert(depends_on);
        self.nodes.entry(depends_on).or_default();

        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(step_id);
        self.reverse_edges.entry(step_id).or_default();
    }

    /// Records that `step_id` references `unknown`, an id that is not a node.
    pub fn add_missing_dependency(&mut self, step_id: StepId, unknown: StepId) {
        self.add_node(step_id);
        self.missing.entry(step_id).or_default().insert(unknown);
    }

    /// Returns the set of step IDs that the given step depends on.
    pub fn get_dependencies(&self, step_id: StepId) -> BTreeSet<StepId> {
        self.nodes.get(&step_id).cloned().unwrap_or_default()
    }

    /// Returns the set of step IDs that depend on the given step.
    pub fn get_dependents(&self, step_id: StepId) -> BTreeSet<StepId> {
        self.reverse_edges
            .get(&step_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the ids referenced by `step_id` that are not part of the graph.
    pub fn missing_dependencies(&self, step_id: StepId) -> BTreeSet<StepId> {
        self.missing.get(&step_id).cloned().unwrap_or_default()
    }

    /// Records a reference in `step_id` whose step id cannot name any step.
    pub fn add_unknown_reference(&mut self, step_id: StepId, raw: impl Into<String>) {
        self.add_node(step_id);
        self.unknown_references
            .entry(step_id)
            .or_default()
            .insert(raw.into());
    }

    /// Returns the unparsable references recorded for `step_id`, as written.
    pub fn unknown_references(&self, step_id: StepId) -> Vec<String> {
        self.unknown_references
            .get(&step_id)
            .map(|refs| refs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns all step IDs that have zero dependencies, in ascending order.
    pub fn get_zero_dependency_steps(&self) -> Vec<StepId> {
        self.nodes
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Detects if the graph contains any cycles.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Returns the members of one dependency cycle, in ascending order.
    ///
    /// Uses depth-first search with an explicit path; a back edge to a node on the
    /// current path closes the cycle.
    pub fn find_cycle(&self) -> Option<Vec<StepId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();

        for node in self.nodes.keys() {
            if let Some(mut cycle) = self.find_cycle_dfs(*node, &mut visited, &mut path) {
                cycle.sort_unstable();
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_dfs(
        &self,
        node: StepId,
        visited: &mut BTreeSet<StepId>,
        path: &mut Vec<StepId>,
    ) -> Option<Vec<StepId>> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            return Some(path[pos..].to_vec());
        }
        if !visited.insert(node) {
            return None;
        }

        path.push(node);
        if let Some(deps) = self.nodes.get(&node) {
            for dep in deps {
                if let Some(cycle) = self.find_cycle_dfs(*dep, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    /// Partitions the graph into execution levels.
    ///
    /// A step's level is one more than the highest level among its dependencies;
    /// steps without dependencies form level 0. Ids within a level are ascending.
    /// Returns `None` if the graph has a cycle.
    pub fn levels(&self) -> Option<Vec<Vec<StepId>>> {
        let mut in_degree: BTreeMap<StepId, usize> = self
            .nodes
            .iter()
            .map(|(id, deps)| (*id, deps.len()))
            .collect();
        let mut current = self.get_zero_dependency_steps();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.get_dependents(*id) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            placed += current.len();
            levels.push(current);
            current = next.into_iter().collect();
        }

        (placed == self.nodes.len()).then_some(levels)
    }
}
