//! Dependency analysis for plans.
//!
//! Builds the execution dependency graph from a step list: the explicit
//! `dependencies` field of each step, unioned with every step referenced through
//! `$stepN` syntax anywhere inside its parameters.

use super::DependencyGraph;
use super::error::ExecutorError;
use super::template::{referenced_steps, unparsable_references};
use crate::plan::{Step, StepId};
use std::collections::BTreeSet;

/// Step ids grouped into levels; every level only depends on earlier ones.
pub type ExecutionLevels = Vec<Vec<StepId>>;

/// Returns the step ids referenced by `step`'s parameters.
pub fn implicit_dependencies(step: &Step) -> BTreeSet<StepId> {
    step.parameters.values().flat_map(referenced_steps).collect()
}

/// Builds the dependency graph for `steps`.
///
/// References to ids that are not in `steps`, or whose id cannot name a step at all,
/// are recorded against the referencing step rather than failing the run; the
/// executor fails that step alone. A step referencing itself is a cycle.
///
/// # Errors
///
/// Returns [`ExecutorError::Structural`] if the graph contains a cycle.
pub fn analyze(steps: &[Step]) -> Result<DependencyGraph, ExecutorError> {
    let mut graph = DependencyGraph::new();
    let known: BTreeSet<StepId> = steps.iter().map(|s| s.id).collect();

    for step in steps {
        graph.add_node(step.id);
    }

    for step in steps {
        let explicit = step.dependencies.iter().copied();
        let implicit = implicit_dependencies(step);

        for dep in explicit.chain(implicit) {
            if known.contains(&dep) {
                graph.add_dependency(step.id, dep);
            } else {
                tracing::warn!(
                    step_id = step.id,
                    dependency = dep,
                    "Step references a step that is not part of the plan"
                );
                graph.add_missing_dependency(step.id, dep);
            }
        }

        for raw in step.parameters.values().flat_map(unparsable_references) {
            tracing::warn!(
                step_id = step.id,
                reference = %raw,
                "Step references a step id that is out of range"
            );
            graph.add_unknown_reference(step.id, raw);
        }
    }

    if let Some(cycle) = graph.find_cycle() {
        tracing::error!(?cycle, "Cyclic dependency detected in plan");
        return Err(ExecutorError::cycle(cycle));
    }

    Ok(graph)
}

/// Partitions `steps` into execution levels using `graph`.
///
/// Steps missing from `graph` are placed in level 0.
///
/// # Errors
///
/// Returns [`ExecutorError::Structural`] if leveling cannot terminate.
pub fn level(steps: &[Step], graph: &DependencyGraph) -> Result<ExecutionLevels, ExecutorError> {
    let mut graph = graph.clone();
    for step in steps {
        graph.add_node(step.id);
    }

    match graph.levels() {
        Some(levels) => Ok(levels),
        None => Err(ExecutorError::cycle(graph.find_cycle().unwrap_or_default())),
    }
}
