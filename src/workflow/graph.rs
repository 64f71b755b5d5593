/// Petgraph-based step dependency graph
///
/// Builds a directed graph from a workflow definition's implicit dependency
/// edges (spec references to upstream outputs) and validates it before any
/// run is created: duplicate names, references to unknown steps, and cycles
/// are all definition-time errors that never reach execution.

use crate::workflow::expr::{self, ExprError};
use crate::workflow::types::WorkflowDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors detected while validating a workflow definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),
    #[error("duplicate trigger name '{0}'")]
    DuplicateTrigger(String),
    #[error("step '{step}' references unknown step '{referenced}'")]
    UnknownStepReference { step: String, referenced: String },
    #[error("workflow contains a dependency cycle")]
    Cycle,
    #[error("invalid expression in step '{step}': {source}")]
    Expression { step: String, source: ExprError },
}

/// Validated dependency graph over a workflow's steps
///
/// Edges point from a dependency to its dependents, so graph traversal in
/// edge direction walks "downstream". Maintains bidirectional name/index
/// maps for efficient lookups, like the execution engine needs.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    /// Direct dependencies per step, extracted from spec references
    dependencies: HashMap<String, HashSet<String>>,
}

impl StepGraph {
    /// Build and validate the dependency graph for a definition
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for step in &definition.steps {
            if name_to_index.contains_key(&step.name) {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
            let index = graph.add_node(step.name.clone());
            name_to_index.insert(step.name.clone(), index);
        }

        let mut trigger_names = HashSet::new();
        for trigger in &definition.triggers {
            if !trigger_names.insert(trigger.name.clone()) {
                return Err(DefinitionError::DuplicateTrigger(trigger.name.clone()));
            }
        }

        // Extract implicit edges from ${outputs.<step>.<key>} references
        let mut dependencies = HashMap::new();
        for step in &definition.steps {
            let referenced =
                expr::referenced_steps(&step.spec).map_err(|source| DefinitionError::Expression {
                    step: step.name.clone(),
                    source,
                })?;

            for dependency in &referenced {
                let from = name_to_index.get(dependency).ok_or_else(|| {
                    DefinitionError::UnknownStepReference {
                        step: step.name.clone(),
                        referenced: dependency.clone(),
                    }
                })?;
                let to = name_to_index[&step.name];
                graph.add_edge(*from, to, ());
            }
            dependencies.insert(step.name.clone(), referenced);
        }

        // Reject cycles before anything becomes runnable
        if toposort(&graph, None).is_err() {
            return Err(DefinitionError::Cycle);
        }

        Ok(Self {
            graph,
            name_to_index,
            dependencies,
        })
    }

    /// Step names in the graph
    pub fn step_names(&self) -> impl Iterator<Item = &String> {
        self.name_to_index.keys()
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step: &str) -> &HashSet<String> {
        static EMPTY: OnceLock<HashSet<String>> = OnceLock::new();
        self.dependencies
            .get(step)
            .unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    /// All transitive dependents of a step, found with BFS over out-edges
    ///
    /// Used to propagate Skipped to every descendant of a failed or skipped
    /// step. The walk is deterministic and idempotent over the same graph.
    pub fn descendants(&self, step: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let Some(&start) = self.name_to_index.get(step) else {
            return reachable;
        };

        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut visited = HashSet::new();
        visited.insert(start);

        while let Some(current) = queue.pop_front() {
            let mut neighbors = self.graph.neighbors(current).detach();
            while let Some(target) = neighbors.next_node(&self.graph) {
                if visited.insert(target) {
                    reachable.insert(self.graph[target].clone());
                    queue.push_back(target);
                }
            }
        }

        reachable
    }
}
