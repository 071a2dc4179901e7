//! Step dependency graph and level scheduler.
//!
//! Builds a `predecessor → successors` adjacency list and per-step in-degree
//! from each step's `depends` list, detects cycles via DFS, and peels
//! zero-in-degree steps into dependency levels (Kahn's algorithm).
//!
//! A dependency id with no matching step still contributes an edge and an
//! in-degree increment but is never itself scheduled; the dependent step can
//! then never reach zero in-degree and is silently absent from the output.
//! Cross-checking that every referenced id exists happens earlier, at
//! configuration-build time.

use std::collections::{HashMap, HashSet};

use crate::model::{assign_step_ids, validate_step_ids, Autopilot, ExecutionPlan, Step};

/// Dependency graph over one autopilot's steps.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    /// Real step ids in declaration order (used for deterministic output).
    order: Vec<String>,
    /// `predecessor id → dependent ids`. Keys may name dangling predecessors.
    successors: HashMap<String, Vec<String>>,
    /// In-degree per real step id.
    in_degree: HashMap<String, usize>,
}

impl StepGraph {
    /// Build the graph from the flat step list of one autopilot.
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a Step>) -> Self {
        let mut graph = StepGraph::default();
        for step in steps {
            graph.order.push(step.id.clone());
            graph.in_degree.entry(step.id.clone()).or_insert(0);
            for dep in &step.depends {
                graph
                    .successors
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
                *graph.in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }
        graph
    }

    /// Depth-first cycle check: a back-edge into a node still on the
    /// recursion stack signals a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        for id in &self.order {
            if !visited.contains(id.as_str())
                && self.dfs(id.as_str(), &mut visited, &mut on_stack)
            {
                return true;
            }
        }
        false
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(node);
        on_stack.insert(node);
        if let Some(successors) = self.successors.get(node) {
            for succ in successors {
                if on_stack.contains(succ.as_str()) {
                    return true;
                }
                if !visited.contains(succ.as_str())
                    && self.dfs(succ.as_str(), visited, on_stack)
                {
                    return true;
                }
            }
        }
        on_stack.remove(node);
        false
    }

    /// Breadth-first peel of zero-in-degree steps, one level per peel.
    ///
    /// Steps within a level are mutually independent and emitted together in
    /// declaration order. Steps blocked by a dangling dependency never reach
    /// zero in-degree and are omitted.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut in_degree = self.in_degree.clone();
        let mut levels = Vec::new();
        let mut remaining: Vec<&String> = self.order.iter().collect();

        loop {
            let (ready, blocked): (Vec<&String>, Vec<&String>) = remaining
                .into_iter()
                .partition(|id| in_degree.get(id.as_str()).copied() == Some(0));
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                if let Some(successors) = self.successors.get(id.as_str()) {
                    for succ in successors {
                        if let Some(deg) = in_degree.get_mut(succ.as_str()) {
                            *deg -= 1;
                        }
                    }
                }
            }
            levels.push(ready.into_iter().cloned().collect());
            remaining = blocked;
        }
        levels
    }
}

/// Reorder an autopilot's steps into dependency levels.
///
/// Returns an error message when the dependency graph is cyclic; the caller
/// attaches it as a validation error so the autopilot never executes.
pub fn schedule_autopilot(autopilot: &mut Autopilot) -> Result<(), String> {
    let graph = StepGraph::from_steps(autopilot.all_steps());
    if graph.has_cycle() {
        return Err(format!(
            "autopilot '{}' has a step dependency cycle",
            autopilot.name
        ));
    }
    let mut by_id: HashMap<String, Step> = autopilot
        .steps
        .drain(..)
        .flatten()
        .map(|s| (s.id.clone(), s))
        .collect();
    autopilot.steps = graph
        .levels()
        .into_iter()
        .map(|level| level.into_iter().filter_map(|id| by_id.remove(&id)).collect())
        .collect();
    Ok(())
}

/// Pre-execution transform: assign step ids, validate them, and level every
/// autopilot's steps. Problems become validation errors on the owning check.
pub fn prepare_plan(plan: &mut ExecutionPlan) {
    for check in &mut plan.autopilot_checks {
        if let Err(err) = assign_step_ids(&mut check.autopilot) {
            check.validation_errors.push(err.to_string());
            continue;
        }
        let id_errors = validate_step_ids(&check.autopilot);
        if !id_errors.is_empty() {
            check.validation_errors.extend(id_errors);
            continue;
        }
        if let Err(err) = schedule_autopilot(&mut check.autopilot) {
            check.validation_errors.push(err);
        }
    }
}
