//! Deployment planning: dependency ordering and per-target step batching.
//!
//! The planner turns a desired deployment plus a merged binding state into an
//! ordered list of steps. Each step addresses one target and carries the
//! component actions for it: updates in dependency order, deletions in
//! reverse dependency order.

use std::collections::{HashMap, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ComponentSpec, DeploymentSpec, DeploymentState, is_tombstone, strip_tombstone};

/// Errors that can occur during planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The component dependency graph has a cycle or references an undeclared
    /// component.
    #[error("circular or unresolved dependencies detected in components")]
    CircularDependencies,
}

/// What to do with a component on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentAction {
    Update,
    Delete,
}

/// One component action within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStep {
    pub action: ComponentAction,
    pub component: ComponentSpec,
}

/// A per-target batch of component actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStep {
    pub target: String,
    pub role: String,
    pub components: Vec<ComponentStep>,
}

/// An ordered list of steps; no two steps share a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentPlan {
    pub steps: Vec<DeploymentStep>,
}

/// Topologically sorts components by their declared dependencies.
///
/// The sort is stable: among components whose dependencies are all satisfied,
/// solution insertion order is preserved, which makes plans deterministic.
/// Fails when the graph has a cycle or a dependency names a component that
/// does not exist.
pub fn sort_by_dependencies(components: &[ComponentSpec]) -> Result<Vec<ComponentSpec>, PlanError> {
    let index: HashMap<&str, usize> = components.iter().enumerate().map(|(i, c)| (c.name.as_str(), i)).collect();

    // Structural check first: build the graph and reject cycles and unresolved
    // names before running the stable ordering pass.
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..components.len()).map(|i| graph.add_node(i)).collect();
    for (i, component) in components.iter().enumerate() {
        for dependency in &component.dependencies {
            let &j = index.get(dependency.as_str()).ok_or(PlanError::CircularDependencies)?;
            graph.add_edge(nodes[j], nodes[i], ());
        }
    }
    toposort(&graph, None).map_err(|_| PlanError::CircularDependencies)?;

    // Kahn's algorithm with an insertion-order queue.
    let mut in_degree: Vec<usize> = components.iter().map(|c| c.dependencies.len()).collect();
    let mut queue: VecDeque<usize> = (0..components.len()).filter(|&i| in_degree[i] == 0).collect();

    let mut sorted = Vec::with_capacity(components.len());
    while let Some(next) = queue.pop_front() {
        sorted.push(components[next].clone());
        let emitted = components[next].name.as_str();
        for (i, component) in components.iter().enumerate() {
            if component.dependencies.iter().any(|d| d == emitted) {
                in_degree[i] -= 1;
                if in_degree[i] == 0 {
                    queue.push_back(i);
                }
            }
        }
    }

    if sorted.len() != components.len() {
        return Err(PlanError::CircularDependencies);
    }
    Ok(sorted)
}

/// Plans the steps for a deployment against a merged state.
///
/// For each target present in the state, the assigned components are
/// collected in dependency order and classified: `delete` when the state
/// entry is a tombstone or the component is missing from the new desired
/// spec, `update` otherwise. Deletions run in reverse dependency order, after
/// any updates for the target.
pub fn plan_for_deployment(deployment: &DeploymentSpec, state: &DeploymentState) -> Result<DeploymentPlan, PlanError> {
    let sorted = sort_by_dependencies(&state.components)?;

    let mut plan = DeploymentPlan::default();
    for target in state.targets() {
        let mut role = String::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for component in &sorted {
            let Some(bound_role) = state.role_of(&component.name, &target) else {
                continue;
            };
            if role.is_empty() {
                role = strip_tombstone(bound_role).to_string();
            }
            if is_tombstone(bound_role) || deployment.component(&component.name).is_none() {
                deletes.push(ComponentStep {
                    action: ComponentAction::Delete,
                    component: component.clone(),
                });
            } else {
                updates.push(ComponentStep {
                    action: ComponentAction::Update,
                    component: component.clone(),
                });
            }
        }

        deletes.reverse();
        let mut components = updates;
        components.append(&mut deletes);
        if components.is_empty() {
            continue;
        }

        plan.steps.push(DeploymentStep {
            target,
            role,
            components,
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, deps: &[&str]) -> ComponentSpec {
        let mut c = ComponentSpec::new(name);
        c.dependencies = deps.iter().map(|d| d.to_string()).collect();
        c
    }

    fn spec_on_target(components: Vec<ComponentSpec>, target: &str) -> DeploymentSpec {
        let mut spec = DeploymentSpec::default();
        let names = components.iter().map(|c| c.name.clone()).collect();
        spec.solution.components = components;
        spec.targets.insert(target.to_string(), Default::default());
        spec.assignments.insert(target.to_string(), names);
        spec
    }

    #[test]
    fn sort_keeps_insertion_order_without_dependencies() {
        let components = vec![component("c", &[]), component("a", &[]), component("b", &[])];
        let sorted = sort_by_dependencies(&components).unwrap();
        let names: Vec<&str> = sorted.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn sort_respects_dependencies() {
        let components = vec![component("app", &["db", "cache"]), component("db", &[]), component("cache", &[])];
        let sorted = sort_by_dependencies(&components).unwrap();
        let pos = |name: &str| sorted.iter().position(|c| c.name == name).unwrap();
        assert!(pos("db") < pos("app"));
        assert!(pos("cache") < pos("app"));
    }

    #[test]
    fn sort_returns_all_components_when_acyclic() {
        let components = vec![
            component("a", &[]),
            component("b", &["a"]),
            component("c", &["b"]),
            component("d", &["a"]),
        ];
        assert_eq!(sort_by_dependencies(&components).unwrap().len(), 4);
    }

    #[test]
    fn sort_rejects_cycles() {
        let components = vec![component("a", &["b"]), component("b", &["a"])];
        let err = sort_by_dependencies(&components).unwrap_err();
        assert!(err.to_string().contains("circular or unresolved dependencies"));
    }

    #[test]
    fn sort_rejects_unresolved_dependency_names() {
        let components = vec![component("a", &["ghost"])];
        let err = sort_by_dependencies(&components).unwrap_err();
        assert!(err.to_string().contains("circular or unresolved dependencies"));
    }

    #[test]
    fn plan_single_target_in_dependency_order() {
        let spec = spec_on_target(vec![component("a", &[]), component("b", &["a"])], "t1");
        let state = DeploymentState::new(&spec);

        let plan = plan_for_deployment(&spec, &state).unwrap();
        assert_eq!(plan.steps.len(), 1);

        let step = &plan.steps[0];
        assert_eq!(step.target, "t1");
        assert_eq!(step.role, "container");
        let actions: Vec<(&str, ComponentAction)> = step
            .components
            .iter()
            .map(|c| (c.component.name.as_str(), c.action))
            .collect();
        assert_eq!(
            actions,
            vec![("a", ComponentAction::Update), ("b", ComponentAction::Update)]
        );
    }

    #[test]
    fn plan_batches_one_step_per_target() {
        let mut spec = spec_on_target(vec![component("a", &[]), component("b", &[])], "t1");
        spec.targets.insert("t2".to_string(), Default::default());
        spec.assignments.insert("t2".to_string(), vec!["a".to_string()]);
        let state = DeploymentState::new(&spec);

        let plan = plan_for_deployment(&spec, &state).unwrap();
        assert_eq!(plan.steps.len(), 2);
        let mut targets: Vec<&str> = plan.steps.iter().map(|s| s.target.as_str()).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec!["t1", "t2"]);
    }

    #[test]
    fn plan_emits_deletes_in_reverse_dependency_order() {
        let spec = spec_on_target(vec![component("a", &[]), component("b", &["a"])], "t1");
        let mut state = DeploymentState::new(&spec);
        state.mark_remove_all();

        let plan = plan_for_deployment(&spec, &state).unwrap();
        let step = &plan.steps[0];
        let actions: Vec<(&str, ComponentAction)> = step
            .components
            .iter()
            .map(|c| (c.component.name.as_str(), c.action))
            .collect();
        assert_eq!(
            actions,
            vec![("b", ComponentAction::Delete), ("a", ComponentAction::Delete)]
        );
    }

    #[test]
    fn plan_deletes_components_dropped_from_spec() {
        // State still knows component "old", the new spec no longer declares it.
        let spec = spec_on_target(vec![component("a", &[])], "t1");
        let mut state = DeploymentState::new(&spec);
        state.components.push(component("old", &[]));
        state
            .target_component
            .insert(crate::model::target_key("old", "t1"), "container".into());

        let plan = plan_for_deployment(&spec, &state).unwrap();
        let step = &plan.steps[0];
        let old = step.components.iter().find(|c| c.component.name == "old").unwrap();
        assert_eq!(old.action, ComponentAction::Delete);
        let a = step.components.iter().find(|c| c.component.name == "a").unwrap();
        assert_eq!(a.action, ComponentAction::Update);
    }

    #[test]
    fn plan_cycle_fails_with_known_error() {
        let spec = spec_on_target(vec![component("a", &["b"]), component("b", &["a"])], "t1");
        let mut state = DeploymentState::default();
        state.components = spec.solution.components.clone();

        let err = plan_for_deployment(&spec, &state).unwrap_err();
        assert!(err.to_string().contains("circular or unresolved dependencies"));
    }

    #[test]
    fn plan_skips_targets_with_no_assigned_components() {
        let spec = spec_on_target(vec![component("a", &[])], "t1");
        let state = DeploymentState::default();
        let plan = plan_for_deployment(&spec, &state).unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        let spec = spec_on_target(
            vec![component("a", &[]), component("b", &["a"]), component("c", &["a"])],
            "t1",
        );
        let state = DeploymentState::new(&spec);

        let first = plan_for_deployment(&spec, &state).unwrap();
        let second = plan_for_deployment(&spec, &state).unwrap();
        assert_eq!(first, second);
    }
}
