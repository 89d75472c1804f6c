//! Deployment state: which component is bound to which target, and as what.
//!
//! The state is a flat mapping from `"<component>::<target>"` keys to role
//! tags. A role prefixed with `"-"` is a tombstone: the pair is scheduled for
//! removal. That encoding is this module's private vocabulary; everything
//! else goes through [`target_key`], [`tombstone`], [`is_tombstone`], and
//! [`strip_tombstone`] so the convention cannot drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::deployment::{ComponentSpec, DeploymentSpec};

/// Separator between the component and target halves of a state key.
const KEY_SEPARATOR: &str = "::";

/// Tombstone marker prefix on a role.
const TOMBSTONE_PREFIX: char = '-';

/// The state key for a `(component, target)` pair.
pub fn target_key(component: &str, target: &str) -> String {
    format!("{}{}{}", component, KEY_SEPARATOR, target)
}

/// Splits a state key back into `(component, target)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
}

/// Marks a role for removal. Already-tombstoned roles are left as they are.
pub fn tombstone(role: &str) -> String {
    if is_tombstone(role) {
        role.to_string()
    } else {
        format!("{}{}", TOMBSTONE_PREFIX, role)
    }
}

/// Whether a role is a tombstone.
pub fn is_tombstone(role: &str) -> bool {
    role.starts_with(TOMBSTONE_PREFIX)
}

/// The role with any tombstone marker removed.
pub fn strip_tombstone(role: &str) -> &str {
    role.strip_prefix(TOMBSTONE_PREFIX).unwrap_or(role)
}

/// The component-to-target binding state of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentState {
    /// The components known to this state, in solution order. Carries
    /// components that have since been dropped from the desired spec so the
    /// planner can still emit deletions for them.
    pub components: Vec<ComponentSpec>,

    /// `"<component>::<target>"` to role tag. Absence of a key means "not
    /// assigned, not known".
    pub target_component: BTreeMap<String, String>,
}

impl DeploymentState {
    /// Seeds a state from a deployment spec: one entry per declared
    /// `(component, target)` assignment, tagged with the component's role.
    pub fn new(spec: &DeploymentSpec) -> Self {
        let mut target_component = BTreeMap::new();
        for component in &spec.solution.components {
            for target in spec.targets.keys() {
                if spec.is_assigned(&component.name, target) {
                    target_component.insert(target_key(&component.name, target), component.role().to_string());
                }
            }
        }
        Self {
            components: spec.solution.components.clone(),
            target_component,
        }
    }

    /// Merges two states: the union of both, with `b` winning on collision,
    /// except that an empty assignment in `b` does not overwrite a tombstone
    /// in `a` (a pending removal survives an observation gap).
    pub fn merge(a: &DeploymentState, b: &DeploymentState) -> DeploymentState {
        let mut target_component = a.target_component.clone();
        for (key, role) in &b.target_component {
            let keeps_tombstone = role.is_empty()
                && target_component
                    .get(key)
                    .is_some_and(|existing| is_tombstone(existing));
            if !keeps_tombstone {
                target_component.insert(key.clone(), role.clone());
            }
        }

        let mut components = a.components.clone();
        for component in &b.components {
            match components.iter_mut().find(|c| c.name == component.name) {
                Some(existing) => *existing = component.clone(),
                None => components.push(component.clone()),
            }
        }

        DeploymentState {
            components,
            target_component,
        }
    }

    /// Turns the whole state into a removal plan by tombstoning every role.
    pub fn mark_remove_all(&mut self) {
        for role in self.target_component.values_mut() {
            *role = tombstone(role);
        }
    }

    /// Drops every tombstoned entry.
    pub fn clear_all_removed(&mut self) {
        self.target_component.retain(|_, role| !is_tombstone(role));
    }

    /// The role bound for a `(component, target)` pair, if any.
    pub fn role_of(&self, component: &str, target: &str) -> Option<&str> {
        self.target_component.get(&target_key(component, target)).map(String::as_str)
    }

    /// The distinct target names present in the state, in key order.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for key in self.target_component.keys() {
            if let Some((_, target)) = split_key(key) {
                if !targets.iter().any(|t| t == target) {
                    targets.push(target.to_string());
                }
            }
        }
        targets
    }
}

/// The persisted record of the last accepted desired state, used for diffing
/// on the next reconcile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolutionManagerDeploymentState {
    pub spec: DeploymentSpec,
    pub state: DeploymentState,
}
