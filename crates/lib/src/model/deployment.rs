//! Deployment specification types.
//!
//! A [`DeploymentSpec`] is the immutable-per-call input to the reconciler: an
//! instance identity, a solution (the ordered component list), the targets it
//! lands on, and the component-to-target assignments. Everything here is pure
//! data; behavior lives in the planner and the manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Component type used when a component declares none.
pub const DEFAULT_COMPONENT_TYPE: &str = "container";

/// A unit of deployable work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub properties: BTreeMap<String, Value>,
    pub dependencies: Vec<String>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The role this component binds under: its type, defaulting to
    /// `"container"` when empty.
    pub fn role(&self) -> &str {
        if self.component_type.is_empty() {
            DEFAULT_COMPONENT_TYPE
        } else {
            &self.component_type
        }
    }
}

/// Identity of a deployment instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceSpec {
    pub name: String,
    pub scope: String,
    /// Echoed into the persisted summary so watchers can correlate to their
    /// own observed object versions.
    pub generation: String,
    pub metadata: BTreeMap<String, String>,
}

/// A named, ordered collection of components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolutionSpec {
    pub metadata: BTreeMap<String, String>,
    pub components: Vec<ComponentSpec>,
}

/// One provider binding on a target: which provider serves which role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingSpec {
    pub role: String,
    pub provider: String,
    pub config: BTreeMap<String, String>,
}

/// A group of provider bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologySpec {
    pub bindings: Vec<BindingSpec>,
}

/// An execution environment addressed by role-specific providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetState {
    pub metadata: BTreeMap<String, String>,
    pub properties: BTreeMap<String, Value>,
    /// Components hosted on the target itself (e.g. an agent process), as
    /// opposed to solution components assigned to it.
    pub components: Vec<ComponentSpec>,
    pub topologies: Vec<TopologySpec>,
}

/// The desired deployment of a solution onto a set of targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSpec {
    pub instance: InstanceSpec,
    pub solution: SolutionSpec,
    pub targets: BTreeMap<String, TargetState>,
    /// Component-to-target bindings: target name to the solution component
    /// names assigned to it.
    pub assignments: BTreeMap<String, Vec<String>>,
    /// The target the current step executes against; set by the reconciler
    /// while it walks the plan.
    pub active_target: String,
}

impl DeploymentSpec {
    /// The solution component with the given name, if declared.
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.solution.components.iter().find(|c| c.name == name)
    }

    /// Whether a component name is assigned to a target.
    pub fn is_assigned(&self, component: &str, target: &str) -> bool {
        self
            .assignments
            .get(target)
            .is_some_and(|names| names.iter().any(|n| n == component))
    }
}
