//! Target provider drivers.
//!
//! A provider drives one target: it observes what is deployed, applies step
//! actions, and answers comparison questions through its validation rule.
//! Provider selection is polymorphic over role strings: a target declares
//! which provider serves which role in its topology bindings, and the
//! registry constructs the matching driver.

pub mod mock;
pub mod mqtt;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use maestro_core::{Result, StatusError};

use crate::model::{BindingSpec, ComponentResultSpec, ComponentSpec, DeploymentSpec, TargetState};
use crate::planner::{ComponentStep, DeploymentStep};

pub use mock::MockTargetProvider;
pub use mqtt::{MqttTargetProvider, MqttTargetProviderConfig};

/// Decides whether a component changed enough to need a fresh apply.
pub trait ValidationRule: Send + Sync {
    fn is_component_changed(&self, previous: &ComponentSpec, next: &ComponentSpec) -> bool;
}

/// The default rule: a component changed when its name, type, or properties
/// differ.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertyChangeRule;

impl ValidationRule for PropertyChangeRule {
    fn is_component_changed(&self, previous: &ComponentSpec, next: &ComponentSpec) -> bool {
        previous.name != next.name || previous.role() != next.role() || previous.properties != next.properties
    }
}

/// Uniform contract for driving one target.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    /// Observes the components currently deployed on the target. Idempotent;
    /// implementations must time-bound their wait.
    async fn get(&self, deployment: &DeploymentSpec, references: &[ComponentStep]) -> Result<Vec<ComponentSpec>>;

    /// Applies a step's component actions. Not idempotent; the caller may
    /// retry on error.
    async fn apply(
        &self,
        deployment: &DeploymentSpec,
        step: &DeploymentStep,
        is_dry_run: bool,
    ) -> Result<BTreeMap<String, ComponentResultSpec>>;

    /// Removes the referenced components. Idempotent, at-least-once.
    async fn remove(&self, deployment: &DeploymentSpec, current_ref: &[ComponentSpec]) -> Result<()>;

    /// Pure comparison of desired vs current. Defaults to `false` on
    /// transport failure.
    async fn needs_update(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool;

    /// Pure comparison of desired vs current for removal. Defaults to `false`
    /// on transport failure.
    async fn needs_remove(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool;

    /// The provider's change-detection rule. Deterministic.
    fn validation_rule(&self) -> Arc<dyn ValidationRule>;
}

/// Constructs a provider instance from a target's binding.
pub type ProviderFactory = Arc<dyn Fn(&BindingSpec) -> Result<Arc<dyn TargetProvider>> + Send + Sync>;

/// Registry of provider factories keyed by provider name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a provider name (e.g.
    /// `"providers.target.mock"`).
    pub fn register(&mut self, provider: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(provider.into(), factory);
    }

    /// Constructs the provider serving `role` on the given target.
    ///
    /// Scans the target's topology bindings for a role match (`"*"` binds any
    /// role) and invokes the registered factory for the bound provider name.
    pub fn create_for_target_role(&self, role: &str, target: &TargetState) -> Result<Arc<dyn TargetProvider>> {
        for topology in &target.topologies {
            for binding in &topology.bindings {
                if binding.role == role || binding.role == "*" {
                    let factory = self.factories.get(&binding.provider).ok_or_else(|| {
                        StatusError::bad_config(format!("provider '{}' is not registered", binding.provider))
                    })?;
                    return factory(binding);
                }
            }
        }
        Err(StatusError::bad_config(format!(
            "target doesn't have a provider with role '{}'",
            role
        )))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TopologySpec;
    use serde_json::json;

    fn target_with_binding(role: &str, provider: &str) -> TargetState {
        TargetState {
            topologies: vec![TopologySpec {
                bindings: vec![BindingSpec {
                    role: role.to_string(),
                    provider: provider.to_string(),
                    config: BTreeMap::new(),
                }],
            }],
            ..Default::default()
        }
    }

    fn mock_registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "providers.target.mock",
            Arc::new(|_binding| Ok(Arc::new(MockTargetProvider::new()) as Arc<dyn TargetProvider>)),
        );
        registry
    }

    #[test]
    fn registry_resolves_role_binding() {
        let registry = mock_registry();
        let target = target_with_binding("container", "providers.target.mock");
        assert!(registry.create_for_target_role("container", &target).is_ok());
    }

    #[test]
    fn registry_wildcard_binding_matches_any_role() {
        let registry = mock_registry();
        let target = target_with_binding("*", "providers.target.mock");
        assert!(registry.create_for_target_role("helm.v3", &target).is_ok());
    }

    #[test]
    fn registry_missing_role_is_bad_config() {
        let registry = mock_registry();
        let target = target_with_binding("container", "providers.target.mock");
        let err = match registry.create_for_target_role("helm.v3", &target) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status, maestro_core::Status::BadConfig);
    }

    #[test]
    fn registry_unknown_provider_is_bad_config() {
        let registry = ProviderRegistry::new();
        let target = target_with_binding("container", "providers.target.unknown");
        let err = match registry.create_for_target_role("container", &target) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status, maestro_core::Status::BadConfig);
    }

    #[test]
    fn property_change_rule_detects_property_changes() {
        let rule = PropertyChangeRule;
        let mut previous = ComponentSpec::new("web");
        previous.properties.insert("container.image".into(), json!("web:1"));
        let mut next = previous.clone();
        assert!(!rule.is_component_changed(&previous, &next));

        next.properties.insert("container.image".into(), json!("web:2"));
        assert!(rule.is_component_changed(&previous, &next));
    }

    #[test]
    fn property_change_rule_treats_default_type_as_container() {
        let rule = PropertyChangeRule;
        let previous = ComponentSpec::new("web");
        let mut next = ComponentSpec::new("web");
        next.component_type = "container".into();
        assert!(!rule.is_component_changed(&previous, &next));
    }
}
