//! In-memory target provider.
//!
//! Keeps the applied components in memory and serves `get` from that record.
//! Used as the registry's simplest role driver and as the test double for the
//! reconciliation core.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use maestro_core::{Result, Status};
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{ComponentResultSpec, ComponentSpec, DeploymentSpec};
use crate::planner::{ComponentAction, ComponentStep, DeploymentStep};

use super::{PropertyChangeRule, TargetProvider, ValidationRule};

#[derive(Debug, Default)]
struct MockRecord {
    deployed: Vec<ComponentSpec>,
    last_step: Option<DeploymentStep>,
    get_calls: usize,
    apply_calls: usize,
    remove_calls: usize,
}

/// A provider that deploys into memory.
#[derive(Debug, Default)]
pub struct MockTargetProvider {
    record: Mutex<MockRecord>,
}

impl MockTargetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The components currently "deployed" on this provider.
    pub async fn deployed(&self) -> Vec<ComponentSpec> {
        self.record.lock().await.deployed.clone()
    }

    /// Pre-seeds the deployed record, for tests that start from an observed
    /// state.
    pub async fn seed(&self, components: Vec<ComponentSpec>) {
        self.record.lock().await.deployed = components;
    }

    /// Number of `apply` calls made against this provider.
    pub async fn apply_calls(&self) -> usize {
        self.record.lock().await.apply_calls
    }

    /// Number of `get` calls made against this provider.
    pub async fn get_calls(&self) -> usize {
        self.record.lock().await.get_calls
    }

    /// The most recent step passed to `apply`.
    pub async fn last_step(&self) -> Option<DeploymentStep> {
        self.record.lock().await.last_step.clone()
    }
}

#[async_trait]
impl TargetProvider for MockTargetProvider {
    async fn get(&self, _deployment: &DeploymentSpec, _references: &[ComponentStep]) -> Result<Vec<ComponentSpec>> {
        let mut record = self.record.lock().await;
        record.get_calls += 1;
        Ok(record.deployed.clone())
    }

    async fn apply(
        &self,
        deployment: &DeploymentSpec,
        step: &DeploymentStep,
        is_dry_run: bool,
    ) -> Result<BTreeMap<String, ComponentResultSpec>> {
        let mut record = self.record.lock().await;
        record.apply_calls += 1;
        record.last_step = Some(step.clone());

        let mut results = BTreeMap::new();
        for component_step in &step.components {
            let name = component_step.component.name.clone();
            if !is_dry_run {
                match component_step.action {
                    ComponentAction::Update => {
                        match record.deployed.iter_mut().find(|c| c.name == name) {
                            Some(existing) => *existing = component_step.component.clone(),
                            None => record.deployed.push(component_step.component.clone()),
                        }
                    }
                    ComponentAction::Delete => {
                        record.deployed.retain(|c| c.name != name);
                    }
                }
            }
            results.insert(
                name,
                ComponentResultSpec {
                    status: Status::Ok,
                    message: String::new(),
                },
            );
        }

        debug!(
            instance = %deployment.instance.name,
            target = %step.target,
            components = step.components.len(),
            "mock apply"
        );
        Ok(results)
    }

    async fn remove(&self, _deployment: &DeploymentSpec, current_ref: &[ComponentSpec]) -> Result<()> {
        let mut record = self.record.lock().await;
        record.remove_calls += 1;
        record.deployed.retain(|c| !current_ref.iter().any(|r| r.name == c.name));
        Ok(())
    }

    async fn needs_update(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool {
        let rule = PropertyChangeRule;
        if desired.len() != current.len() {
            return true;
        }
        desired.iter().any(|d| {
            current
                .iter()
                .find(|c| c.name == d.name)
                .is_none_or(|c| rule.is_component_changed(c, d))
        })
    }

    async fn needs_remove(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool {
        current.iter().any(|c| desired.iter().any(|d| d.name == c.name))
    }

    fn validation_rule(&self) -> Arc<dyn ValidationRule> {
        Arc::new(PropertyChangeRule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_of(actions: &[(&str, ComponentAction)]) -> DeploymentStep {
        DeploymentStep {
            target: "t".into(),
            role: "container".into(),
            components: actions
                .iter()
                .map(|(name, action)| ComponentStep {
                    action: *action,
                    component: ComponentSpec::new(*name),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn apply_records_updates() {
        let provider = MockTargetProvider::new();
        let step = step_of(&[("a", ComponentAction::Update), ("b", ComponentAction::Update)]);

        let results = provider.apply(&DeploymentSpec::default(), &step, false).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.status == Status::Ok));

        let deployed = provider.deployed().await;
        assert_eq!(deployed.len(), 2);
    }

    #[tokio::test]
    async fn apply_delete_removes_components() {
        let provider = MockTargetProvider::new();
        provider.seed(vec![ComponentSpec::new("a"), ComponentSpec::new("b")]).await;

        let step = step_of(&[("a", ComponentAction::Delete)]);
        provider.apply(&DeploymentSpec::default(), &step, false).await.unwrap();

        let deployed = provider.deployed().await;
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].name, "b");
    }

    #[tokio::test]
    async fn dry_run_does_not_mutate() {
        let provider = MockTargetProvider::new();
        let step = step_of(&[("a", ComponentAction::Update)]);

        let results = provider.apply(&DeploymentSpec::default(), &step, true).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(provider.deployed().await.is_empty());
    }

    #[tokio::test]
    async fn get_serves_recorded_components() {
        let provider = MockTargetProvider::new();
        provider.seed(vec![ComponentSpec::new("a")]).await;

        let got = provider.get(&DeploymentSpec::default(), &[]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(provider.get_calls().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let provider = MockTargetProvider::new();
        provider.seed(vec![ComponentSpec::new("a")]).await;
        let refs = vec![ComponentSpec::new("a")];

        provider.remove(&DeploymentSpec::default(), &refs).await.unwrap();
        provider.remove(&DeploymentSpec::default(), &refs).await.unwrap();
        assert!(provider.deployed().await.is_empty());
    }

    #[tokio::test]
    async fn needs_update_compares_by_rule() {
        let provider = MockTargetProvider::new();
        let desired = vec![ComponentSpec::new("a")];
        let current = vec![ComponentSpec::new("a")];
        assert!(!provider.needs_update(&desired, &current).await);

        let mut changed = ComponentSpec::new("a");
        changed.properties.insert("k".into(), serde_json::json!("v"));
        assert!(provider.needs_update(&[changed], &current).await);
    }
}
