//! The solution reconciliation core.
//!
//! [`SolutionManager::reconcile`] drives a desired deployment onto its
//! targets:
//!
//! 1. Take the process-wide reconcile lock and start the heartbeat.
//! 2. Evaluate the spec (fatal on update, ignored on removal).
//! 3. Load the previously accepted desired state, observe the current state
//!    through the providers, and merge previous + new desired.
//! 4. Plan per-target steps in dependency order.
//! 5. Execute each step, skipping work the validation rule proves unchanged,
//!    retrying failures within a bounded budget.
//! 6. Persist the merged state and the summary; the summary is written
//!    before any error returns so watchers always see the truth.
//!
//! The reconcile lock is process-wide on purpose: the asynchronous provider
//! driver's per-kind response channels assume a single in-flight reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use maestro_core::{PubSub, Result, StateEntry, StateStore, StatusError, UpsertOptions};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::evaluate::Evaluator;
use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatAction, HeartbeatPublisher};
use crate::model::{
    ComponentSpec, DeploymentSpec, DeploymentState, SolutionManagerDeploymentState, SummaryResult, SummarySpec,
    TARGET_STATUS_ERROR, TARGET_STATUS_OK, TargetResultSpec, TargetState, is_tombstone, target_key,
};
use crate::planner::{ComponentAction, ComponentStep, DeploymentStep, plan_for_deployment};
use crate::poll::PollConfig;
use crate::provider::{ProviderRegistry, TargetProvider, ValidationRule};

/// Substring of a `container.image` property that marks an agent component.
pub const SYMPHONY_AGENT: &str = "/symphony-agent:";

/// Metadata key the agent component name is injected under.
pub const ENV_NAME: &str = "SYMPHONY_AGENT_ADDRESS";

/// Environment variable supplying target names in target mode.
pub const TARGET_NAME_ENV: &str = "SYMPHONY_TARGET_NAME";

/// Component property holding the container image reference.
const CONTAINER_IMAGE: &str = "container.image";

/// The store key for an instance's persisted summary.
pub fn summary_key(instance: &str) -> String {
    format!("summary-{}", instance)
}

/// Configuration of the solution manager.
#[derive(Debug, Clone)]
pub struct SolutionManagerConfig {
    /// Run in target mode: only steps addressing one of `target_names` are
    /// executed.
    pub is_target: bool,
    pub target_names: Vec<String>,
    /// Apply attempts per step. The reference is a single attempt; transient
    /// errors rarely clear quickly enough for tight retries to help.
    pub retry_count: usize,
    /// Fixed backoff between apply attempts.
    pub retry_backoff: Duration,
    pub heartbeat_interval: Duration,
    /// Poll-mode configuration; `None` disables polling.
    pub poll: Option<PollConfig>,
}

impl Default for SolutionManagerConfig {
    fn default() -> Self {
        Self {
            is_target: false,
            target_names: Vec::new(),
            retry_count: 1,
            retry_backoff: Duration::from_secs(5),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll: None,
        }
    }
}

/// The reconciliation core.
pub struct SolutionManager {
    config: SolutionManagerConfig,
    state_store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
    target_providers: BTreeMap<String, Arc<dyn TargetProvider>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    heartbeat: HeartbeatPublisher,
    reconcile_lock: Mutex<()>,
}

impl SolutionManager {
    /// Builds a manager.
    ///
    /// In target mode the target names fall back to the `SYMPHONY_TARGET_NAME`
    /// environment variable (comma-separated); an empty list is a fatal
    /// configuration error.
    pub fn new(
        mut config: SolutionManagerConfig,
        state_store: Arc<dyn StateStore>,
        bus: Arc<dyn PubSub>,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        if config.is_target && config.target_names.is_empty() {
            if let Ok(names) = std::env::var(TARGET_NAME_ENV) {
                config.target_names = names.split(',').filter(|n| !n.is_empty()).map(str::to_string).collect();
            }
            if config.target_names.is_empty() {
                return Err(StatusError::bad_config("target mode is set but target name is not set"));
            }
        }

        let heartbeat = HeartbeatPublisher::new(bus, config.heartbeat_interval);
        Ok(Self {
            config,
            state_store,
            registry,
            target_providers: BTreeMap::new(),
            evaluator: None,
            heartbeat,
            reconcile_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SolutionManagerConfig {
        &self.config
    }

    /// Pre-registers a provider instance for a target, overriding registry
    /// construction for that target's steps.
    pub fn register_target_provider(&mut self, target: impl Into<String>, provider: Arc<dyn TargetProvider>) {
        self.target_providers.insert(target.into(), provider);
    }

    /// Installs the spec evaluation hook.
    pub fn set_evaluator(&mut self, evaluator: Arc<dyn Evaluator>) {
        self.evaluator = Some(evaluator);
    }

    /// Reconciles a deployment onto its targets.
    ///
    /// The summary is persisted under `"summary-" + instance` on every path,
    /// including errors; the returned error (the last step's) never precedes
    /// it. `target_name` narrows execution to one target when non-empty.
    pub async fn reconcile(
        &self,
        deployment: DeploymentSpec,
        remove: bool,
        namespace: &str,
        target_name: &str,
    ) -> Result<SummarySpec> {
        let _lock = self.reconcile_lock.lock().await;

        let action = if remove { HeartbeatAction::Delete } else { HeartbeatAction::Update };
        let _heartbeat = self.heartbeat.start(deployment.instance.name.clone(), action);

        info!(instance = %deployment.instance.name, namespace, remove, "reconciling");

        let mut summary = SummarySpec::for_targets(deployment.targets.len());
        let mut deployment = deployment;

        if let Some(evaluator) = &self.evaluator {
            match evaluator.evaluate(&deployment, namespace) {
                Ok(evaluated) => deployment = evaluated,
                Err(err) if remove => {
                    info!(error = %err, "skipped failure to evaluate deployment spec");
                }
                Err(err) => {
                    summary.summary_message = format!("failed to evaluate deployment spec: {}", err);
                    error!(error = %err, "failed to evaluate deployment spec");
                    self.try_save_summary(&deployment, &summary).await;
                    return Err(err);
                }
            }
        }

        let previous_desired_state = self.previous_state(&deployment.instance.name).await;
        let current_desired_state = DeploymentState::new(&deployment);

        let current_state = match self.get(&deployment, target_name).await {
            Ok((state, _)) => state,
            Err(err) => {
                summary.summary_message = format!("failed to get current state: {}", err);
                error!(error = %err, "failed to get current state");
                self.try_save_summary(&deployment, &summary).await;
                return Err(err);
            }
        };

        let mut desired_state = match &previous_desired_state {
            Some(previous) => DeploymentState::merge(&previous.state, &current_desired_state),
            None => current_desired_state,
        };
        if remove {
            desired_state.mark_remove_all();
        }

        let mut merged_state = DeploymentState::merge(&current_state, &desired_state);

        let plan = match plan_for_deployment(&deployment, &merged_state) {
            Ok(plan) => plan,
            Err(err) => {
                summary.summary_message = format!("failed to plan for deployment: {}", err);
                error!(error = %err, "failed to plan for deployment");
                self.try_save_summary(&deployment, &summary).await;
                return Err(StatusError::with_source(
                    maestro_core::Status::InternalError,
                    format!("failed to plan for deployment: {}", err),
                    err,
                ));
            }
        };

        // The step-visible deployment carries solution metadata merged under the
        // instance metadata, instance keys winning.
        let mut dep = deployment.clone();
        let mut metadata = deployment.solution.metadata.clone();
        metadata.extend(deployment.instance.metadata.clone());
        dep.instance.metadata = metadata;

        let mut some_steps_ran = false;
        let mut target_result: BTreeMap<String, usize> = BTreeMap::new();
        let mut planned_count = 0;
        let mut plan_success_count = 0;

        for step in &plan.steps {
            if self.is_target_filtered(&step.target) {
                continue;
            }
            if !target_name.is_empty() && target_name != step.target {
                continue;
            }
            planned_count += 1;

            dep.active_target = step.target.clone();
            match find_agent(deployment.targets.get(&step.target)) {
                Some(agent) => {
                    dep.instance.metadata.insert(ENV_NAME.to_string(), agent);
                }
                None => {
                    dep.instance.metadata.remove(ENV_NAME);
                }
            }

            let provider = match self.resolve_provider(step, &deployment, previous_desired_state.as_ref()) {
                Ok(provider) => provider,
                Err(err) => {
                    summary.summary_message = format!("failed to create provider: {}", err);
                    error!(error = %err, target = %step.target, "failed to create provider");
                    self.try_save_summary(&deployment, &summary).await;
                    return Err(err);
                }
            };

            let mut step = step.clone();
            if let Some(previous) = &previous_desired_state {
                let test_state = DeploymentState::merge(&previous.state, &current_state);
                let rule = provider.validation_rule();
                let retained = retained_components(&step, rule.as_ref(), &previous.state.components, &test_state);
                if retained.is_empty() {
                    target_result.insert(step.target.clone(), 1);
                    plan_success_count += 1;
                    continue;
                }
                step.components = retained;
            }
            some_steps_ran = true;

            let attempts = self.config.retry_count.max(1);
            let mut step_error = None;
            for attempt in 0..attempts {
                match provider.apply(&dep, &step, false).await {
                    Ok(component_results) => {
                        target_result.insert(step.target.clone(), 1);
                        summary.all_assigned_deployed = planned_count == plan_success_count;
                        summary.update_target_result(
                            &step.target,
                            TargetResultSpec {
                                status: TARGET_STATUS_OK.to_string(),
                                message: String::new(),
                                component_results,
                            },
                        );
                        step_error = None;
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, target = %step.target, attempt, "deployment step failed");
                        target_result.insert(step.target.clone(), 0);
                        summary.all_assigned_deployed = false;
                        summary.update_target_result(
                            &step.target,
                            TargetResultSpec {
                                status: TARGET_STATUS_ERROR.to_string(),
                                message: err.to_string(),
                                component_results: BTreeMap::new(),
                            },
                        );
                        step_error = Some(err);
                        if attempt + 1 < attempts {
                            tokio::time::sleep(self.config.retry_backoff).await;
                        }
                    }
                }
            }

            if let Some(err) = step_error {
                error!(error = %err, target = %step.target, "failed to execute deployment step");
                summary.success_count = target_result.values().sum();
                summary.all_assigned_deployed = planned_count == plan_success_count;
                self.try_save_summary(&deployment, &summary).await;
                return Err(err);
            }
            plan_success_count += 1;
        }

        merged_state.clear_all_removed();

        // The state entry is retained even when everything has been removed;
        // deleting it would break the idempotence of a repeated removal.
        let record = SolutionManagerDeploymentState {
            spec: deployment.clone(),
            state: merged_state,
        };
        let body = serde_json::to_value(&record).map_err(|e| {
            StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize deployment state", e)
        })?;
        if let Err(err) = self
            .state_store
            .upsert(StateEntry::new(deployment.instance.name.clone(), body), &UpsertOptions::default())
            .await
        {
            summary.summary_message = format!("failed to persist deployment state: {}", err);
            error!(error = %err, "failed to persist deployment state");
            self.try_save_summary(&deployment, &summary).await;
            return Err(err);
        }

        summary.skipped = !some_steps_ran;
        summary.is_removal = remove;
        summary.success_count = target_result.values().sum();
        summary.all_assigned_deployed = planned_count == plan_success_count;
        if summary.skipped {
            summary.success_count = summary.target_count;
        }
        self.save_summary(&deployment, &summary).await?;

        info!(
            instance = %deployment.instance.name,
            success = summary.success_count,
            targets = summary.target_count,
            skipped = summary.skipped,
            "reconcile complete"
        );
        Ok(summary)
    }

    /// Observes the deployment's current state through the providers.
    ///
    /// Runs the same planning pipeline as `reconcile` but only calls `get` on
    /// each provider. Observed components are deduplicated by name in
    /// iteration order.
    pub async fn get(&self, deployment: &DeploymentSpec, target_name: &str) -> Result<(DeploymentState, Vec<ComponentSpec>)> {
        info!(instance = %deployment.instance.name, "getting deployment state");

        let state = DeploymentState::new(deployment);
        let plan = plan_for_deployment(deployment, &state).map_err(|err| {
            StatusError::with_source(
                maestro_core::Status::InternalError,
                format!("failed to plan for deployment: {}", err),
                err,
            )
        })?;

        let mut ret = state;
        ret.target_component = BTreeMap::new();
        let mut components: Vec<ComponentSpec> = Vec::new();
        let mut dep = deployment.clone();

        for step in &plan.steps {
            if self.is_target_filtered(&step.target) {
                continue;
            }
            if !target_name.is_empty() && target_name != step.target {
                continue;
            }

            dep.active_target = step.target.clone();
            let provider = self.resolve_provider(step, deployment, None)?;
            let observed = provider.get(&dep, &step.components).await?;

            for component in observed {
                ret
                    .target_component
                    .insert(target_key(&component.name, &step.target), component.role().to_string());
                if !components.iter().any(|c| c.name == component.name) {
                    components.push(component);
                }
            }
        }

        Ok((ret, components))
    }

    /// Reads the persisted summary for an instance.
    pub async fn get_summary(&self, instance: &str) -> Result<SummaryResult> {
        let entry = self.state_store.get(&summary_key(instance)).await?;
        serde_json::from_value(entry.body).map_err(|e| {
            StatusError::with_source(maestro_core::Status::InternalError, "failed to deserialize deployment summary", e)
        })
    }

    fn is_target_filtered(&self, target: &str) -> bool {
        self.config.is_target && !self.config.target_names.iter().any(|name| name == target)
    }

    /// Resolves the provider for a step: a pre-registered instance wins, then
    /// the registry constructs one from the target's role binding. The target
    /// spec falls back to the previous desired spec's binding when the target
    /// vanished from the new spec.
    fn resolve_provider(
        &self,
        step: &DeploymentStep,
        deployment: &DeploymentSpec,
        previous: Option<&SolutionManagerDeploymentState>,
    ) -> Result<Arc<dyn TargetProvider>> {
        if let Some(provider) = self.target_providers.get(&step.target) {
            return Ok(provider.clone());
        }

        let target_state: Option<&TargetState> = deployment
            .targets
            .get(&step.target)
            .or_else(|| previous.and_then(|p| p.spec.targets.get(&step.target)));
        let target_state = target_state.ok_or_else(|| {
            StatusError::bad_config(format!("target '{}' is not found in the deployment spec", step.target))
        })?;

        self.registry.create_for_target_role(&step.role, target_state)
    }

    async fn previous_state(&self, instance: &str) -> Option<SolutionManagerDeploymentState> {
        let entry = self.state_store.get(instance).await.ok()?;
        serde_json::from_value(entry.body).ok()
    }

    async fn save_summary(&self, deployment: &DeploymentSpec, summary: &SummarySpec) -> Result<()> {
        let result = SummaryResult {
            summary: summary.clone(),
            generation: deployment.instance.generation.clone(),
            time: Utc::now(),
        };
        let body = serde_json::to_value(&result)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize summary", e))?;
        self
            .state_store
            .upsert(
                StateEntry::new(summary_key(&deployment.instance.name), body),
                &UpsertOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Saves the summary on a path that is already returning an error; a save
    /// failure is logged rather than masking the original error.
    async fn try_save_summary(&self, deployment: &DeploymentSpec, summary: &SummarySpec) {
        if let Err(err) = self.save_summary(deployment, summary).await {
            warn!(error = %err, instance = %deployment.instance.name, "failed to persist summary");
        }
    }
}

/// Whether a whole step can be skipped: every component action is already
/// satisfied per [`can_skip_component`].
pub fn can_skip_step(
    step: &DeploymentStep,
    rule: &dyn ValidationRule,
    current_components: &[ComponentSpec],
    state: &DeploymentState,
) -> bool {
    retained_components(step, rule, current_components, state).is_empty()
}

/// The subset of a step's components that still need work.
fn retained_components(
    step: &DeploymentStep,
    rule: &dyn ValidationRule,
    current_components: &[ComponentSpec],
    state: &DeploymentState,
) -> Vec<ComponentStep> {
    step
        .components
        .iter()
        .filter(|component_step| !can_skip_component(component_step, &step.target, rule, current_components, state))
        .cloned()
        .collect()
}

/// Whether one component action is already satisfied.
///
/// A `delete` is satisfied when no current component with that name is still
/// bound to the target. An `update` is satisfied when a current component
/// with that name is bound under a live (non-tombstone) role and the
/// validation rule reports it unchanged.
fn can_skip_component(
    component_step: &ComponentStep,
    target: &str,
    rule: &dyn ValidationRule,
    current_components: &[ComponentSpec],
    state: &DeploymentState,
) -> bool {
    let name = component_step.component.name.as_str();
    match component_step.action {
        ComponentAction::Delete => !current_components.iter().any(|current| {
            current.name == name && state.role_of(name, target).is_some_and(|role| !role.is_empty())
        }),
        ComponentAction::Update => current_components.iter().any(|current| {
            current.name == name
                && state
                    .role_of(name, target)
                    .is_some_and(|role| !role.is_empty() && !is_tombstone(role))
                && !rule.is_component_changed(current, &component_step.component)
        }),
    }
}

/// Finds the agent component hosted on a target: the first one whose
/// `container.image` property names a symphony agent image.
fn find_agent(target: Option<&TargetState>) -> Option<String> {
    let target = target?;
    for component in &target.components {
        if let Some(image) = component.properties.get(CONTAINER_IMAGE) {
            let image = match image {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if image.contains(SYMPHONY_AGENT) {
                return Some(component.name.clone());
            }
        }
    }
    None
}
