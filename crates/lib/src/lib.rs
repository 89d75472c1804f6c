//! maestro-lib: the solution reconciliation engine.
//!
//! Given a desired deployment of a solution onto a set of targets, the
//! engine computes what must change where, dispatches per-target work
//! through pluggable provider drivers, merges results into an authoritative
//! state, and publishes a summary for external watchers:
//!
//! - `model`: deployment specs, binding state, summaries
//! - `planner`: dependency-ordered, per-target step planning
//! - `provider`: the target driver contract, the in-memory mock, and the
//!   asynchronous multiplexed (MQTT-pattern) driver
//! - `manager`: the reconciliation core itself
//! - `heartbeat`: liveness events while a reconcile is in flight
//! - `poll`: pull staged deployments from a registry endpoint
//! - `watch`: removal confirmation for external reconcilers
//!
//! Storage and transport come from `maestro-core` behind the `StateStore`
//! and `PubSub` seams.

pub mod evaluate;
pub mod heartbeat;
pub mod manager;
pub mod model;
pub mod planner;
pub mod poll;
pub mod provider;
pub mod watch;

pub use evaluate::{Evaluator, NoopEvaluator};
pub use heartbeat::{HEARTBEAT_TOPIC, HeartBeatData, HeartbeatAction, HeartbeatPublisher};
pub use manager::{SolutionManager, SolutionManagerConfig, can_skip_step, summary_key};
pub use model::{ComponentSpec, DeploymentSpec, DeploymentState, SummaryResult, SummarySpec};
pub use planner::{
    ComponentAction, ComponentStep, DeploymentPlan, DeploymentStep, PlanError, plan_for_deployment, sort_by_dependencies,
};
pub use provider::{
    MockTargetProvider, MqttTargetProvider, MqttTargetProviderConfig, ProviderRegistry, TargetProvider, ValidationRule,
};
pub use watch::{RemovalConfirmation, WatchOptions, generation_matches, wait_for_removal};
