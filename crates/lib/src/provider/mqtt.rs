//! Asynchronous multiplexed target provider.
//!
//! This driver talks to a remote agent over a publish/subscribe transport
//! (MQTT in the reference deployment; the broker client itself stays behind
//! the [`PubSub`] seam). All operations share one request topic and one
//! response topic:
//!
//! - `init` subscribes to the response topic once and spawns a dispatcher
//!   that routes incoming responses by their `call-context` metadata onto
//!   five per-operation delivery channels;
//! - each outbound operation publishes a tagged [`Request`] and awaits its
//!   own channel with a bounded deadline (8 seconds by default);
//! - a timeout returns `InternalError` and never wedges later calls: the
//!   per-kind channel is drained of stale responses before the next publish.
//!
//! One call per operation kind is in flight at a time; the per-kind receiver
//! lock serializes callers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_core::{Event, PubSub, Request, Response, Result, StatusError};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{ComponentResultSpec, ComponentSpec, DeploymentSpec};
use crate::planner::{ComponentStep, DeploymentStep};

use super::{PropertyChangeRule, TargetProvider, ValidationRule};

/// Default bounded wait for a response.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Capacity of each per-operation delivery channel. Out-of-band responses
/// beyond this are dropped with a warning.
const RESPONSE_BUFFER: usize = 8;

/// Configuration for the MQTT-pattern driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttTargetProviderConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_id: String,
    pub request_topic: String,
    pub response_topic: String,
    /// Response deadline; the reference is 8 seconds.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

impl MqttTargetProviderConfig {
    pub fn new(name: impl Into<String>, request_topic: impl Into<String>, response_topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: Uuid::new_v4().to_string(),
            request_topic: request_topic.into(),
            response_topic: response_topic.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builds a config from a target binding's string properties.
    pub fn from_binding_config(properties: &BTreeMap<String, String>) -> Result<Self> {
        let request_topic = properties
            .get("requestTopic")
            .ok_or_else(|| StatusError::bad_config("'requestTopic' is missing in MQTT provider config"))?;
        let response_topic = properties
            .get("responseTopic")
            .ok_or_else(|| StatusError::bad_config("'responseTopic' is missing in MQTT provider config"))?;

        let mut config = Self::new(
            properties.get("name").cloned().unwrap_or_default(),
            request_topic,
            response_topic,
        );
        if let Some(client_id) = properties.get("clientID") {
            config.client_id = client_id.clone();
        }
        if let Some(secs) = properties.get("timeoutSeconds") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| StatusError::bad_config("'timeoutSeconds' is not a number in MQTT provider config"))?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// The five multiplexed operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Get,
    Remove,
    NeedsUpdate,
    NeedsRemove,
    Apply,
}

impl OpKind {
    fn label(self) -> &'static str {
        match self {
            OpKind::Get => "Get",
            OpKind::Remove => "Remove",
            OpKind::NeedsUpdate => "NeedsUpdate",
            OpKind::NeedsRemove => "NeedsRemove",
            OpKind::Apply => "Apply",
        }
    }

    fn call_context(self) -> &'static str {
        match self {
            OpKind::Get => "TargetProvider-Get",
            OpKind::Remove => "TargetProvider-Remove",
            OpKind::NeedsUpdate => "TargetProvider-NeedsUpdate",
            OpKind::NeedsRemove => "TargetProvider-NeedsRemove",
            OpKind::Apply => "TargetProvider-Apply",
        }
    }

    fn from_call_context(context: &str) -> Option<Self> {
        match context {
            "TargetProvider-Get" => Some(OpKind::Get),
            "TargetProvider-Remove" => Some(OpKind::Remove),
            "TargetProvider-NeedsUpdate" => Some(OpKind::NeedsUpdate),
            "TargetProvider-NeedsRemove" => Some(OpKind::NeedsRemove),
            "TargetProvider-Apply" => Some(OpKind::Apply),
            _ => None,
        }
    }
}

/// One operation's delivery rendezvous: the dispatcher sends, the single
/// in-flight caller receives.
struct OpChannel {
    tx: mpsc::Sender<Response>,
    rx: Mutex<mpsc::Receiver<Response>>,
}

impl OpChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        Self { tx, rx: Mutex::new(rx) }
    }
}

struct OpChannels {
    get: OpChannel,
    remove: OpChannel,
    needs_update: OpChannel,
    needs_remove: OpChannel,
    apply: OpChannel,
}

impl OpChannels {
    fn new() -> Self {
        Self {
            get: OpChannel::new(),
            remove: OpChannel::new(),
            needs_update: OpChannel::new(),
            needs_remove: OpChannel::new(),
            apply: OpChannel::new(),
        }
    }

    fn of(&self, kind: OpKind) -> &OpChannel {
        match kind {
            OpKind::Get => &self.get,
            OpKind::Remove => &self.remove,
            OpKind::NeedsUpdate => &self.needs_update,
            OpKind::NeedsRemove => &self.needs_remove,
            OpKind::Apply => &self.apply,
        }
    }
}

/// Desired-vs-current payload for the comparison operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TwoComponentSlices {
    current: Vec<ComponentSpec>,
    desired: Vec<ComponentSpec>,
}

/// Target provider multiplexing requests onto a shared pub/sub transport.
pub struct MqttTargetProvider {
    config: MqttTargetProviderConfig,
    transport: Arc<dyn PubSub>,
    channels: OpChannels,
    initialized: Mutex<bool>,
    dispatcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MqttTargetProvider {
    pub fn new(config: MqttTargetProviderConfig, transport: Arc<dyn PubSub>) -> Self {
        Self {
            config,
            transport,
            channels: OpChannels::new(),
            initialized: Mutex::new(false),
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    /// Subscribes to the response topic and starts the dispatcher. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        info!(
            provider = %self.config.name,
            response_topic = %self.config.response_topic,
            "initializing MQTT target provider"
        );

        let mut events = self.transport.subscribe(&self.config.response_topic).await?;
        let senders = [
            (OpKind::Get, self.channels.get.tx.clone()),
            (OpKind::Remove, self.channels.remove.tx.clone()),
            (OpKind::NeedsUpdate, self.channels.needs_update.tx.clone()),
            (OpKind::NeedsRemove, self.channels.needs_remove.tx.clone()),
            (OpKind::Apply, self.channels.apply.tx.clone()),
        ];

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let response: Response = match serde_json::from_value(event.body) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(error = %err, "failed to deserialize response from transport");
                        continue;
                    }
                };
                let Some(kind) = response.call_context().and_then(OpKind::from_call_context) else {
                    warn!(context = ?response.call_context(), "response without a known call-context");
                    continue;
                };
                let Some((_, tx)) = senders.iter().find(|(k, _)| *k == kind) else {
                    continue;
                };
                match tx.try_send(response) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(kind = kind.label(), "dropping out-of-band response: channel full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });

        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            *dispatcher = Some(handle);
        }
        *initialized = true;
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if *self.initialized.lock().await {
            Ok(())
        } else {
            Err(StatusError::bad_config("MQTT target provider is not initialized"))
        }
    }

    /// Publishes a tagged request and awaits the matching per-kind channel
    /// with the configured deadline.
    async fn request_response(&self, kind: OpKind, request: Request) -> Result<Response> {
        self.ensure_initialized().await?;

        let channel = self.channels.of(kind);
        let mut rx = channel.rx.lock().await;

        // A response to a call that already timed out may still be sitting in
        // the channel; it must not be mistaken for the answer to this call.
        while rx.try_recv().is_ok() {
            warn!(kind = kind.label(), "discarding stale response from a timed-out call");
        }

        let payload = serde_json::to_value(&request)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize request", e))?;
        self.transport.publish(&self.config.request_topic, Event::new(payload)).await?;
        debug!(kind = kind.label(), topic = %self.config.request_topic, "request published");

        match timeout(self.config.timeout, rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(StatusError::internal(format!(
                "response channel for {}() closed",
                kind.label()
            ))),
            Err(_) => Err(StatusError::internal(format!(
                "didn't get response to {}() call over MQTT",
                kind.label()
            ))),
        }
    }

    fn into_result(response: Response) -> Result<Response> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(StatusError::new(response.state, response.error_message()))
        }
    }
}

impl Drop for MqttTargetProvider {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl TargetProvider for MqttTargetProvider {
    async fn get(&self, deployment: &DeploymentSpec, _references: &[ComponentStep]) -> Result<Vec<ComponentSpec>> {
        debug!(
            scope = %deployment.instance.scope,
            instance = %deployment.instance.name,
            "getting components over MQTT"
        );
        let body = serde_json::to_value(deployment)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize deployment", e))?;
        let request = Request::new("instances", "GET", body).with_call_context(OpKind::Get.call_context());

        let response = Self::into_result(self.request_response(OpKind::Get, request).await?)?;
        serde_json::from_value(response.body)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to deserialize components", e))
    }

    async fn apply(
        &self,
        deployment: &DeploymentSpec,
        step: &DeploymentStep,
        _is_dry_run: bool,
    ) -> Result<BTreeMap<String, ComponentResultSpec>> {
        debug!(
            scope = %deployment.instance.scope,
            instance = %deployment.instance.name,
            target = %step.target,
            "applying components over MQTT"
        );
        let body = serde_json::to_value(deployment)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize deployment", e))?;
        let request = Request::new("instances", "POST", body).with_call_context(OpKind::Apply.call_context());

        let response = Self::into_result(self.request_response(OpKind::Apply, request).await?)?;

        // Agents may answer with a per-component result map; older ones answer
        // with a bare acknowledgement.
        if let Ok(results) = serde_json::from_value::<BTreeMap<String, ComponentResultSpec>>(response.body.clone()) {
            return Ok(results);
        }
        let mut results = BTreeMap::new();
        for component_step in &step.components {
            results.insert(
                component_step.component.name.clone(),
                ComponentResultSpec {
                    status: response.state,
                    message: String::new(),
                },
            );
        }
        Ok(results)
    }

    async fn remove(&self, deployment: &DeploymentSpec, _current_ref: &[ComponentSpec]) -> Result<()> {
        debug!(
            scope = %deployment.instance.scope,
            instance = %deployment.instance.name,
            "removing components over MQTT"
        );
        let body = serde_json::to_value(deployment)
            .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to serialize deployment", e))?;
        let request = Request::new("instances", "DELETE", body).with_call_context(OpKind::Remove.call_context());

        Self::into_result(self.request_response(OpKind::Remove, request).await?).map(|_| ())
    }

    async fn needs_update(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool {
        self
            .compare(OpKind::NeedsUpdate, "needsupdate", desired, current)
            .await
    }

    async fn needs_remove(&self, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool {
        self
            .compare(OpKind::NeedsRemove, "needsremove", desired, current)
            .await
    }

    fn validation_rule(&self) -> Arc<dyn ValidationRule> {
        Arc::new(PropertyChangeRule)
    }
}

impl MqttTargetProvider {
    /// Runs one of the remote comparison operations. Any transport failure
    /// (publish error, timeout, error state) defaults to `false`.
    async fn compare(&self, kind: OpKind, route: &str, desired: &[ComponentSpec], current: &[ComponentSpec]) -> bool {
        let slices = TwoComponentSlices {
            current: current.to_vec(),
            desired: desired.to_vec(),
        };
        let Ok(body) = serde_json::to_value(&slices) else {
            return false;
        };
        let request = Request::new(route, "GET", body).with_call_context(kind.call_context());

        match self.request_response(kind, request).await {
            Ok(response) => response.is_success(),
            Err(err) => {
                warn!(kind = kind.label(), error = %err, "comparison call failed, defaulting to false");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{MemoryBus, Status};
    use serde_json::json;

    fn test_config() -> MqttTargetProviderConfig {
        MqttTargetProviderConfig::new("edge", "req", "resp")
    }

    async fn provider_on(bus: &Arc<MemoryBus>) -> MqttTargetProvider {
        let provider = MqttTargetProvider::new(test_config(), bus.clone() as Arc<dyn PubSub>);
        provider.init().await.unwrap();
        provider
    }

    /// A fake remote agent: answers every request on `req` with the supplied
    /// responses, matched by call-context. Subscribes before returning so no
    /// request can race past it.
    async fn spawn_agent(bus: Arc<MemoryBus>, respond: impl Fn(Request) -> Option<Response> + Send + 'static) {
        let mut requests = bus.subscribe("req").await.unwrap();
        tokio::spawn(async move {
            while let Some(event) = requests.recv().await {
                let request: Request = serde_json::from_value(event.body).unwrap();
                if let Some(response) = respond(request) {
                    let payload = serde_json::to_value(&response).unwrap();
                    bus.publish("resp", Event::new(payload)).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;
        provider.init().await.unwrap();
        provider.init().await.unwrap();
    }

    #[tokio::test]
    async fn calls_before_init_fail_with_bad_config() {
        let bus = Arc::new(MemoryBus::new());
        let provider = MqttTargetProvider::new(test_config(), bus as Arc<dyn PubSub>);
        let err = provider.get(&DeploymentSpec::default(), &[]).await.unwrap_err();
        assert_eq!(err.status, Status::BadConfig);
    }

    #[tokio::test]
    async fn get_round_trip() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        spawn_agent(bus.clone(), |request| {
            assert_eq!(request.route, "instances");
            assert_eq!(request.method, "GET");
            let components = json!([{ "name": "web", "type": "container" }]);
            Some(Response::ok(components).with_call_context("TargetProvider-Get"))
        }).await;

        let components = provider.get(&DeploymentSpec::default(), &[]).await.unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "web");
    }

    #[tokio::test]
    async fn apply_decodes_component_results() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        spawn_agent(bus.clone(), |request| {
            assert_eq!(request.method, "POST");
            let results = json!({ "web": { "status": 200, "message": "deployed" } });
            Some(Response::ok(results).with_call_context("TargetProvider-Apply"))
        }).await;

        let step = DeploymentStep {
            target: "edge".into(),
            role: "container".into(),
            components: vec![ComponentStep {
                action: crate::planner::ComponentAction::Update,
                component: ComponentSpec::new("web"),
            }],
        };
        let results = provider.apply(&DeploymentSpec::default(), &step, false).await.unwrap();
        assert_eq!(results["web"].status, Status::Ok);
        assert_eq!(results["web"].message, "deployed");
    }

    #[tokio::test]
    async fn error_state_is_propagated_with_body_message() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        spawn_agent(bus.clone(), |_request| {
            Some(Response::error(Status::NotFound, "instance gone").with_call_context("TargetProvider-Get"))
        }).await;

        let err = provider.get(&DeploymentSpec::default(), &[]).await.unwrap_err();
        assert_eq!(err.status, Status::NotFound);
        assert_eq!(err.message, "instance gone");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_internal_error() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        // Nobody answers: the deadline elapses (paused time auto-advances).
        let err = provider.get(&DeploymentSpec::default(), &[]).await.unwrap_err();
        assert_eq!(err.status, Status::InternalError);
        assert_eq!(err.message, "didn't get response to Get() call over MQTT");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_wedge_the_next_call() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        // First call times out.
        let err = provider.remove(&DeploymentSpec::default(), &[]).await.unwrap_err();
        assert_eq!(err.status, Status::InternalError);

        // The late response to the first call arrives afterwards.
        bus
            .publish(
                "resp",
                Event::new(serde_json::to_value(Response::ok(json!(null)).with_call_context("TargetProvider-Remove")).unwrap()),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;

        // The second call drains the stale response and gets its own answer.
        spawn_agent(bus.clone(), |_request| {
            Some(Response::ok(json!(null)).with_call_context("TargetProvider-Remove"))
        }).await;
        provider.remove(&DeploymentSpec::default(), &[]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn needs_update_defaults_to_false_on_timeout() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;
        assert!(!provider.needs_update(&[], &[]).await);
    }

    #[tokio::test]
    async fn needs_update_true_on_success_state() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        spawn_agent(bus.clone(), |request| {
            assert_eq!(request.route, "needsupdate");
            Some(Response::ok(json!(null)).with_call_context("TargetProvider-NeedsUpdate"))
        }).await;

        assert!(provider.needs_update(&[ComponentSpec::new("a")], &[]).await);
    }

    #[tokio::test]
    async fn responses_route_by_call_context() {
        let bus = Arc::new(MemoryBus::new());
        let provider = provider_on(&bus).await;

        // Answer Get requests only; a NeedsRemove response published first must
        // not satisfy the Get call.
        bus
            .publish(
                "resp",
                Event::new(
                    serde_json::to_value(Response::ok(json!(null)).with_call_context("TargetProvider-NeedsRemove")).unwrap(),
                ),
            )
            .await
            .unwrap();

        spawn_agent(bus.clone(), |request| {
            (request.route == "instances").then(|| Response::ok(json!([])).with_call_context("TargetProvider-Get"))
        }).await;

        let components = provider.get(&DeploymentSpec::default(), &[]).await.unwrap();
        assert!(components.is_empty());
    }

    #[test]
    fn config_from_binding_requires_topics() {
        let mut properties = BTreeMap::new();
        properties.insert("requestTopic".to_string(), "req".to_string());
        let err = MqttTargetProviderConfig::from_binding_config(&properties).unwrap_err();
        assert_eq!(err.status, Status::BadConfig);

        properties.insert("responseTopic".to_string(), "resp".to_string());
        let config = MqttTargetProviderConfig::from_binding_config(&properties).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(!config.client_id.is_empty());
    }

    #[test]
    fn config_json_defaults_timeout() {
        let config: MqttTargetProviderConfig =
            serde_json::from_value(json!({ "requestTopic": "req", "responseTopic": "resp" })).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn config_timeout_override() {
        let mut properties = BTreeMap::new();
        properties.insert("requestTopic".to_string(), "req".to_string());
        properties.insert("responseTopic".to_string(), "resp".to_string());
        properties.insert("timeoutSeconds".to_string(), "2".to_string());
        let config = MqttTargetProviderConfig::from_binding_config(&properties).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(2));
    }
}
