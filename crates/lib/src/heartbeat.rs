//! Reconcile liveness heartbeats.
//!
//! While a reconcile is in flight, a background ticker publishes a heartbeat
//! event so external watchers can distinguish "in progress" from "stalled".
//! Heartbeats carry no ordering guarantee with respect to reconcile progress;
//! consumers must treat them as liveness-only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use maestro_core::{Event, PubSub};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Topic heartbeat events are published on.
pub const HEARTBEAT_TOPIC: &str = "heartbeat";

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What the in-flight reconcile is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatAction {
    Update,
    Delete,
}

/// The heartbeat event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartBeatData {
    pub job_id: String,
    pub action: HeartbeatAction,
    pub time: DateTime<Utc>,
}

/// Publishes heartbeats for one in-flight reconcile.
#[derive(Clone)]
pub struct HeartbeatPublisher {
    bus: Arc<dyn PubSub>,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(bus: Arc<dyn PubSub>, interval: Duration) -> Self {
        Self { bus, interval }
    }

    /// Starts the ticker. The returned guard stops it when dropped, which is
    /// what guarantees the stop signal on every reconcile exit path.
    pub fn start(&self, job_id: impl Into<String>, action: HeartbeatAction) -> HeartbeatGuard {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let bus = self.bus.clone();
        let period = self.interval;
        let job_id = job_id.into();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick of a tokio interval fires immediately; the heartbeat
            // contract is one event per elapsed period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let data = HeartBeatData {
                            job_id: job_id.clone(),
                            action,
                            time: Utc::now(),
                        };
                        let body = match serde_json::to_value(&data) {
                            Ok(body) => body,
                            Err(err) => {
                                warn!(error = %err, "failed to serialize heartbeat");
                                continue;
                            }
                        };
                        if let Err(err) = bus.publish(HEARTBEAT_TOPIC, Event::new(body)).await {
                            warn!(error = %err, "failed to publish heartbeat");
                        } else {
                            debug!(job_id = %data.job_id, "heartbeat published");
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });

        HeartbeatGuard {
            stop: stop_tx,
            handle,
        }
    }
}

/// Stops the heartbeat ticker on drop.
pub struct HeartbeatGuard {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }
}
