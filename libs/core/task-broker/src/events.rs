//! Lifecycle event bus.
//!
//! Every state transition and queue-affecting operation publishes a
//! self-describing message on the `queue-updates` channel; a periodic
//! heartbeat snapshot lets reconnecting subscribers converge. Delivery is
//! best-effort: a publish failure is logged, never propagated to the
//! operation that triggered it.
//!
//! Control broadcasts (circuit reset/open) ride a separate channel with
//! their own payload shape, consumed by a listener task on every worker.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use store::StoreClient;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::keys;
use crate::repository::QueueSnapshot;
use crate::task::TaskState;

/// Event kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskStateChanged,
    QueueSnapshot,
    Heartbeat,
    Fatal,
}

/// Message published on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<TaskState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<TaskState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub snapshot: QueueSnapshot,
    pub retry_ratio: f64,
    pub timestamp: String,
}

impl QueueEvent {
    fn new(kind: EventKind, snapshot: QueueSnapshot, retry_ratio: f64) -> Self {
        Self {
            kind,
            task_id: None,
            old_state: None,
            new_state: None,
            message: None,
            snapshot,
            retry_ratio,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// Control broadcast consumed by worker listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlCommand {
    ResetAllCircuits,
    OpenAllCircuits,
}

/// Publisher side of the event bus.
#[derive(Clone)]
pub struct EventPublisher {
    store: StoreClient,
}

impl EventPublisher {
    pub fn new(store: StoreClient) -> Self {
        Self { store }
    }

    /// Publish an event; failures are logged and swallowed.
    pub async fn publish(&self, event: &QueueEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(keys::EVENT_CHANNEL, &payload).await {
                    error!(error = %e, kind = ?event.kind, "Failed to publish event");
                } else {
                    debug!(kind = ?event.kind, task_id = ?event.task_id, "Event published");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
            }
        }
    }

    /// Publish a task_created event.
    pub async fn task_created(&self, task_id: &str, snapshot: QueueSnapshot, retry_ratio: f64) {
        let mut event = QueueEvent::new(EventKind::TaskCreated, snapshot, retry_ratio);
        event.task_id = Some(task_id.to_string());
        event.new_state = Some(TaskState::Pending);
        self.publish(&event).await;
    }

    /// Publish a task_state_changed event.
    pub async fn task_state_changed(
        &self,
        task_id: &str,
        old_state: TaskState,
        new_state: TaskState,
        snapshot: QueueSnapshot,
        retry_ratio: f64,
    ) {
        let mut event = QueueEvent::new(EventKind::TaskStateChanged, snapshot, retry_ratio);
        event.task_id = Some(task_id.to_string());
        event.old_state = Some(old_state);
        event.new_state = Some(new_state);
        self.publish(&event).await;
    }

    /// Publish a full queue snapshot (periodic heartbeat for subscribers).
    pub async fn queue_snapshot(&self, snapshot: QueueSnapshot, retry_ratio: f64) {
        self.publish(&QueueEvent::new(
            EventKind::QueueSnapshot,
            snapshot,
            retry_ratio,
        ))
        .await;
    }

    /// Publish a fatal condition observers should surface.
    pub async fn fatal(&self, message: &str, snapshot: QueueSnapshot, retry_ratio: f64) {
        let mut event = QueueEvent::new(EventKind::Fatal, snapshot, retry_ratio);
        event.message = Some(message.to_string());
        self.publish(&event).await;
    }

    /// Broadcast a control command to all workers.
    pub async fn control(&self, command: ControlCommand) -> Result<(), crate::error::BrokerError> {
        let payload = serde_json::to_string(&command)?;
        self.store.publish(keys::CONTROL_CHANNEL, &payload).await?;
        info!(command = ?command, "Control command broadcast");
        Ok(())
    }
}

/// In-process fan-out of the event channel.
///
/// One pump task subscribes to the store channel and forwards into a
/// `broadcast` sender, so any number of local observers (the API's
/// streaming surface, tests) can subscribe and lag independently.
pub struct EventFanout {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventFanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe a new observer. Slow observers drop messages, never block
    /// the pump.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`, for streaming transports (SSE, websockets).
    pub fn stream(&self) -> tokio_stream::wrappers::BroadcastStream<QueueEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.sender.subscribe())
    }

    /// Pump events from the store channel into the local broadcast until
    /// shutdown.
    pub async fn run(&self, store: StoreClient, mut shutdown: watch::Receiver<bool>) {
        use futures::StreamExt;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut pubsub = match store.subscribe(keys::EVENT_CHANNEL).await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(error = %e, "Event subscription failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => continue,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                    }
                }
            };

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Event fan-out stopping");
                            return;
                        }
                    }
                    message = stream.next() => {
                        let Some(message) = message else {
                            warn!("Event subscription closed, resubscribing");
                            break;
                        };
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Undecodable event payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<QueueEvent>(&payload) {
                            Ok(event) => {
                                // Send fails only with zero receivers; fine
                                let _ = self.sender.send(event);
                            }
                            Err(e) => {
                                warn!(error = %e, "Unparseable event payload");
                            }
                        }
                    }
                }
            }
        }
    }
}
