//! Worker connection layer.
//!
//! Each connected worker holds a long-lived duplex session identified by its
//! service id. The [`ConnectionManager`] routes task dispatches to sessions,
//! receives results, tracks per-session health with ping/pong heartbeats,
//! buffers outbound messages while a session is absent, and acknowledges
//! every identified inbound frame.
//!
//! Frames are JSON text, except the literal `ping`/`pong` heartbeats.
//! Outbound: a task request or an `{"type":"ACK","id":...}` object.
//! Inbound: `{id, payload}` where the payload's `type` is `pong`,
//! `task_status`, or `task_result`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{WS_PING, WS_PONG};
use crate::{ServiceInfo, Status};

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub queue_capacity: usize,
    pub message_expiration: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(120),
            max_message_bytes: 10 * 1024,
            queue_capacity: 1000,
            message_expiration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Task dispatch frame sent to a worker.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub execution_id: String,
    pub idempotency_key: String,
    pub service_id: String,
    pub orchestration_id: String,
    pub project_id: String,
    pub input: Value,
    pub status: Status,
}

impl TaskRequest {
    pub const KIND: &'static str = "task_request";
}

#[derive(Debug, Serialize)]
struct Ack<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    id: String,
    payload: InboundPayload,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundPayload {
    Pong,
    TaskStatus(TaskStatusUpdate),
    TaskResult(TaskResultMessage),
}

/// Progress notification from a worker; informational only.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdate {
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub status: Option<Status>,
}

/// Terminal result reported by a worker for one execution.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultMessage {
    pub idempotency_key: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("write timed out")]
    WriteTimeout,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("no session for service {0}")]
    NotConnected(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// One duplex channel to a worker. The transport behind it (a websocket on
/// the edge, an in-process channel in tests) is the caller's concern; the
/// manager only writes text frames and closes.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send_text(&self, frame: String) -> Result<(), SessionError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// In-process [`Session`] over an unbounded channel. The receiving half is
/// handed to whoever plays the worker.
pub struct ChannelSession {
    tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl ChannelSession {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Session for ChannelSession {
    async fn send_text(&self, frame: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.tx.send(frame).map_err(|_| SessionError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Health transition observed by the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthEvent {
    pub service_id: String,
    pub healthy: bool,
}

/// Resolves a service id to its registration; implemented by the control
/// plane so inbound results can reach the right idempotency store.
#[async_trait]
pub trait ServiceFinder: Send + Sync {
    async fn find_service(&self, service_id: &str) -> Option<Arc<ServiceInfo>>;
}

struct ConnectionEntry {
    session: Arc<dyn Session>,
    last_pong: DateTime<Utc>,
    ping_task: CancellationToken,
}

struct QueuedMessage {
    frame: String,
    queued_at: DateTime<Utc>,
}

/// Owns all worker sessions, their outbound queues, and their health state.
pub struct ConnectionManager {
    cfg: ConnectionConfig,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    queues: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    health: RwLock<HashMap<String, bool>>,
    health_tx: RwLock<Option<mpsc::UnboundedSender<HealthEvent>>>,
}

impl ConnectionManager {
    pub fn new(cfg: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            connections: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            health_tx: RwLock::new(None),
        })
    }

    /// Register the single health callback channel. Every health evaluation
    /// is forwarded; the consumer de-duplicates transitions.
    pub async fn register_health_callback(&self, tx: mpsc::UnboundedSender<HealthEvent>) {
        *self.health_tx.write().await = Some(tx);
    }

    pub async fn is_healthy(&self, service_id: &str) -> bool {
        self.health
            .read()
            .await
            .get(service_id)
            .copied()
            .unwrap_or(false)
    }

    /// Accept a new session for a service: marks it healthy, starts its
    /// heartbeat routine, and drains any messages queued while it was away.
    pub async fn attach(self: &Arc<Self>, service_id: &str, session: Arc<dyn Session>) {
        let ping_task = CancellationToken::new();
        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(
                service_id.to_string(),
                ConnectionEntry {
                    session,
                    last_pong: Utc::now(),
                    ping_task: ping_task.clone(),
                },
            )
        };
        if let Some(previous) = previous {
            previous.ping_task.cancel();
        }

        self.update_health(service_id, true).await;
        self.spawn_ping_routine(service_id.to_string(), ping_task);
        self.drain_queue(service_id).await;

        info!(service_id, "worker session established");
    }

    /// Drop the session for a service and mark it unhealthy.
    pub async fn detach(&self, service_id: &str) {
        if let Some(entry) = self.connections.write().await.remove(service_id) {
            entry.ping_task.cancel();
            entry.session.close().await;
        }
        self.update_health(service_id, false).await;
        info!(service_id, "worker session closed");
    }

    /// Dispatch a task to a worker. Connected sessions get the frame
    /// directly; absent ones have it queued for replay on reconnect.
    pub async fn send_task(&self, service_id: &str, task: &TaskRequest) -> Result<(), SessionError> {
        let frame = serde_json::to_string(task).map_err(|e| SessionError::Encode(e.to_string()))?;

        if self.connections.read().await.contains_key(service_id) {
            return self.write_frame(service_id, frame).await;
        }

        debug!(service_id, task_id = %task.id, "queueing task for disconnected worker");
        self.queue_message(service_id, frame).await;
        Ok(())
    }

    /// Process one inbound frame from a worker session. Identified frames
    /// are acknowledged after handling.
    pub async fn handle_frame(
        &self,
        service_id: &str,
        frame: &str,
        finder: &dyn ServiceFinder,
    ) -> Result<(), SessionError> {
        if frame.len() > self.cfg.max_message_bytes {
            warn!(service_id, bytes = frame.len(), "dropping oversized frame");
            return Err(SessionError::FrameTooLarge {
                limit: self.cfg.max_message_bytes,
            });
        }

        if frame == WS_PONG {
            self.record_pong(service_id).await;
            return Ok(());
        }

        let envelope: InboundEnvelope = match serde_json::from_str(frame) {
            Ok(env) => env,
            Err(e) => {
                warn!(service_id, error = %e, "failed to decode inbound frame");
                return Ok(());
            }
        };

        match envelope.payload {
            InboundPayload::Pong => self.record_pong(service_id).await,
            InboundPayload::TaskStatus(update) => {
                info!(
                    idempotency_key = %update.idempotency_key,
                    service_id = %update.service_id,
                    task_id = %update.task_id,
                    execution_id = %update.execution_id,
                    status = ?update.status,
                    "task status update"
                );
            }
            InboundPayload::TaskResult(message) => {
                self.handle_task_result(message, finder).await;
            }
        }

        if envelope.id != WS_PONG {
            let ack = Ack {
                kind: "ACK",
                id: &envelope.id,
            };
            let frame =
                serde_json::to_string(&ack).map_err(|e| SessionError::Encode(e.to_string()))?;
            if let Err(e) = self.write_frame(service_id, frame).await {
                warn!(service_id, error = %e, "failed to acknowledge frame");
            }
        }
        Ok(())
    }

    /// Route a worker's result to the owning service's idempotency store,
    /// waking any task worker polling that fingerprint.
    async fn handle_task_result(&self, message: TaskResultMessage, finder: &dyn ServiceFinder) {
        let Some(service) = finder.find_service(&message.service_id).await else {
            warn!(service_id = %message.service_id, "task result for unknown service");
            return;
        };
        let error = message.error.filter(|e| !e.is_empty());
        service
            .idempotency
            .update_result(&message.idempotency_key, message.result, error)
            .await;
    }

    async fn record_pong(&self, service_id: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(service_id) {
            entry.last_pong = Utc::now();
        }
    }

    async fn write_frame(&self, service_id: &str, frame: String) -> Result<(), SessionError> {
        let session = {
            let connections = self.connections.read().await;
            connections
                .get(service_id)
                .map(|entry| entry.session.clone())
                .ok_or_else(|| SessionError::NotConnected(service_id.to_string()))?
        };
        match tokio::time::timeout(self.cfg.write_timeout, session.send_text(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::WriteTimeout),
        }
    }

    async fn queue_message(&self, service_id: &str, frame: String) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(service_id.to_string()).or_default();
        if queue.len() >= self.cfg.queue_capacity {
            let dropped = queue.pop_front();
            warn!(
                service_id,
                dropped_age_secs = dropped
                    .map(|m| (Utc::now() - m.queued_at).num_seconds())
                    .unwrap_or(0),
                "outbound queue full, dropping oldest message"
            );
        }
        queue.push_back(QueuedMessage {
            frame,
            queued_at: Utc::now(),
        });
    }

    /// Replay queued messages to a freshly attached session, stopping at
    /// the first write failure so the remainder stays queued.
    async fn drain_queue(&self, service_id: &str) {
        loop {
            let next = {
                let mut queues = self.queues.lock().await;
                match queues.get_mut(service_id) {
                    Some(queue) => queue.pop_front(),
                    None => None,
                }
            };
            let Some(message) = next else { return };

            let age = Utc::now() - message.queued_at;
            if age.to_std().unwrap_or_default() > self.cfg.message_expiration {
                debug!(service_id, "dropping expired queued message");
                continue;
            }

            debug!(service_id, "replaying queued message");
            if let Err(e) = self.write_frame(service_id, message.frame.clone()).await {
                warn!(service_id, error = %e, "failed to replay queued message");
                let mut queues = self.queues.lock().await;
                queues
                    .entry(service_id.to_string())
                    .or_default()
                    .push_front(message);
                return;
            }
        }
    }

    /// Drop queued messages enqueued before `cutoff`.
    pub async fn sweep_expired_messages(&self, cutoff: DateTime<Utc>) {
        let mut queues = self.queues.lock().await;
        for (service_id, queue) in queues.iter_mut() {
            let before = queue.len();
            queue.retain(|m| m.queued_at >= cutoff);
            if queue.len() < before {
                debug!(
                    service_id = %service_id,
                    removed = before - queue.len(),
                    "swept expired queued messages"
                );
            }
        }
    }

    /// Hourly sweep of expired queued messages; lives until cancelled.
    pub fn spawn_queue_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let expiration = chrono::Duration::from_std(manager.cfg.message_expiration)
                            .unwrap_or_else(|_| chrono::Duration::hours(24));
                        manager.sweep_expired_messages(Utc::now() - expiration).await;
                    }
                }
            }
        })
    }

    async fn update_health(&self, service_id: &str, healthy: bool) {
        self.health
            .write()
            .await
            .insert(service_id.to_string(), healthy);
        let tx = self.health_tx.read().await;
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(HealthEvent {
                service_id: service_id.to_string(),
                healthy,
            });
        }
    }

    /// Heartbeat loop for one session: pings on an interval, closes the
    /// session when a write fails or the pong deadline lapses.
    fn spawn_ping_routine(self: &Arc<Self>, service_id: String, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cfg.ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !manager.heartbeat(&service_id).await {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// One heartbeat round; false means the session was torn down.
    async fn heartbeat(&self, service_id: &str) -> bool {
        let (session, last_pong) = {
            let connections = self.connections.read().await;
            match connections.get(service_id) {
                Some(entry) => (entry.session.clone(), entry.last_pong),
                None => return false,
            }
        };

        if session.is_closed() {
            info!(service_id, "heartbeat stopping for closed session");
            self.teardown(service_id).await;
            return false;
        }

        let write = tokio::time::timeout(
            self.cfg.write_timeout,
            session.send_text(WS_PING.to_string()),
        )
        .await;
        if !matches!(write, Ok(Ok(()))) {
            warn!(service_id, "failed to send ping, closing session");
            self.teardown(service_id).await;
            return false;
        }

        let since_pong = (Utc::now() - last_pong).to_std().unwrap_or_default();
        if since_pong > self.cfg.pong_wait {
            warn!(service_id, ?since_pong, "pong timeout, closing session");
            self.teardown(service_id).await;
            return false;
        }

        self.update_health(service_id, true).await;
        true
    }

    async fn teardown(&self, service_id: &str) {
        if let Some(entry) = self.connections.write().await.remove(service_id) {
            entry.ping_task.cancel();
            entry.session.close().await;
        }
        self.update_health(service_id, false).await;
    }
}
