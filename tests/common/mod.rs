//! Shared fixtures: a static planner, a recording webhook sender, and an
//! in-process fake worker speaking the duplex wire protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use taskplane::connection::{ChannelSession, ServiceFinder};
use taskplane::plan::{Plan, PlanError, Planner};
use taskplane::webhook::{WebhookError, WebhookPayload, WebhookSender};
use taskplane::{
    ConnectionManager, ControlPlane, Orchestration, ServiceInfo, ServiceRegistration, ServiceSchema,
};

/// Planner returning a fixed plan regardless of the action.
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan_json: &str) -> Arc<Self> {
        Arc::new(Self {
            plan: Plan::parse(plan_json).expect("fixture plan parses"),
        })
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn decompose(
        &self,
        _orchestration: &Orchestration,
        _services: &[Arc<ServiceInfo>],
    ) -> Result<Plan, PlanError> {
        Ok(self.plan.clone())
    }
}

/// Planner that always fails, for the planning-error path.
pub struct FailingPlanner;

#[async_trait]
impl Planner for FailingPlanner {
    async fn decompose(
        &self,
        _orchestration: &Orchestration,
        _services: &[Arc<ServiceInfo>],
    ) -> Result<Plan, PlanError> {
        Err(PlanError::Backend("planner unavailable".into()))
    }
}

/// Webhook sender that records every delivery on a channel.
pub struct RecordingWebhook {
    tx: mpsc::UnboundedSender<(String, WebhookPayload)>,
}

impl RecordingWebhook {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, WebhookPayload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl WebhookSender for RecordingWebhook {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let _ = self.tx.send((url.to_string(), payload.clone()));
        Ok(())
    }
}

/// Register a service under a fixed id with a string-typed object schema.
pub async fn register_service(
    plane: &Arc<ControlPlane>,
    project_id: &str,
    service_id: &str,
    inputs: &[&str],
    outputs: &[&str],
) -> Arc<ServiceInfo> {
    let schema: ServiceSchema = serde_json::from_value(json!({
        "input": {
            "type": "object",
            "properties": inputs.iter()
                .map(|k| (k.to_string(), json!({"type": "string"})))
                .collect::<serde_json::Map<String, Value>>(),
            "required": inputs,
        },
        "output": {
            "type": "object",
            "properties": outputs.iter()
                .map(|k| (k.to_string(), json!({"type": "string"})))
                .collect::<serde_json::Map<String, Value>>(),
        }
    }))
    .expect("fixture schema parses");

    plane
        .register_or_update_service(
            project_id,
            ServiceRegistration {
                id: Some(service_id.to_string()),
                name: service_id.to_string(),
                description: format!("test service {service_id}"),
                schema,
            },
            taskplane::ServiceType::Service,
        )
        .await
        .expect("service registration succeeds")
}

/// Attach an in-process worker for a service. The handler maps a task
/// input to a result or an error string; `None` drops the request on the
/// floor, simulating a worker that never answers.
pub async fn attach_fake_worker<F>(
    manager: &Arc<ConnectionManager>,
    finder: Arc<dyn ServiceFinder>,
    service_id: &str,
    handler: F,
) where
    F: Fn(Value) -> Option<Result<Value, String>> + Send + Sync + 'static,
{
    let (session, mut rx) = ChannelSession::pair();
    manager.attach(service_id, session).await;

    let manager = manager.clone();
    let service_id = service_id.to_string();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if frame == "ping" {
                let _ = manager
                    .handle_frame(&service_id, "pong", finder.as_ref())
                    .await;
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(&frame) else {
                continue;
            };
            if message.get("type").and_then(Value::as_str) != Some("task_request") {
                continue;
            }
            let Some(outcome) = handler(message["input"].clone()) else {
                continue;
            };
            let (result, error) = match outcome {
                Ok(value) => (Some(value), None::<String>),
                Err(reason) => (None, Some(reason)),
            };
            let reply = json!({
                "id": message["id"],
                "payload": {
                    "type": "task_result",
                    "idempotencyKey": message["idempotencyKey"],
                    "serviceId": message["serviceId"],
                    "taskId": message["id"],
                    "executionId": message["executionId"],
                    "result": result,
                    "error": error,
                }
            });
            let _ = manager
                .handle_frame(&service_id, &reply.to_string(), finder.as_ref())
                .await;
        }
    });
}
