//! Event-sourced control plane for multi-step workloads.
//!
//! This crate coordinates the execution of planned workloads across a fleet
//! of externally-connected workers. A submitted orchestration is decomposed
//! by an external [`plan::Planner`] into a DAG of subtasks; each subtask is
//! driven by a [`runtime::worker::TaskWorker`] that watches the
//! orchestration's append-only [`log::Log`] for its inputs, dispatches work
//! over a duplex [`connection::Session`], and records outputs back into the
//! log. A [`runtime::aggregator::ResultAggregator`] and a
//! [`runtime::failure::FailureTracker`] terminate the orchestration, at
//! which point the [`plane::ControlPlane`] delivers the terminal payload to
//! the project's webhook.
//!
//! State is entirely in-memory: logs, orchestration states, and idempotency
//! records are swept on retention timers and lost on restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
pub mod connection;
pub mod idempotency;
pub mod log;
pub mod plan;
pub mod plane;
pub mod runtime;
pub mod webhook;

pub use config::Config;
pub use connection::{ConnectionConfig, ConnectionManager, Session};
pub use idempotency::{ExecutionState, IdempotencyStore};
pub use log::{EntryType, Log, LogEntry};
pub use plan::{Action, ActionParam, Plan, PlanError, Planner, Source, SubTask};
pub use plane::{ControlPlane, PlaneConfig, PlaneError};
pub use runtime::LogManager;
pub use webhook::{WebhookPayload, WebhookSender};

/// Lifecycle status shared by orchestrations and tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Registered,
    Pending,
    Processing,
    Completed,
    Failed,
    NotActionable,
    Paused,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Registered => "registered",
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::NotActionable => "not-actionable",
            Status::Paused => "paused",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workers register either as a service or an agent; the distinction is a
/// descriptive tag with no behavioral difference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Agent,
    Service,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Agent => f.write_str("agent"),
            ServiceType::Service => f.write_str("service"),
        }
    }
}

/// Tenant boundary. Immutable once registered; renewal is a re-registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub webhook: String,
}

/// JSON-Schema-like type description used for service inputs and outputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,
}

pub type Properties = BTreeMap<String, Spec>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub input: Spec,
    pub output: Spec,
}

impl ServiceSchema {
    /// Whether the input spec declares the given property.
    pub fn input_includes(&self, prop: &str) -> bool {
        self.input.properties.contains_key(prop)
    }
}

/// A registered worker capability, scoped to a project. Each service carries
/// its own idempotency store so re-registration (which bumps `version`)
/// preserves in-flight execution records.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "type")]
    pub kind: ServiceType,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: ServiceSchema,
    #[serde(skip)]
    pub project_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(skip)]
    pub idempotency: Arc<IdempotencyStore>,
}

impl ServiceInfo {
    /// Human-readable descriptor embedded into plan subtasks.
    pub fn describe(&self) -> String {
        format!("[{}] {} - {}", self.kind, self.name, self.description)
    }
}

impl std::fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("project_id", &self.project_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Registration request body for a service or agent. An absent id mints a
/// new identity; a known id bumps the existing service's version.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceRegistration {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: ServiceSchema,
}

/// A user request in flight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Orchestration {
    #[serde(default)]
    pub id: String,
    #[serde(skip)]
    pub project_id: String,
    pub action: Action,
    #[serde(rename = "data", default)]
    pub params: Vec<ActionParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default = "pending_status")]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Constant inputs seeding the log, cached during preparation.
    #[serde(skip)]
    pub task_zero: Value,
}

fn pending_status() -> Status {
    Status::Pending
}

impl Orchestration {
    pub fn new(project_id: impl Into<String>, action: Action, params: Vec<ActionParam>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            action,
            params,
            plan: None,
            results: Vec::new(),
            status: Status::Pending,
            error: None,
            timestamp: Utc::now(),
            task_zero: Value::Null,
        }
    }

    /// A prepared orchestration can run unless planning rejected it.
    pub fn executable(&self) -> bool {
        !matches!(self.status, Status::NotActionable | Status::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_names() {
        for (status, wire) in [
            (Status::Registered, "\"registered\""),
            (Status::Processing, "\"processing\""),
            (Status::NotActionable, "\"not-actionable\""),
            (Status::Paused, "\"paused\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
            assert_eq!(serde_json::from_str::<Status>(wire).unwrap(), status);
        }
    }

    #[test]
    fn schema_input_lookup() {
        let schema: ServiceSchema = serde_json::from_value(serde_json::json!({
            "input": {"type": "object", "properties": {"x": {"type": "string"}}, "required": ["x"]},
            "output": {"type": "object", "properties": {"y": {"type": "string"}}}
        }))
        .unwrap();
        assert!(schema.input_includes("x"));
        assert!(!schema.input_includes("y"));
    }
}
