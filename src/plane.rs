//! The control plane: registries, orchestration lifecycle, and finalization.
//!
//! Exclusively owns the project, service, orchestration, and worker
//! registries. Preparing an orchestration runs the external planner and
//! validates its output; executing one wires a task worker per service
//! task, plus the result aggregator and failure tracker, and seeds the log
//! with the task-zero entry. Finalization cancels every worker before the
//! terminal webhook goes out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use std::time::Duration;

use crate::config::{
    CONTROL_PANEL_ID, FAILURE_TRACKER_ID, LOG_RETENTION, RESULT_AGGREGATOR_ID, TASK_ZERO,
};
use crate::connection::{ConnectionConfig, ConnectionManager, ServiceFinder};
use crate::idempotency::IdempotencyStore;
use crate::log::EntryType;
use crate::plan::{ActionParam, Plan, Planner, SubTask};
use crate::runtime::{
    FailureTracker, HealthCoordinator, LogManager, ResultAggregator, StateError, TaskWorker,
};
use crate::webhook::{WebhookError, WebhookPayload, WebhookSender};
use crate::{
    Action, Orchestration, Project, ServiceInfo, ServiceRegistration, ServiceType, Status,
};

#[derive(Debug, Error)]
pub enum PlaneError {
    #[error("{0}")]
    Validation(String),
    #[error("no project found: {0}")]
    UnknownProject(String),
    #[error("no service found: {0}")]
    UnknownService(String),
    #[error("no orchestration found: {0}")]
    UnknownOrchestration(String),
    #[error("orchestration {0} has no plan")]
    NotPrepared(String),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("control plane is shutting down")]
    Shutdown,
}

/// Tuning for a control plane instance. Defaults match production; tests
/// shrink the lease and retention windows to drive takeover and sweep paths
/// quickly.
#[derive(Clone, Debug)]
pub struct PlaneConfig {
    pub connection: ConnectionConfig,
    pub idempotency_lease: Duration,
    pub idempotency_ttl: Duration,
    pub retention: Duration,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            idempotency_lease: crate::idempotency::DEFAULT_LEASE,
            idempotency_ttl: crate::idempotency::DEFAULT_TTL,
            retention: LOG_RETENTION,
        }
    }
}

/// Registry hub wiring the runtime together.
pub struct ControlPlane {
    projects: RwLock<HashMap<String, Project>>,
    services: RwLock<HashMap<String, HashMap<String, Arc<ServiceInfo>>>>,
    orchestrations: RwLock<HashMap<String, Orchestration>>,
    /// orchestration id -> worker id -> cancel handle.
    workers: RwLock<HashMap<String, HashMap<String, CancellationToken>>>,
    pub log_manager: Arc<LogManager>,
    pub connections: Arc<ConnectionManager>,
    planner: Arc<dyn Planner>,
    webhooks: Arc<dyn WebhookSender>,
    cfg: PlaneConfig,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ControlPlane {
    /// Start a control plane with its background sweepers and health
    /// coordinator running.
    pub async fn start(
        cfg: PlaneConfig,
        planner: Arc<dyn Planner>,
        webhooks: Arc<dyn WebhookSender>,
    ) -> Arc<Self> {
        let log_manager = LogManager::new(cfg.retention);
        let connections = ConnectionManager::new(cfg.connection.clone());
        let shutdown = CancellationToken::new();

        let plane = Arc::new(Self {
            projects: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            orchestrations: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            log_manager: log_manager.clone(),
            connections: connections.clone(),
            planner,
            webhooks,
            cfg,
            background: Mutex::new(Vec::new()),
            shutdown,
        });
        plane.log_manager.bind_plane(Arc::downgrade(&plane));

        let (health_tx, health_rx) = mpsc::unbounded_channel();
        plane.connections.register_health_callback(health_tx).await;
        let coordinator =
            HealthCoordinator::new(Arc::downgrade(&plane), log_manager.clone());
        let coordinator_handle = coordinator.spawn(health_rx, plane.shutdown.child_token());
        let retention_handle = log_manager.spawn_retention_sweeper(plane.shutdown.child_token());
        let queue_handle = plane
            .connections
            .spawn_queue_sweeper(plane.shutdown.child_token());

        let mut background = plane.background.lock().await;
        background.push(coordinator_handle);
        background.push(retention_handle);
        background.push(queue_handle);
        drop(background);

        plane
    }

    /// Register a new project, minting its id and api key.
    pub async fn register_project(&self, webhook: String) -> Project {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            api_key: Uuid::new_v4().to_string(),
            webhook,
        };
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        project
    }

    pub async fn project_by_api_key(&self, api_key: &str) -> Option<Project> {
        self.projects
            .read()
            .await
            .values()
            .find(|p| p.api_key == api_key)
            .cloned()
    }

    /// Register a service or agent. A registration carrying a known id
    /// bumps that service's version and keeps its idempotency store; an
    /// absent id mints a new identity.
    pub async fn register_or_update_service(
        &self,
        project_id: &str,
        registration: ServiceRegistration,
        kind: ServiceType,
    ) -> Result<Arc<ServiceInfo>, PlaneError> {
        if !self.projects.read().await.contains_key(project_id) {
            return Err(PlaneError::UnknownProject(project_id.to_string()));
        }

        let mut services = self.services.write().await;
        let project_services = services.entry(project_id.to_string()).or_default();

        let existing = registration
            .id
            .as_ref()
            .and_then(|id| project_services.get(id).cloned());

        let service = match existing {
            Some(previous) => Arc::new(ServiceInfo {
                kind,
                id: previous.id.clone(),
                name: registration.name,
                description: registration.description,
                schema: registration.schema,
                project_id: project_id.to_string(),
                version: previous.version + 1,
                idempotency: previous.idempotency.clone(),
            }),
            None => {
                let id = registration
                    .id
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let idempotency = Arc::new(IdempotencyStore::with_config(
                    self.cfg.idempotency_lease,
                    self.cfg.idempotency_ttl,
                ));
                let sweeper = idempotency.spawn_sweeper(self.shutdown.child_token());
                self.background.lock().await.push(sweeper);
                Arc::new(ServiceInfo {
                    kind,
                    id,
                    name: registration.name,
                    description: registration.description,
                    schema: registration.schema,
                    project_id: project_id.to_string(),
                    version: 1,
                    idempotency,
                })
            }
        };

        project_services.insert(service.id.clone(), service.clone());
        info!(
            service_id = %service.id,
            project_id,
            version = service.version,
            "registered {}",
            service.kind
        );
        Ok(service)
    }

    /// Locate a service registration by id across all projects.
    pub async fn service_by_id(&self, service_id: &str) -> Option<Arc<ServiceInfo>> {
        let services = self.services.read().await;
        services
            .values()
            .find_map(|project_services| project_services.get(service_id).cloned())
    }

    pub async fn project_id_for_service(&self, service_id: &str) -> Option<String> {
        self.service_by_id(service_id)
            .await
            .map(|s| s.project_id.clone())
    }

    /// Authorization helper for the edge's duplex upgrade.
    pub async fn service_belongs_to_project(&self, service_id: &str, project_id: &str) -> bool {
        let services = self.services.read().await;
        services
            .get(project_id)
            .map(|project_services| project_services.contains_key(service_id))
            .unwrap_or(false)
    }

    async fn project_services(&self, project_id: &str) -> Vec<Arc<ServiceInfo>> {
        let services = self.services.read().await;
        let mut out: Vec<Arc<ServiceInfo>> = services
            .get(project_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Submit an orchestration for a project: prepare it, then either start
    /// execution or deliver its terminal webhook right away. The returned
    /// snapshot is what the edge serializes back to the caller.
    pub async fn submit_orchestration(
        self: &Arc<Self>,
        project_id: &str,
        action: Action,
        params: Vec<ActionParam>,
    ) -> Result<Orchestration, PlaneError> {
        if !self.projects.read().await.contains_key(project_id) {
            return Err(PlaneError::UnknownProject(project_id.to_string()));
        }

        let mut orchestration = Orchestration::new(project_id, action, params);
        self.prepare_orchestration(&mut orchestration).await;

        if orchestration.executable() {
            orchestration.status = Status::Processing;
            self.orchestrations
                .write()
                .await
                .insert(orchestration.id.clone(), orchestration.clone());
            self.execute_orchestration(&orchestration).await?;
        } else {
            debug!(
                orchestration_id = %orchestration.id,
                status = %orchestration.status,
                "orchestration cannot be executed"
            );
            self.orchestrations
                .write()
                .await
                .insert(orchestration.id.clone(), orchestration.clone());
            self.deliver_terminal(&orchestration).await;
        }
        Ok(orchestration)
    }

    /// Run the planner over the project's services and validate the result.
    /// Leaves the orchestration `Pending` when executable, otherwise
    /// `NotActionable` or `Failed` with a diagnostic.
    pub async fn prepare_orchestration(&self, orchestration: &mut Orchestration) {
        let services = self.project_services(&orchestration.project_id).await;
        if services.is_empty() {
            orchestration.status = Status::Failed;
            orchestration.error = Some(json!(format!(
                "no services found for project {}",
                orchestration.project_id
            )));
            return;
        }

        let mut plan = match self.planner.decompose(orchestration, &services).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(orchestration_id = %orchestration.id, error = %e, "planning failed");
                orchestration.status = Status::Failed;
                orchestration.error = Some(json!(format!("error decomposing action: {e}")));
                return;
            }
        };
        plan.project_id = orchestration.project_id.clone();

        if plan.is_not_actionable() {
            orchestration.error = plan.tasks[0]
                .input
                .get("error")
                .map(|s| json!(s.0.clone()));
            orchestration.plan = Some(plan);
            orchestration.status = Status::NotActionable;
            return;
        }

        if let Err(e) = validate_plan(&services, &plan) {
            orchestration.status = Status::Failed;
            orchestration.error = Some(json!(format!(
                "error validating plan input/output: {e}"
            )));
            return;
        }

        add_service_details(&services, &mut plan);
        orchestration.task_zero = task_zero_input(&plan, &orchestration.params);
        orchestration.plan = Some(plan);
    }

    /// Start the orchestration's log workers and seed the log with task
    /// zero, triggering the dependency cascade.
    pub async fn execute_orchestration(
        self: &Arc<Self>,
        orchestration: &Orchestration,
    ) -> Result<(), PlaneError> {
        let plan = orchestration
            .plan
            .clone()
            .ok_or_else(|| PlaneError::NotPrepared(orchestration.id.clone()))?;

        self.log_manager
            .prep_log(&orchestration.id, &orchestration.project_id, plan.clone())
            .await;

        for task in plan.service_tasks() {
            self.start_task_worker(&orchestration.id, task).await;
        }

        let dependencies: HashSet<String> =
            plan.service_tasks().map(|t| t.id.clone()).collect();
        let aggregator = ResultAggregator::new(dependencies, self.log_manager.clone());
        let cancel = self
            .register_worker(&orchestration.id, RESULT_AGGREGATOR_ID)
            .await;
        tokio::spawn(aggregator.run(orchestration.id.clone(), cancel));

        let tracker = FailureTracker::new(self.log_manager.clone());
        let cancel = self
            .register_worker(&orchestration.id, FAILURE_TRACKER_ID)
            .await;
        tokio::spawn(tracker.run(orchestration.id.clone(), cancel));

        self.log_manager
            .append_to_log(
                &orchestration.id,
                EntryType::TaskOutput,
                TASK_ZERO,
                orchestration.task_zero.clone(),
                CONTROL_PANEL_ID,
                0,
            )
            .await?;

        info!(orchestration_id = %orchestration.id, "orchestration executing");
        Ok(())
    }

    /// Spawn a task worker for one plan task, replacing any worker already
    /// registered under that task id.
    pub async fn start_task_worker(self: &Arc<Self>, orchestration_id: &str, task: &SubTask) {
        let Some(service) = self.service_by_id(&task.service).await else {
            error!(
                orchestration_id,
                task_id = %task.id,
                service_id = %task.service,
                "cannot start worker for unknown service"
            );
            return;
        };

        let cancel = self.register_worker(orchestration_id, &task.id).await;
        let worker = Arc::new(TaskWorker::new(
            service,
            task.id.clone(),
            task.dependencies(),
            self.log_manager.clone(),
            self.connections.clone(),
        ));
        tokio::spawn(worker.run(orchestration_id.to_string(), cancel));
    }

    /// Cancel the worker registered for a task, if any.
    pub async fn stop_task_worker(&self, orchestration_id: &str, task_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(orchestration_workers) = workers.get_mut(orchestration_id) {
            if let Some(token) = orchestration_workers.remove(task_id) {
                token.cancel();
            }
        }
    }

    async fn register_worker(&self, orchestration_id: &str, worker_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        let mut workers = self.workers.write().await;
        let orchestration_workers = workers.entry(orchestration_id.to_string()).or_default();
        if let Some(previous) = orchestration_workers.insert(worker_id.to_string(), token.clone())
        {
            previous.cancel();
        }
        token
    }

    /// Record the terminal, cancel every worker of the orchestration, and
    /// deliver the webhook. Called via the log manager, which guarantees
    /// at most one caller reaches this per orchestration.
    pub async fn finalize_orchestration(
        &self,
        orchestration_id: &str,
        status: Status,
        reason: Option<Value>,
        results: Vec<Value>,
    ) -> Result<(), PlaneError> {
        if let Some(tokens) = self.workers.write().await.remove(orchestration_id) {
            for token in tokens.into_values() {
                token.cancel();
            }
        }

        let snapshot = {
            let mut orchestrations = self.orchestrations.write().await;
            let orchestration = orchestrations
                .get_mut(orchestration_id)
                .ok_or_else(|| PlaneError::UnknownOrchestration(orchestration_id.to_string()))?;
            orchestration.status = status;
            orchestration.error = reason;
            orchestration.results = results;
            orchestration.clone()
        };

        info!(
            orchestration_id,
            status = %status,
            "orchestration finalized"
        );
        self.deliver_terminal(&snapshot).await;
        Ok(())
    }

    /// POST the terminal payload to the project webhook. Delivery failures
    /// are logged and surfaced through the orchestration record, not
    /// retried.
    async fn deliver_terminal(&self, orchestration: &Orchestration) {
        let Some(project) = self
            .projects
            .read()
            .await
            .get(&orchestration.project_id)
            .cloned()
        else {
            warn!(project_id = %orchestration.project_id, "project not found for webhook");
            return;
        };

        let payload = WebhookPayload {
            orchestration_id: orchestration.id.clone(),
            results: orchestration.results.clone(),
            status: orchestration.status,
            error: orchestration.error.clone(),
        };
        if let Err(e) = self.webhooks.deliver(&project.webhook, &payload).await {
            error!(
                orchestration_id = %orchestration.id,
                webhook = %project.webhook,
                error = %e,
                "webhook delivery failed"
            );
        }
    }

    pub async fn get_orchestration(&self, orchestration_id: &str) -> Option<Orchestration> {
        self.orchestrations
            .read()
            .await
            .get(orchestration_id)
            .cloned()
    }

    /// Active orchestrations (per the live runtime state) with their plan
    /// tasks targeting the given service.
    pub async fn active_orchestrations_with_tasks(
        &self,
        service_id: &str,
    ) -> HashMap<String, Vec<SubTask>> {
        let orchestrations = self.orchestrations.read().await;
        let mut out = HashMap::new();
        for (id, orchestration) in orchestrations.iter() {
            let active = matches!(
                self.log_manager.orchestration_status(id).await,
                Some(Status::Processing) | Some(Status::Paused)
            );
            if !active {
                continue;
            }
            let Some(plan) = &orchestration.plan else {
                continue;
            };
            let tasks: Vec<SubTask> = plan
                .service_tasks()
                .filter(|t| t.service == service_id)
                .cloned()
                .collect();
            if !tasks.is_empty() {
                out.insert(id.clone(), tasks);
            }
        }
        out
    }

    /// Cancel every log worker and background task. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.write().await;
        for tokens in workers.values() {
            for token in tokens.values() {
                token.cancel();
            }
        }
        workers.clear();
        drop(workers);

        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl ServiceFinder for ControlPlane {
    async fn find_service(&self, service_id: &str) -> Option<Arc<ServiceInfo>> {
        self.service_by_id(service_id).await
    }
}

/// Every plan task must target a known service and supply only inputs the
/// service's schema declares.
fn validate_plan(services: &[Arc<ServiceInfo>], plan: &Plan) -> Result<(), PlaneError> {
    let by_id: HashMap<&str, &Arc<ServiceInfo>> =
        services.iter().map(|s| (s.id.as_str(), s)).collect();

    for task in plan.service_tasks() {
        let service = by_id.get(task.service.as_str()).ok_or_else(|| {
            PlaneError::Validation(format!(
                "service {} not found for subtask {}",
                task.service, task.id
            ))
        })?;
        for input_key in task.input.keys() {
            if !service.schema.input_includes(input_key) {
                return Err(PlaneError::Validation(format!(
                    "input {} not supported by service {} for subtask {}",
                    input_key, task.service, task.id
                )));
            }
        }
    }
    Ok(())
}

fn add_service_details(services: &[Arc<ServiceInfo>], plan: &mut Plan) {
    let by_id: HashMap<&str, &Arc<ServiceInfo>> =
        services.iter().map(|s| (s.id.as_str(), s)).collect();
    for task in plan.tasks.iter_mut() {
        if let Some(service) = by_id.get(task.service.as_str()) {
            task.service_details = service.describe();
        }
    }
}

/// Constant inputs seeding the log: a planner-supplied `task0` wins,
/// otherwise the action params become the seed.
fn task_zero_input(plan: &Plan, params: &[ActionParam]) -> Value {
    if let Some(task_zero) = plan.tasks.iter().find(|t| t.is_task_zero()) {
        let fields: serde_json::Map<String, Value> = task_zero
            .input
            .iter()
            .map(|(k, v)| (k.clone(), json!(v.0.clone())))
            .collect();
        return Value::Object(fields);
    }
    let fields: serde_json::Map<String, Value> = params
        .iter()
        .map(|p| (p.field.clone(), json!(p.value.clone())))
        .collect();
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceSchema;

    fn service(id: &str, inputs: &[&str]) -> Arc<ServiceInfo> {
        let mut properties = crate::Properties::new();
        for input in inputs {
            properties.insert(
                input.to_string(),
                crate::Spec {
                    kind: "string".into(),
                    ..Default::default()
                },
            );
        }
        Arc::new(ServiceInfo {
            kind: ServiceType::Service,
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            schema: ServiceSchema {
                input: crate::Spec {
                    kind: "object".into(),
                    properties,
                    ..Default::default()
                },
                output: crate::Spec::default(),
            },
            project_id: "p1".into(),
            version: 1,
            idempotency: Arc::new(IdempotencyStore::new()),
        })
    }

    #[test]
    fn validation_rejects_unknown_service() {
        let services = vec![service("svc-a", &["x"])];
        let plan = Plan::parse(r#"{"tasks":[{"id":"task1","service":"svc-b","input":{"x":"1"}}]}"#)
            .unwrap();
        let err = validate_plan(&services, &plan).unwrap_err();
        assert!(err.to_string().contains("service svc-b not found"));
    }

    #[test]
    fn validation_rejects_undeclared_input() {
        let services = vec![service("svc-a", &["x"])];
        let plan = Plan::parse(r#"{"tasks":[{"id":"task1","service":"svc-a","input":{"y":"1"}}]}"#)
            .unwrap();
        let err = validate_plan(&services, &plan).unwrap_err();
        assert!(err.to_string().contains("input y not supported"));
    }

    #[test]
    fn task_zero_prefers_planned_seed() {
        let plan = Plan::parse(
            r#"{"tasks":[{"id":"task0","input":{"x":"42"}},{"id":"task1","service":"s","input":{"x":"$task0.x"}}]}"#,
        )
        .unwrap();
        let seed = task_zero_input(&plan, &[]);
        assert_eq!(seed, json!({"x": "42"}));
    }

    #[test]
    fn task_zero_falls_back_to_action_params() {
        let plan = Plan::parse(r#"{"tasks":[{"id":"task1","service":"s","input":{}}]}"#).unwrap();
        let params = vec![ActionParam {
            field: "x".into(),
            value: "42".into(),
        }];
        assert_eq!(task_zero_input(&plan, &params), json!({"x": "42"}));
    }
}
