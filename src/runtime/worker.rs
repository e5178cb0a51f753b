//! Per-task log worker.
//!
//! One worker runs for every service task in a plan. It polls the
//! orchestration log for its dependencies, merges their payloads into the
//! task input, and dispatches the task to its service with an idempotency
//! fingerprint so that retries, restarts, and takeovers never execute the
//! same work twice. Failures are classified into retryable and permanent;
//! retryable ones go through exponential backoff, permanent ones end up as
//! a `task_failure` entry for the failure tracker.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::connection::{ConnectionManager, TaskRequest};
use crate::idempotency::ExecutionState;
use crate::log::{EntryType, LogEntry};
use crate::runtime::{LogManager, StateError};
use crate::{ServiceInfo, Status};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 5;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(60);
const BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task execution timed out waiting for result")]
    ExecutionTimeout,
    #[error("failed to send task to service {service_id}: {reason}")]
    SendFailed { service_id: String, reason: String },
    #[error("{message}")]
    WorkerFailed { message: String, retryable: bool },
    #[error("execution lease expired while waiting")]
    LeaseExpired,
    #[error("task is paused")]
    Paused,
    #[error("task worker cancelled")]
    Cancelled,
    #[error("too many consecutive failures: {0}")]
    TooManyFailures(#[source] Box<TaskError>),
    #[error("retry budget exhausted: {0}")]
    RetriesExhausted(#[source] Box<TaskError>),
    #[error("dependency payload for {0} is not a JSON object")]
    MalformedDependency(String),
    #[error(transparent)]
    State(#[from] StateError),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        // LeaseExpired is retryable so the next attempt can take over the
        // fingerprint; the takeover path in the store depends on it.
        matches!(
            self,
            TaskError::ExecutionTimeout
                | TaskError::SendFailed { .. }
                | TaskError::LeaseExpired
                | TaskError::WorkerFailed {
                    retryable: true,
                    ..
                }
        )
    }

    /// Classify an error string reported by a worker. The retryable set is
    /// deliberately small and explicit.
    fn worker_failed(message: String) -> Self {
        let lowered = message.to_lowercase();
        let retryable = lowered.contains("task execution timed out")
            || lowered.contains("failed to send task")
            || lowered.contains("failed to read result")
            || lowered.contains("rate limit exceeded");
        TaskError::WorkerFailed { message, retryable }
    }
}

/// Exponential backoff driver: 500 ms initial, x1.5 growth capped at 60 s,
/// 10 minutes total budget.
pub(crate) struct ExponentialBackoff {
    current: Duration,
    elapsed: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            current: BACKOFF_INITIAL,
            elapsed: Duration::ZERO,
        }
    }
}

impl ExponentialBackoff {
    /// The next delay to sleep, or `None` once the total budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed >= BACKOFF_MAX_ELAPSED {
            return None;
        }
        let delay = self.current;
        self.elapsed += delay;
        let next = self.current.mul_f64(BACKOFF_MULTIPLIER);
        self.current = next.min(BACKOFF_MAX_INTERVAL);
        Some(delay)
    }
}

#[derive(Default)]
struct Cursor {
    last_offset: u64,
    processed: HashSet<String>,
    dependency_state: BTreeMap<String, Value>,
}

/// Executes one task of one orchestration, driven by the log.
pub struct TaskWorker {
    service: Arc<ServiceInfo>,
    task_id: String,
    dependencies: HashSet<String>,
    log_manager: Arc<LogManager>,
    connections: Arc<ConnectionManager>,
}

impl TaskWorker {
    pub fn new(
        service: Arc<ServiceInfo>,
        task_id: impl Into<String>,
        dependencies: HashSet<String>,
        log_manager: Arc<LogManager>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            service,
            task_id: task_id.into(),
            dependencies,
            log_manager,
            connections,
        }
    }

    /// Poll the orchestration log until cancelled, executing the task once
    /// all dependencies have reported.
    pub async fn run(self: Arc<Self>, orchestration_id: String, cancel: CancellationToken) {
        let Some(log) = self.log_manager.get_log(&orchestration_id).await else {
            debug!(orchestration_id, task_id = %self.task_id, "log not found for orchestration");
            return;
        };

        let mut cursor = Cursor::default();
        let mut attempts = 0u32;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(orchestration_id, task_id = %self.task_id, "task worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let entries = log.read_from(cursor.last_offset).await;
                    for entry in entries {
                        if !self.should_process(&entry, &cursor) {
                            continue;
                        }
                        cursor.last_offset = entry.offset + 1;
                        let keep_running = self
                            .process_entry(&orchestration_id, entry, &mut cursor, &mut attempts, &cancel)
                            .await;
                        if !keep_running {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn should_process(&self, entry: &LogEntry, cursor: &Cursor) -> bool {
        entry.entry_type == EntryType::TaskOutput
            && self.dependencies.contains(&entry.id)
            && !cursor.processed.contains(&entry.id)
    }

    /// Buffer a dependency entry; once the dependency set is complete, run
    /// the task. Returns false when the worker should stop.
    async fn process_entry(
        &self,
        orchestration_id: &str,
        entry: LogEntry,
        cursor: &mut Cursor,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> bool {
        cursor
            .dependency_state
            .insert(entry.id.clone(), entry.value.clone());

        let complete = self
            .dependencies
            .iter()
            .all(|dep| cursor.dependency_state.contains_key(dep));
        if !complete {
            return true;
        }

        match self
            .execute_with_retry(orchestration_id, &cursor.dependency_state, cancel, attempts)
            .await
        {
            Ok(output) => {
                cursor.processed.insert(entry.id.clone());
                if let Err(e) = self
                    .log_manager
                    .mark_task(orchestration_id, &self.task_id, Status::Completed)
                    .await
                {
                    error!(orchestration_id, task_id = %self.task_id, error = %e, "cannot mark task completed");
                    let _ = self
                        .log_manager
                        .append_failure(orchestration_id, &self.task_id, &self.service.id, &e.to_string())
                        .await;
                    return false;
                }
                if let Err(e) = self
                    .log_manager
                    .append_to_log(
                        orchestration_id,
                        EntryType::TaskOutput,
                        &self.task_id,
                        output,
                        &self.service.id,
                        *attempts,
                    )
                    .await
                {
                    error!(orchestration_id, task_id = %self.task_id, error = %e, "cannot append task output");
                }
                true
            }
            Err(TaskError::Paused) => {
                debug!(orchestration_id, task_id = %self.task_id, "task is paused, worker exiting");
                false
            }
            Err(TaskError::Cancelled) => false,
            Err(e) => {
                error!(orchestration_id, task_id = %self.task_id, error = %e, "cannot execute task");
                if let Err(append_err) = self
                    .log_manager
                    .append_failure(orchestration_id, &self.task_id, &self.service.id, &e.to_string())
                    .await
                {
                    error!(orchestration_id, task_id = %self.task_id, error = %append_err, "cannot record task failure");
                }
                false
            }
        }
    }

    async fn execute_with_retry(
        &self,
        orchestration_id: &str,
        deps: &BTreeMap<String, Value>,
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<Value, TaskError> {
        let mut backoff = ExponentialBackoff::default();
        let mut consecutive_failures = 0u32;
        loop {
            if self
                .log_manager
                .is_task_paused(orchestration_id, &self.task_id)
                .await?
            {
                debug!(orchestration_id, task_id = %self.task_id, "task is paused");
                return Err(TaskError::Paused);
            }

            *attempts += 1;
            match self.execute_once(orchestration_id, deps, cancel).await {
                Ok(output) => return Ok(output),
                Err(TaskError::Paused) => return Err(TaskError::Paused),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > MAX_RETRIES {
                        return Err(TaskError::TooManyFailures(Box::new(e)));
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let Some(delay) = backoff.next_delay() else {
                        return Err(TaskError::RetriesExhausted(Box::new(e)));
                    };
                    info!(
                        orchestration_id,
                        task_id = %self.task_id,
                        error = %e,
                        retry_after = ?delay,
                        "retrying task after retryable error"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One execution attempt: claim the fingerprint or ride an existing
    /// claim, dispatch if this attempt owns it, then wait on the store.
    async fn execute_once(
        &self,
        orchestration_id: &str,
        deps: &BTreeMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let fingerprint = self.fingerprint(orchestration_id, deps);
        let execution_id = Uuid::new_v4().to_string();

        let (execution, is_new) = self
            .service
            .idempotency
            .initialize(&fingerprint, &execution_id)
            .await;
        if !is_new {
            return match execution.state {
                ExecutionState::Completed => Ok(execution.result.unwrap_or(Value::Null)),
                ExecutionState::Failed => {
                    Err(TaskError::worker_failed(execution.error.unwrap_or_default()))
                }
                ExecutionState::InProgress => self.wait_for_result(&fingerprint, cancel).await,
            };
        }

        let renewal = cancel.child_token();
        self.spawn_lease_renewal(fingerprint.clone(), execution_id.clone(), renewal.clone());
        let _renewal_guard = renewal.drop_guard();

        let input = merge_dependency_payloads(deps)?;
        let project_id = self
            .log_manager
            .orchestration_project_id(orchestration_id)
            .await?;
        let request = TaskRequest {
            kind: TaskRequest::KIND.to_string(),
            id: self.task_id.clone(),
            execution_id,
            idempotency_key: fingerprint.clone(),
            service_id: self.service.id.clone(),
            orchestration_id: orchestration_id.to_string(),
            project_id,
            input,
            status: Status::Processing,
        };

        self.connections
            .send_task(&self.service.id, &request)
            .await
            .map_err(|e| TaskError::SendFailed {
                service_id: self.service.id.clone(),
                reason: e.to_string(),
            })?;

        self.wait_for_result(&fingerprint, cancel).await
    }

    fn spawn_lease_renewal(&self, fingerprint: String, execution_id: String, cancel: CancellationToken) {
        let store = self.service.idempotency.clone();
        let period = store.lease_duration() / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !store.renew_lease(&fingerprint, &execution_id).await {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Poll the idempotency store until the execution terminates, bounded
    /// by the per-attempt timeout.
    async fn wait_for_result(
        &self,
        fingerprint: &String,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        let deadline = tokio::time::sleep(MAX_EXECUTION_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = &mut deadline => return Err(TaskError::ExecutionTimeout),
                _ = ticker.tick() => {
                    if let Some(execution) = self.service.idempotency.get(fingerprint).await {
                        match execution.state {
                            ExecutionState::Completed => {
                                return Ok(execution.result.unwrap_or(Value::Null));
                            }
                            ExecutionState::Failed => {
                                return Err(TaskError::worker_failed(
                                    execution.error.unwrap_or_default(),
                                ));
                            }
                            ExecutionState::InProgress => {
                                if Utc::now() > execution.lease_expiry {
                                    return Err(TaskError::LeaseExpired);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// SHA-256 over (orchestration id, task id, sorted `dep:payload`
    /// lines); equal fingerprints mean semantically equivalent re-execution.
    fn fingerprint(&self, orchestration_id: &str, deps: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(orchestration_id.as_bytes());
        hasher.update(self.task_id.as_bytes());
        for (dep, value) in deps {
            hasher.update(dep.as_bytes());
            hasher.update(b":");
            hasher.update(value.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Shallow-merge dependency payloads into one input object; later keys
/// override earlier ones. The planner contract keeps field names disjoint
/// across dependencies.
fn merge_dependency_payloads(deps: &BTreeMap<String, Value>) -> Result<Value, TaskError> {
    let mut merged = Map::new();
    for (dep, value) in deps {
        match value {
            Value::Object(fields) => {
                for (k, v) in fields {
                    merged.insert(k.clone(), v.clone());
                }
            }
            _ => return Err(TaskError::MalformedDependency(dep.clone())),
        }
    }
    Ok(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_classification() {
        assert!(TaskError::ExecutionTimeout.is_retryable());
        assert!(TaskError::SendFailed {
            service_id: "s".into(),
            reason: "closed".into()
        }
        .is_retryable());
        assert!(TaskError::worker_failed("rate limit exceeded".into()).is_retryable());
        assert!(TaskError::worker_failed("failed to read result: eof".into()).is_retryable());
        assert!(!TaskError::worker_failed("boom".into()).is_retryable());
        assert!(TaskError::LeaseExpired.is_retryable());
        assert!(!TaskError::Paused.is_retryable());
    }

    #[test]
    fn backoff_grows_and_exhausts() {
        let mut backoff = ExponentialBackoff::default();
        let first = backoff.next_delay().unwrap();
        let second = backoff.next_delay().unwrap();
        assert_eq!(first, BACKOFF_INITIAL);
        assert!(second > first);

        let mut total = first + second;
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= BACKOFF_MAX_INTERVAL);
            total += delay;
        }
        assert!(total >= BACKOFF_MAX_ELAPSED);
    }

    #[test]
    fn merge_is_shallow_with_later_keys_winning() {
        let mut deps = BTreeMap::new();
        deps.insert("task0".to_string(), json!({"x": "1", "shared": "a"}));
        deps.insert("task1".to_string(), json!({"y": "2", "shared": "b"}));
        let merged = merge_dependency_payloads(&deps).unwrap();
        assert_eq!(merged, json!({"x": "1", "y": "2", "shared": "b"}));
    }

    #[test]
    fn merge_rejects_non_object_payloads() {
        let mut deps = BTreeMap::new();
        deps.insert("task0".to_string(), json!("just a string"));
        assert!(matches!(
            merge_dependency_payloads(&deps),
            Err(TaskError::MalformedDependency(dep)) if dep == "task0"
        ));
    }
}
