//! Orchestration runtime: the log manager and the log workers.
//!
//! The [`LogManager`] exclusively owns every orchestration's log and state;
//! workers, the aggregator, the tracker, and the health coordinator all go
//! through its operations. Status transitions are CAS-style: a transition
//! whose expected prior status does not match is ignored and logged.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::log::{EntryType, Log, LogEntry};
use crate::plan::{Plan, SubTask};
use crate::plane::ControlPlane;
use crate::Status;

pub mod aggregator;
pub mod failure;
pub mod health;
pub mod worker;

pub use aggregator::ResultAggregator;
pub use failure::FailureTracker;
pub use health::HealthCoordinator;
pub use worker::{TaskError, TaskWorker};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("orchestration {0} has no associated state")]
    UnknownOrchestration(String),
    #[error("orchestration {0} has no log")]
    UnknownLog(String),
}

/// Mutable bookkeeping for one in-flight orchestration. Lifecycle is bound
/// to the log: both are created by `prep_log` and destroyed together on
/// finalize or retention.
#[derive(Clone, Debug)]
pub struct OrchestrationState {
    pub id: String,
    pub project_id: String,
    pub plan: Plan,
    pub task_statuses: HashMap<String, Status>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Owns logs and orchestration states and mediates every status transition.
pub struct LogManager {
    logs: RwLock<HashMap<String, Arc<Log>>>,
    states: RwLock<HashMap<String, OrchestrationState>>,
    retention: Duration,
    plane: OnceLock<Weak<ControlPlane>>,
}

impl LogManager {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            logs: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            retention,
            plane: OnceLock::new(),
        })
    }

    /// Wire the owning control plane in after construction; finalization
    /// delegates the webhook and worker teardown to it.
    pub fn bind_plane(&self, plane: Weak<ControlPlane>) {
        let _ = self.plane.set(plane);
    }

    /// Create an empty log and a `Processing` state for an orchestration.
    pub async fn prep_log(
        &self,
        orchestration_id: &str,
        project_id: &str,
        plan: Plan,
    ) -> Arc<Log> {
        let log = Arc::new(Log::new());
        let task_statuses = plan
            .service_tasks()
            .map(|t| (t.id.clone(), Status::Pending))
            .collect();
        let state = OrchestrationState {
            id: orchestration_id.to_string(),
            project_id: project_id.to_string(),
            plan,
            task_statuses,
            status: Status::Processing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error: None,
        };

        self.logs
            .write()
            .await
            .insert(orchestration_id.to_string(), log.clone());
        self.states
            .write()
            .await
            .insert(orchestration_id.to_string(), state);

        debug!(orchestration_id, "created log for orchestration");
        log
    }

    pub async fn get_log(&self, orchestration_id: &str) -> Option<Arc<Log>> {
        self.logs.read().await.get(orchestration_id).cloned()
    }

    /// Append an entry to an orchestration's log.
    pub async fn append_to_log(
        &self,
        orchestration_id: &str,
        entry_type: EntryType,
        id: &str,
        value: Value,
        producer_id: &str,
        attempt_num: u32,
    ) -> Result<(), StateError> {
        let log = self
            .get_log(orchestration_id)
            .await
            .ok_or_else(|| StateError::UnknownLog(orchestration_id.to_string()))?;
        log.append(LogEntry::new(entry_type, id, value, producer_id, attempt_num))
            .await;
        Ok(())
    }

    /// Record a task failure in the log; the failure tracker converts the
    /// first such entry into the orchestration's failure terminal.
    pub async fn append_failure(
        &self,
        orchestration_id: &str,
        entry_id: &str,
        producer_id: &str,
        reason: &str,
    ) -> Result<(), StateError> {
        self.append_to_log(
            orchestration_id,
            EntryType::TaskFailure,
            entry_id,
            Value::String(reason.to_string()),
            producer_id,
            0,
        )
        .await
    }

    /// Set one task's status.
    pub async fn mark_task(
        &self,
        orchestration_id: &str,
        task_id: &str,
        status: Status,
    ) -> Result<(), StateError> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(orchestration_id)
            .ok_or_else(|| StateError::UnknownOrchestration(orchestration_id.to_string()))?;
        state.task_statuses.insert(task_id.to_string(), status);
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Set the orchestration status, optionally with an error reason.
    /// Idempotent: re-marking the current status is a no-op.
    pub async fn mark_orchestration(
        &self,
        orchestration_id: &str,
        status: Status,
        reason: Option<&str>,
    ) -> Result<(), StateError> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(orchestration_id)
            .ok_or_else(|| StateError::UnknownOrchestration(orchestration_id.to_string()))?;
        if state.status == status {
            return Ok(());
        }
        state.status = status;
        state.error = reason.map(str::to_string);
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Shift every affected orchestration currently in `from` to `to`,
    /// pause or resume its non-completed affected tasks, and record one
    /// status-change entry per orchestration.
    ///
    /// Status-change entries get minted ids so repeated pause/resume cycles
    /// are never swallowed by the log's idempotent append.
    pub async fn update_active_orchestrations(
        &self,
        affected: &HashMap<String, Vec<SubTask>>,
        service_id: &str,
        reason: &str,
        from: Status,
        to: Status,
    ) {
        for (orchestration_id, tasks) in affected {
            let orchestration_id = orchestration_id.as_str();
            {
                let mut states = self.states.write().await;
                let Some(state) = states.get_mut(orchestration_id) else {
                    warn!(orchestration_id, "status update for unknown orchestration");
                    continue;
                };
                if state.status != from {
                    debug!(
                        orchestration_id,
                        expected = %from,
                        actual = %state.status,
                        "skipping orchestration status transition"
                    );
                    continue;
                }
                state.status = to;
                state.updated_at = Utc::now();
                for task in tasks {
                    let current = state.task_statuses.get(&task.id).copied();
                    if current != Some(Status::Completed) {
                        state.task_statuses.insert(task.id.clone(), to);
                    }
                }
            }

            let entry_id = uuid::Uuid::new_v4().to_string();
            let value = json!({
                "status": to,
                "reason": reason,
                "service": service_id,
            });
            if let Err(e) = self
                .append_to_log(
                    orchestration_id,
                    EntryType::OrchestrationStatusChange,
                    &entry_id,
                    value,
                    service_id,
                    0,
                )
                .await
            {
                warn!(orchestration_id, error = %e, "failed to record status change");
            }
        }
    }

    /// Terminate an orchestration: drop its log and state, then delegate the
    /// webhook and worker teardown to the control plane.
    ///
    /// The first caller wins; later callers find nothing and return Ok, so
    /// the aggregator/tracker race resolves to exactly one terminal.
    pub async fn finalize_orchestration(
        &self,
        orchestration_id: &str,
        status: Status,
        reason: Option<Value>,
        results: Vec<Value>,
    ) -> Result<(), crate::plane::PlaneError> {
        let removed = {
            let mut logs = self.logs.write().await;
            let mut states = self.states.write().await;
            let log = logs.remove(orchestration_id);
            let state = states.remove(orchestration_id);
            log.is_some() || state.is_some()
        };
        if !removed {
            debug!(
                orchestration_id,
                status = %status,
                "finalize for already-terminated orchestration ignored"
            );
            return Ok(());
        }

        let plane = self
            .plane
            .get()
            .and_then(Weak::upgrade)
            .ok_or(crate::plane::PlaneError::Shutdown)?;
        plane
            .finalize_orchestration(orchestration_id, status, reason, results)
            .await
    }

    pub async fn is_task_paused(
        &self,
        orchestration_id: &str,
        task_id: &str,
    ) -> Result<bool, StateError> {
        self.task_status(orchestration_id, task_id)
            .await
            .map(|s| s == Some(Status::Paused))
    }

    pub async fn is_task_completed(
        &self,
        orchestration_id: &str,
        task_id: &str,
    ) -> Result<bool, StateError> {
        self.task_status(orchestration_id, task_id)
            .await
            .map(|s| s == Some(Status::Completed))
    }

    async fn task_status(
        &self,
        orchestration_id: &str,
        task_id: &str,
    ) -> Result<Option<Status>, StateError> {
        let states = self.states.read().await;
        let state = states
            .get(orchestration_id)
            .ok_or_else(|| StateError::UnknownOrchestration(orchestration_id.to_string()))?;
        Ok(state.task_statuses.get(task_id).copied())
    }

    pub async fn is_orchestration_paused(&self, orchestration_id: &str) -> bool {
        self.states
            .read()
            .await
            .get(orchestration_id)
            .map(|s| s.status == Status::Paused)
            .unwrap_or(false)
    }

    pub async fn orchestration_project_id(
        &self,
        orchestration_id: &str,
    ) -> Result<String, StateError> {
        let states = self.states.read().await;
        states
            .get(orchestration_id)
            .map(|s| s.project_id.clone())
            .ok_or_else(|| StateError::UnknownOrchestration(orchestration_id.to_string()))
    }

    pub async fn orchestration_status(&self, orchestration_id: &str) -> Option<Status> {
        self.states
            .read()
            .await
            .get(orchestration_id)
            .map(|s| s.status)
    }

    /// Drop completed orchestrations whose last update is older than
    /// `cutoff`, along with their logs.
    pub async fn sweep_completed_before(&self, cutoff: DateTime<Utc>) {
        let mut logs = self.logs.write().await;
        let mut states = self.states.write().await;
        let stale: Vec<String> = states
            .iter()
            .filter(|(_, s)| s.status == Status::Completed && s.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            states.remove(&id);
            logs.remove(&id);
            debug!(orchestration_id = %id, "retention removed stale orchestration");
        }
    }

    /// Periodic retention sweep; lives until the token is cancelled.
    pub fn spawn_retention_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            - ChronoDuration::from_std(manager.retention)
                                .unwrap_or_else(|_| ChronoDuration::hours(24));
                        manager.sweep_completed_before(cutoff).await;
                    }
                }
            }
        })
    }

    /// Fail an orchestration outright: mark it, then finalize with the
    /// failure reason. Used when a log worker itself breaks.
    pub(crate) async fn fail_orchestration(&self, orchestration_id: &str, reason: Value) {
        let reason_text = reason.as_str().map(str::to_string).unwrap_or_else(|| reason.to_string());
        if let Err(e) = self
            .mark_orchestration(orchestration_id, Status::Failed, Some(&reason_text))
            .await
        {
            error!(orchestration_id, error = %e, "orchestration not found for failure handling");
            return;
        }
        if let Err(e) = self
            .finalize_orchestration(orchestration_id, Status::Failed, Some(reason), Vec::new())
            .await
        {
            error!(orchestration_id, error = %e, "failed to finalize failed orchestration");
        }
    }
}
