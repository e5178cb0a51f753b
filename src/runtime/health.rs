//! Health coordination: maps worker health transitions onto orchestration
//! pause/resume and restarts interrupted task workers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::connection::HealthEvent;
use crate::plane::ControlPlane;
use crate::runtime::LogManager;
use crate::Status;

/// Consumes the connection manager's health events. Identical consecutive
/// states for a service are ignored; real transitions pause or resume every
/// active orchestration task targeting that service.
pub struct HealthCoordinator {
    plane: Weak<ControlPlane>,
    log_manager: Arc<LogManager>,
    last_state: HashMap<String, bool>,
}

impl HealthCoordinator {
    pub fn new(plane: Weak<ControlPlane>, log_manager: Arc<LogManager>) -> Self {
        Self {
            plane,
            log_manager,
            last_state: HashMap::new(),
        }
    }

    /// Run the coordinator over the health event channel until cancelled.
    pub fn spawn(
        mut self,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        self.handle_transition(&event.service_id, event.healthy).await;
                    }
                }
            }
        })
    }

    async fn handle_transition(&mut self, service_id: &str, healthy: bool) {
        if self.last_state.get(service_id) == Some(&healthy) {
            return;
        }
        self.last_state.insert(service_id.to_string(), healthy);

        let Some(plane) = self.plane.upgrade() else {
            return;
        };
        let affected = plane.active_orchestrations_with_tasks(service_id).await;
        if affected.is_empty() {
            debug!(service_id, healthy, "health transition with no active orchestrations");
            return;
        }

        if !healthy {
            self.log_manager
                .update_active_orchestrations(
                    &affected,
                    service_id,
                    "service_unhealthy",
                    Status::Processing,
                    Status::Paused,
                )
                .await;
            return;
        }

        self.log_manager
            .update_active_orchestrations(
                &affected,
                service_id,
                "service_healthy",
                Status::Paused,
                Status::Processing,
            )
            .await;
        self.restart_orchestration_tasks(&plane, &affected).await;
    }

    /// Restart every non-completed affected task under a fresh worker;
    /// idempotency fingerprints prevent duplicate execution.
    async fn restart_orchestration_tasks(
        &self,
        plane: &Arc<ControlPlane>,
        affected: &HashMap<String, Vec<crate::plan::SubTask>>,
    ) {
        for (orchestration_id, tasks) in affected {
            let orchestration_id = orchestration_id.as_str();
            for task in tasks {
                let completed = match self
                    .log_manager
                    .is_task_completed(orchestration_id, &task.id)
                    .await
                {
                    Ok(completed) => completed,
                    Err(e) => {
                        error!(
                            orchestration_id,
                            task_id = %task.id,
                            error = %e,
                            "failed to check task completion during restart, continuing"
                        );
                        false
                    }
                };
                if completed {
                    continue;
                }

                debug!(orchestration_id, task_id = %task.id, "restarting task worker");
                plane.stop_task_worker(orchestration_id, &task.id).await;
                plane.start_task_worker(orchestration_id, task).await;
            }
        }
    }
}
