//! Result aggregation: the sole producer of the completed terminal.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::log::{EntryType, LogEntry};
use crate::runtime::worker::POLL_INTERVAL;
use crate::runtime::LogManager;
use crate::Status;

/// Watches the log for every task's output; once all have reported, marks
/// the orchestration completed and finalizes it with the aggregated result.
pub struct ResultAggregator {
    dependencies: HashSet<String>,
    log_manager: Arc<LogManager>,
}

impl ResultAggregator {
    /// `dependencies` is the full set of service task ids in the plan.
    pub fn new(dependencies: HashSet<String>, log_manager: Arc<LogManager>) -> Self {
        Self {
            dependencies,
            log_manager,
        }
    }

    pub async fn run(self, orchestration_id: String, cancel: CancellationToken) {
        let Some(log) = self.log_manager.get_log(&orchestration_id).await else {
            error!(orchestration_id, "log not found for orchestration");
            return;
        };

        let mut last_offset = 0u64;
        let mut processed: HashSet<String> = HashSet::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(orchestration_id, "result aggregator stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let entries = log.read_from(last_offset).await;
                    for entry in entries {
                        last_offset = entry.offset + 1;
                        if !self.should_process(&entry, &processed) {
                            continue;
                        }
                        if self.process_entry(&orchestration_id, entry, &mut processed, &mut outputs).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn should_process(&self, entry: &LogEntry, processed: &HashSet<String>) -> bool {
        entry.entry_type == EntryType::TaskOutput
            && self.dependencies.contains(&entry.id)
            && !processed.contains(&entry.id)
    }

    /// Returns true once the orchestration has been finalized.
    async fn process_entry(
        &self,
        orchestration_id: &str,
        entry: LogEntry,
        processed: &mut HashSet<String>,
        outputs: &mut BTreeMap<String, Value>,
    ) -> bool {
        outputs.insert(entry.id.clone(), entry.value.clone());

        let complete = self.dependencies.iter().all(|dep| outputs.contains_key(dep));
        if !complete {
            return false;
        }

        processed.insert(entry.id.clone());
        debug!(orchestration_id, "all task outputs reported, completing orchestration");

        if let Err(e) = self
            .log_manager
            .mark_task(orchestration_id, &entry.id, Status::Completed)
            .await
        {
            error!(orchestration_id, task_id = %entry.id, error = %e, "cannot mark final task completed");
            self.log_manager
                .fail_orchestration(
                    orchestration_id,
                    json!(format!("result aggregator failed: {e}")),
                )
                .await;
            return true;
        }
        if let Err(e) = self
            .log_manager
            .mark_orchestration(orchestration_id, Status::Completed, None)
            .await
        {
            error!(orchestration_id, error = %e, "cannot mark orchestration completed");
            return true;
        }

        // Deterministic pick: last output in task-id sort order.
        let result = outputs
            .values()
            .next_back()
            .cloned()
            .unwrap_or(Value::Null);
        if let Err(e) = self
            .log_manager
            .finalize_orchestration(orchestration_id, Status::Completed, None, vec![result])
            .await
        {
            error!(orchestration_id, error = %e, "failed to finalize completed orchestration");
        }
        true
    }
}
