//! Failure tracking: the sole producer of the failed terminal.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::log::EntryType;
use crate::runtime::worker::POLL_INTERVAL;
use crate::runtime::LogManager;
use crate::Status;

/// Watches the log for `task_failure` entries; the first one terminates the
/// orchestration with a structured failure reason.
pub struct FailureTracker {
    log_manager: Arc<LogManager>,
}

impl FailureTracker {
    pub fn new(log_manager: Arc<LogManager>) -> Self {
        Self { log_manager }
    }

    pub async fn run(self, orchestration_id: String, cancel: CancellationToken) {
        let Some(log) = self.log_manager.get_log(&orchestration_id).await else {
            error!(orchestration_id, "log not found for orchestration");
            return;
        };

        let mut last_offset = 0u64;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(orchestration_id, "failure tracker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let entries = log.read_from(last_offset).await;
                    for entry in entries {
                        last_offset = entry.offset + 1;
                        if entry.entry_type != EntryType::TaskFailure {
                            continue;
                        }

                        let reason = json!({
                            "id": entry.id,
                            "producer": entry.producer_id,
                            "orchestration": orchestration_id,
                            "error": entry.value,
                        });

                        let reason_text = reason.to_string();
                        if let Err(e) = self
                            .log_manager
                            .mark_orchestration(&orchestration_id, Status::Failed, Some(&reason_text))
                            .await
                        {
                            error!(orchestration_id, error = %e, "cannot mark orchestration failed");
                            return;
                        }
                        if let Err(e) = self
                            .log_manager
                            .finalize_orchestration(
                                &orchestration_id,
                                Status::Failed,
                                Some(reason),
                                Vec::new(),
                            )
                            .await
                        {
                            error!(orchestration_id, error = %e, "failed to finalize failed orchestration");
                        }
                        return;
                    }
                }
            }
        }
    }
}
