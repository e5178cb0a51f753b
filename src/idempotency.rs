//! Per-service idempotency store.
//!
//! Maps execution fingerprints to their state with time-bounded leases.
//! Concurrent attempts for one fingerprint see the in-progress record and
//! wait instead of re-executing; an expired lease lets a new attempt take
//! over. Entries older than the store TTL are swept periodically.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// SHA-256 fingerprint over (orchestration id, task id, sorted dependency
/// inputs), hex-encoded. Equal keys mean semantically equivalent
/// re-execution.
pub type IdempotencyKey = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    InProgress,
    Completed,
    Failed,
}

/// One attempt to run a task, tracked per fingerprint.
#[derive(Clone, Debug)]
pub struct Execution {
    pub execution_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub state: ExecutionState,
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
}

pub struct IdempotencyStore {
    executions: Mutex<HashMap<IdempotencyKey, Execution>>,
    lease: Duration,
    ttl: Duration,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_LEASE, DEFAULT_TTL)
    }

    /// Custom lease and TTL, used by tests to exercise takeover and sweep
    /// without waiting out the defaults.
    pub fn with_config(lease: Duration, ttl: Duration) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            lease,
            ttl,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    fn lease_expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::from_std(self.lease).unwrap_or_else(|_| ChronoDuration::seconds(30))
    }

    /// Claim the fingerprint or observe the existing claim.
    ///
    /// Returns the execution record and whether this caller now owns a new
    /// attempt. Terminal records and in-progress records with a live lease
    /// are returned as-is (`is_new = false`); an expired in-progress lease
    /// is taken over by the caller.
    pub async fn initialize(
        &self,
        key: &IdempotencyKey,
        execution_id: &str,
    ) -> (Execution, bool) {
        let mut executions = self.executions.lock().await;
        let now = Utc::now();

        if let Some(execution) = executions.get_mut(key) {
            match execution.state {
                ExecutionState::Completed | ExecutionState::Failed => {
                    return (execution.clone(), false);
                }
                ExecutionState::InProgress => {
                    if now > execution.lease_expiry {
                        execution.execution_id = execution_id.to_string();
                        execution.started_at = now;
                        execution.lease_expiry = self.lease_expiry_from(now);
                        return (execution.clone(), true);
                    }
                    return (execution.clone(), false);
                }
            }
        }

        let execution = Execution {
            execution_id: execution_id.to_string(),
            result: None,
            error: None,
            state: ExecutionState::InProgress,
            timestamp: now,
            started_at: now,
            lease_expiry: self.lease_expiry_from(now),
        };
        executions.insert(key.clone(), execution.clone());
        (execution, true)
    }

    /// Extend the lease, but only for the in-progress execution that owns it.
    pub async fn renew_lease(&self, key: &IdempotencyKey, execution_id: &str) -> bool {
        let mut executions = self.executions.lock().await;
        match executions.get_mut(key) {
            Some(execution)
                if execution.state == ExecutionState::InProgress
                    && execution.execution_id == execution_id =>
            {
                execution.lease_expiry = self.lease_expiry_from(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record the terminal result for a fingerprint. An error marks the
    /// execution failed; otherwise it is completed.
    pub async fn update_result(
        &self,
        key: &IdempotencyKey,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let mut executions = self.executions.lock().await;
        if let Some(execution) = executions.get_mut(key) {
            execution.state = if error.is_some() {
                ExecutionState::Failed
            } else {
                ExecutionState::Completed
            };
            execution.result = result;
            execution.error = error;
            execution.timestamp = Utc::now();
        }
    }

    /// Defensive copy of the execution record, if present.
    pub async fn get(&self, key: &IdempotencyKey) -> Option<Execution> {
        self.executions.lock().await.get(key).cloned()
    }

    pub async fn clear(&self, key: &IdempotencyKey) {
        self.executions.lock().await.remove(key);
    }

    /// Drop entries last touched before `cutoff`.
    pub async fn sweep_older_than(&self, cutoff: DateTime<Utc>) {
        let mut executions = self.executions.lock().await;
        let before = executions.len();
        executions.retain(|_, e| e.timestamp >= cutoff);
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, "swept expired idempotency records");
        }
    }

    /// Spawn the hourly TTL sweeper; lives until the token is cancelled.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            - ChronoDuration::from_std(store.ttl)
                                .unwrap_or_else(|_| ChronoDuration::hours(24));
                        store.sweep_older_than(cutoff).await;
                    }
                }
            }
        })
    }
}
