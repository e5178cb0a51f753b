use std::env;
use std::time::Duration;

/// Synthetic task id carrying the constant inputs of a plan; always the
/// first entry appended to an orchestration log.
pub const TASK_ZERO: &str = "task0";
/// Worker id of the result aggregator within an orchestration.
pub const RESULT_AGGREGATOR_ID: &str = "result_aggregator";
/// Worker id of the failure tracker within an orchestration.
pub const FAILURE_TRACKER_ID: &str = "failure_tracker";
/// Producer id recorded on the task-zero log entry.
pub const CONTROL_PANEL_ID: &str = "control-panel";

/// Heartbeat text frames exchanged on worker sessions.
pub const WS_PING: &str = "ping";
pub const WS_PONG: &str = "pong";

/// Runtime configuration loaded from the environment.
///
/// Only the knobs the external edge cares about live here; per-subsystem
/// tuning (lease durations, poll intervals, queue capacities) is carried as
/// associated constants or config structs next to the code that uses them.
#[derive(Clone, Debug)]
pub struct Config {
    /// Listen port advertised to the HTTP edge. Defaults to 8005.
    pub port: u16,
    /// API key handed to the planner backend, if one is configured.
    pub planner_api_key: Option<String>,
    /// Log level filter, e.g. `info` or `taskplane=debug`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8005,
            planner_api_key: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8005);
        let planner_api_key = env::var("PLANNER_API_KEY").ok().filter(|v| !v.is_empty());
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        Self {
            port,
            planner_api_key,
            log_level,
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .try_init();
}

/// Completed orchestrations are dropped this long after their last update.
pub const LOG_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
