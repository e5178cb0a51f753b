//! Execution plans and their synthesis seam.
//!
//! A [`Plan`] is the machine-generated DAG for one orchestration: an ordered
//! list of [`SubTask`]s plus parallel groups. Inputs are [`Source`]s, either
//! literals or `$taskId.field` references to an upstream task's output. The
//! planner itself is external; implementations satisfy [`Planner`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TASK_ZERO;
use crate::{Orchestration, ServiceInfo, Status};

static DEPENDENCY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$([^.]+)\.").expect("dependency pattern is valid"));

/// A high-level user request: a content string plus a descriptive type tag.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub content: String,
}

/// One typed parameter of an action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionParam {
    pub field: String,
    pub value: String,
}

/// Input source for a subtask parameter: either a literal value or a
/// `$taskId.field` reference to another task's output field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Source(pub String);

impl Source {
    /// The id of the task this source references, if it is a reference.
    pub fn dependency(&self) -> Option<&str> {
        extract_dependency_id(&self.0)
    }
}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source(s.to_string())
    }
}

/// Extract the task id from a `$taskId.field` reference; `None` for
/// literals and malformed references.
pub fn extract_dependency_id(source: &str) -> Option<&str> {
    DEPENDENCY_PATTERN
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|id| !id.is_empty())
}

/// A single planned task targeting one service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(
        rename = "service_details",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub service_details: String,
    #[serde(default)]
    pub input: BTreeMap<String, Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl SubTask {
    /// Ids of the tasks whose outputs this task consumes. A task with no
    /// references implicitly depends on task zero.
    pub fn dependencies(&self) -> HashSet<String> {
        let mut deps: HashSet<String> = self
            .input
            .values()
            .filter_map(|s| s.dependency())
            .map(str::to_string)
            .collect();
        if deps.is_empty() {
            deps.insert(TASK_ZERO.to_string());
        }
        deps
    }

    pub fn is_task_zero(&self) -> bool {
        self.id == TASK_ZERO
    }
}

pub type ParallelGroup = Vec<String>;

/// The execution DAG for one orchestration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(skip)]
    pub project_id: String,
    #[serde(default)]
    pub tasks: Vec<SubTask>,
    #[serde(rename = "parallel_groups", default)]
    pub parallel_groups: Vec<ParallelGroup>,
}

impl Plan {
    /// Parse a plan from raw planner output, tolerating fenced ```json
    /// markers around the object.
    pub fn parse(raw: &str) -> Result<Plan, PlanError> {
        let cleaned = strip_json_fence(raw);
        serde_json::from_str(cleaned).map_err(|e| PlanError::Malformed(e.to_string()))
    }

    /// The service tasks of the plan, excluding task zero.
    pub fn service_tasks(&self) -> impl Iterator<Item = &SubTask> {
        self.tasks.iter().filter(|t| !t.is_task_zero())
    }

    /// A plan consisting of a single `final` task means the planner could
    /// not map the action onto the registered services.
    pub fn is_not_actionable(&self) -> bool {
        self.tasks.len() == 1 && self.tasks[0].id.eq_ignore_ascii_case("final")
    }
}

/// Remove surrounding ```json fences some planner backends emit.
pub fn strip_json_fence(input: &str) -> &str {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim();
        }
    }
    trimmed
}

#[derive(Debug, Error)]
pub enum PlanError {
    /// The planner backend could not be reached or rejected the request.
    #[error("planner backend error: {0}")]
    Backend(String),
    /// The planner responded with something that does not parse as a plan.
    #[error("malformed plan: {0}")]
    Malformed(String),
}

/// Synthesizes an execution plan from an action and the services registered
/// to the submitting project. Planning quality is outside this crate's
/// contract; the control plane validates whatever comes back.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(
        &self,
        orchestration: &Orchestration,
        services: &[Arc<ServiceInfo>],
    ) -> Result<Plan, PlanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_dependency_ids() {
        let cases = [
            ("$task0.param1", Some("task0")),
            ("$complex-task-id.field", Some("complex-task-id")),
            ("notadependency", None),
            ("$.invalid", None),
            ("$task0", None),
            ("", None),
        ];
        for (input, expected) in cases {
            assert_eq!(extract_dependency_id(input), expected, "input={input:?}");
        }
    }

    #[test]
    fn implicit_task_zero_dependency() {
        let task: SubTask = serde_json::from_value(serde_json::json!({
            "id": "task1",
            "service": "svc-a",
            "input": {"x": "literal"}
        }))
        .unwrap();
        assert_eq!(task.dependencies(), HashSet::from([TASK_ZERO.to_string()]));
    }

    #[test]
    fn explicit_dependencies_suppress_task_zero() {
        let task: SubTask = serde_json::from_value(serde_json::json!({
            "id": "task2",
            "service": "svc-b",
            "input": {"y": "$task1.y", "mode": "fast"}
        }))
        .unwrap();
        assert_eq!(task.dependencies(), HashSet::from(["task1".to_string()]));
    }

    #[test]
    fn parses_fenced_plan() {
        let raw = "```json\n{\"tasks\":[{\"id\":\"task1\",\"service\":\"s\",\"input\":{}}],\"parallel_groups\":[[\"task1\"]]}\n```";
        let plan = Plan::parse(raw).unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.parallel_groups, vec![vec!["task1".to_string()]]);
    }

    #[test]
    fn final_task_marks_plan_not_actionable() {
        let plan = Plan::parse(r#"{"tasks":[{"id":"final","input":{"error":"no service can translate"}}]}"#)
            .unwrap();
        assert!(plan.is_not_actionable());
    }
}
