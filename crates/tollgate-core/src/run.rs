//! Run, job instance and report types.

use crate::ids::{JobId, RunId};
use crate::workflow::{EventKind, render_value};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An incoming event that may activate a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// The triggering branch: the pushed branch, or the head branch of a
    /// pull request.
    pub branch: String,
    /// Target branch of a pull request.
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub actor: String,
}

impl TriggerEvent {
    pub fn push(branch: &str, actor: &str) -> Self {
        Self {
            kind: EventKind::Push,
            branch: branch.to_string(),
            target_branch: None,
            actor: actor.to_string(),
        }
    }

    pub fn pull_request(head: &str, target: &str, actor: &str) -> Self {
        Self {
            kind: EventKind::PullRequest,
            branch: head.to_string(),
            target_branch: Some(target.to_string()),
            actor: actor.to_string(),
        }
    }

    pub fn manual(branch: &str, actor: &str) -> Self {
        Self {
            kind: EventKind::Manual,
            branch: branch.to_string(),
            target_branch: None,
            actor: actor.to_string(),
        }
    }
}

/// Event context bound by an activation and carried through the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunContext {
    pub kind: EventKind,
    pub branch: String,
    pub target_branch: Option<String>,
    pub actor: String,
}

impl From<&TriggerEvent> for RunContext {
    fn from(event: &TriggerEvent) -> Self {
        Self {
            kind: event.kind,
            branch: event.branch.clone(),
            target_branch: event.target_branch.clone(),
            actor: event.actor.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A concrete, runnable unit: a job template bound to one value per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: JobId,
    pub template: String,
    /// Position within the template's expansion.
    pub index: usize,
    /// Chosen value per axis, in axis declaration order.
    pub matrix: Vec<(String, serde_json::Value)>,
    pub display_name: String,
}

impl JobInstance {
    /// The axis-value tuple identifying this instance within its template.
    pub fn cell(&self) -> Vec<String> {
        self.matrix.iter().map(|(_, v)| render_value(v)).collect()
    }

    /// Matrix values keyed by axis name, for interpolation.
    pub fn matrix_values(&self) -> HashMap<String, String> {
        self.matrix
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect()
    }
}

/// Terminal outcome recorded for a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Skipped(String),
    Cancelled(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Skipped(_) => JobState::Skipped,
            JobOutcome::Cancelled(_) => JobState::Cancelled,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(r) | JobOutcome::Skipped(r) | JobOutcome::Cancelled(r) => Some(r),
        }
    }
}

/// One line of the run report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    pub id: JobId,
    pub template: String,
    pub display_name: String,
    pub matrix: Vec<(String, String)>,
    pub state: JobState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailureKind {
    /// Transport failure; an operator may retry the run.
    Transient,
    /// Authentication or rejection; never retried automatically.
    Fatal,
}

/// Result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishResult {
    Published {
        artifact: String,
        version: String,
    },
    /// The pair was already attempted in this run; the registry was not called.
    Duplicate {
        artifact: String,
        version: String,
    },
    Failed {
        artifact: String,
        version: String,
        kind: PublishFailureKind,
        message: String,
    },
}

impl PublishResult {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishResult::Published { .. })
    }

    pub fn version(&self) -> &str {
        match self {
            PublishResult::Published { version, .. }
            | PublishResult::Duplicate { version, .. }
            | PublishResult::Failed { version, .. } => version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Cancelled,
}

/// Observable report of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub context: RunContext,
    /// Job outcomes in template declaration order, then matrix order.
    pub jobs: Vec<JobReport>,
    pub publish: Option<PublishResult>,
    pub outcome: RunOutcome,
    /// Set when the run failed only because of a transient publish failure.
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    pub fn jobs_for(&self, template: &str) -> Vec<&JobReport> {
        self.jobs.iter().filter(|j| j.template == template).collect()
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Skipped.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_instance_cell_rendering() {
        let instance = JobInstance {
            id: JobId::new(),
            template: "validate".to_string(),
            index: 0,
            matrix: vec![
                ("python-version".to_string(), serde_json::json!("3.10")),
                ("shard".to_string(), serde_json::json!(2)),
            ],
            display_name: "validate (3.10, 2)".to_string(),
        };
        assert_eq!(instance.cell(), vec!["3.10", "2"]);
        assert_eq!(instance.matrix_values()["shard"], "2");
    }

    #[test]
    fn test_publish_result_serialization() {
        let result = PublishResult::Failed {
            artifact: "yamlpath".to_string(),
            version: "2.0.RC20240101000000".to_string(),
            kind: PublishFailureKind::Transient,
            message: "connection reset".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], "failed");
        assert_eq!(json["kind"], "transient");
    }
}
