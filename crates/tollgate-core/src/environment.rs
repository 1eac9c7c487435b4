//! Environments and approval types.

use crate::ids::{ApprovalToken, JobId, RunId};
use crate::secrets::SecretRef;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deployment environment a job can be bound to.
///
/// Secrets are only referenced here; values are resolved by the publisher
/// through the gate's scope handle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentDefinition {
    pub name: String,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
}

/// Approval request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// An approval request raised by the environment gate for one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRequest {
    pub token: ApprovalToken,
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_name: String,
    pub environment: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(run_id: RunId, job_id: JobId, job_name: &str, environment: &str) -> Self {
        Self {
            token: ApprovalToken::new(),
            run_id,
            job_id,
            job_name: job_name.to_string(),
            environment: environment.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Record an approval.
    pub fn approve(&mut self, actor: &str) {
        self.resolve(ApprovalStatus::Approved, actor);
    }

    /// Record a rejection.
    pub fn reject(&mut self, actor: &str) {
        self.resolve(ApprovalStatus::Rejected, actor);
    }

    fn resolve(&mut self, status: ApprovalStatus, actor: &str) {
        self.status = status;
        self.resolved_by = Some(actor.to_string());
        self.resolved_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_request_lifecycle() {
        let mut request = ApprovalRequest::new(RunId::new(), JobId::new(), "publish", "pypi");
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(!request.status.is_resolved());

        request.approve("maintainer");
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert_eq!(request.resolved_by.as_deref(), Some("maintainer"));
        assert!(request.resolved_at.is_some());
    }

    #[test]
    fn test_environment_defaults() {
        let env: EnvironmentDefinition = serde_yaml::from_str("name: pypi").unwrap();
        assert!(!env.require_approval);
        assert!(env.secrets.is_empty());
    }
}
