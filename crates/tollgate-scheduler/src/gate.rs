//! Environment gate and run-scoped approval ledger.

use crate::cancel::CancelSignal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{RwLock, watch};
use tollgate_core::environment::{ApprovalRequest, ApprovalStatus, EnvironmentDefinition};
use tollgate_core::ids::{ApprovalToken, RunId};
use tollgate_core::run::{JobInstance, RunContext};
use tollgate_core::secrets::{ScopeHandle, SecretScope};
use tollgate_core::{BranchCondition, Error, Result};
use tracing::{debug, info};

/// Result of authorizing a job instance against its environment.
#[derive(Debug, Clone)]
pub enum GateResult {
    /// The job may run; secrets are reachable only through the handle.
    Granted(ScopeHandle),
    /// Waiting on an external approval carrying this token.
    Pending(ApprovalToken),
    /// The job must not run; it becomes skipped.
    Denied(String),
}

impl GateResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, GateResult::Granted(_))
    }
}

/// Approval requests raised during one run.
pub struct ApprovalLedger {
    requests: RwLock<HashMap<ApprovalToken, ApprovalRequest>>,
    updates: watch::Sender<u64>,
}

impl ApprovalLedger {
    pub fn new() -> Self {
        let (updates, _rx) = watch::channel(0);
        Self {
            requests: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Raise an approval request for a job instance.
    pub async fn request(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        environment: &str,
    ) -> ApprovalToken {
        let request = ApprovalRequest::new(run_id, instance.id, &instance.display_name, environment);
        let token = request.token;
        self.requests.write().await.insert(token, request);

        info!(
            run_id = %run_id,
            job = %instance.display_name,
            environment = %environment,
            token = %token,
            "Approval requested"
        );
        self.updates.send_modify(|v| *v += 1);
        token
    }

    pub async fn approve(&self, token: ApprovalToken, actor: &str) -> Result<()> {
        self.resolve(token, actor, ApprovalStatus::Approved).await
    }

    pub async fn reject(&self, token: ApprovalToken, actor: &str) -> Result<()> {
        self.resolve(token, actor, ApprovalStatus::Rejected).await
    }

    async fn resolve(&self, token: ApprovalToken, actor: &str, status: ApprovalStatus) -> Result<()> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&token)
            .ok_or_else(|| Error::ApprovalNotFound(token.to_string()))?;

        if request.status.is_resolved() {
            return Err(Error::ApprovalAlreadyResolved(token.to_string()));
        }

        match status {
            ApprovalStatus::Rejected => request.reject(actor),
            _ => request.approve(actor),
        }
        info!(
            token = %token,
            job = %request.job_name,
            actor = %actor,
            status = ?request.status,
            "Approval resolved"
        );
        drop(requests);

        self.updates.send_modify(|v| *v += 1);
        Ok(())
    }

    pub async fn status(&self, token: ApprovalToken) -> Option<ApprovalStatus> {
        self.requests.read().await.get(&token).map(|r| r.status)
    }

    /// Unresolved requests, oldest first.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_resolved())
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.requested_at, r.token));
        pending
    }

    /// Subscribe to ledger changes (new requests and resolutions).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    /// Suspend until the request is resolved or the run is cancelled.
    pub async fn wait(&self, token: ApprovalToken, cancel: &CancelSignal) -> Result<ApprovalStatus> {
        loop {
            // Subscribe before checking so a resolution in between still wakes us
            let mut updates = self.updates.subscribe();
            match self.status(token).await {
                None => return Err(Error::ApprovalNotFound(token.to_string())),
                Some(status) if status.is_resolved() => return Ok(status),
                Some(_) => {}
            }

            tokio::select! {
                _ = updates.changed() => {}
                reason = cancel.cancelled() => {
                    return Err(Error::RunCancelled { reason });
                }
            }
        }
    }
}

impl Default for ApprovalLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Authorizes job instances of one run against their environments.
pub struct EnvironmentGate {
    run_id: RunId,
    ledger: Arc<ApprovalLedger>,
    live: Arc<AtomicBool>,
}

impl EnvironmentGate {
    /// `live` is the run's liveness flag, shared by every handle this gate
    /// grants.
    pub fn new(run_id: RunId, ledger: Arc<ApprovalLedger>, live: Arc<AtomicBool>) -> Self {
        Self {
            run_id,
            ledger,
            live,
        }
    }

    pub fn ledger(&self) -> &Arc<ApprovalLedger> {
        &self.ledger
    }

    /// Check the branch condition first, then the environment's approval
    /// requirement. A failed branch check denies regardless of approval.
    pub async fn authorize(
        &self,
        instance: &JobInstance,
        condition: &BranchCondition,
        environment: Option<&EnvironmentDefinition>,
        context: &RunContext,
    ) -> GateResult {
        if !condition.evaluate(&context.branch) {
            let reason = format!("branch '{}' does not satisfy {}", context.branch, condition);
            info!(
                run_id = %self.run_id,
                job = %instance.display_name,
                branch = %context.branch,
                "Gate denied"
            );
            return GateResult::Denied(reason);
        }

        match environment {
            Some(env) if env.require_approval => {
                let token = self.ledger.request(self.run_id, instance, &env.name).await;
                GateResult::Pending(token)
            }
            Some(env) => {
                debug!(job = %instance.display_name, environment = %env.name, "Gate granted");
                GateResult::Granted(self.grant(env))
            }
            None => GateResult::Granted(ScopeHandle::new(
                self.run_id,
                SecretScope::empty(""),
                self.live.clone(),
            )),
        }
    }

    /// Wait on a pending approval and turn its resolution into a gate result.
    pub async fn await_approval(
        &self,
        token: ApprovalToken,
        environment: &EnvironmentDefinition,
        cancel: &CancelSignal,
    ) -> Result<GateResult> {
        match self.ledger.wait(token, cancel).await? {
            ApprovalStatus::Approved => Ok(GateResult::Granted(self.grant(environment))),
            _ => Ok(GateResult::Denied(format!(
                "approval for environment '{}' was rejected",
                environment.name
            ))),
        }
    }

    fn grant(&self, environment: &EnvironmentDefinition) -> ScopeHandle {
        ScopeHandle::new(
            self.run_id,
            SecretScope {
                environment: environment.name.clone(),
                refs: environment.secrets.clone(),
            },
            self.live.clone(),
        )
    }
}
