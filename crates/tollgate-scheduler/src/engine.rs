//! Run engine: drives one activation of a workflow to completion.

use crate::cancel::CancelSignal;
use crate::dag::{GraphError, JobGraph};
use crate::gate::{ApprovalLedger, EnvironmentGate, GateResult};
use crate::job::{JobExecution, JobRunner};
use crate::publisher::Publisher;
use crate::triggers::{ActivationDecision, TriggerEvaluator};
use crate::version::{Clock, SystemClock, VersionFile, VersionStamp, stamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tollgate_core::environment::ApprovalRequest;
use tollgate_core::ids::{ApprovalToken, JobId, RunId};
use tollgate_core::ports::{Artifact, Registry, SecretResolver, StepExecutor};
use tollgate_core::run::{
    JobInstance, JobOutcome, JobState, PublishFailureKind, PublishResult, RunContext, RunOutcome,
    RunReport, TriggerEvent,
};
use tollgate_core::workflow::{ReleaseConfig, Workflow};
use tollgate_core::{BranchCondition, Error, Result};
use tracing::{debug, error, info, warn};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on job instances running steps at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Directory steps run in; relative artifact and version file paths
    /// resolve against it.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Step timeout when a step sets none.
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            workspace: default_workspace(),
            default_step_timeout_secs: None,
        }
    }
}

/// Runs activated workflows against the configured collaborators.
pub struct Engine {
    runner: JobRunner,
    resolver: Arc<dyn SecretResolver>,
    registry: Arc<dyn Registry>,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    evaluator: TriggerEvaluator,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        resolver: Arc<dyn SecretResolver>,
        registry: Arc<dyn Registry>,
        config: EngineConfig,
    ) -> Self {
        let mut runner = JobRunner::new(executor, config.workspace.clone());
        if let Some(secs) = config.default_step_timeout_secs {
            runner = runner.with_default_timeout(Duration::from_secs(secs));
        }
        Self {
            runner,
            resolver,
            registry,
            clock: Arc::new(SystemClock),
            workers: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            evaluator: TriggerEvaluator::new(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate the event and, if it activates the workflow, start a run.
    ///
    /// Returns `Ok(None)` when the event is suppressed and `Err` when the
    /// job graph is structurally invalid; in both cases nothing executes.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        workflow: Arc<Workflow>,
        event: &TriggerEvent,
    ) -> std::result::Result<Option<RunHandle>, GraphError> {
        let context = match self.evaluator.evaluate(&workflow, event) {
            ActivationDecision::Activate(context) => context,
            ActivationDecision::Suppress(_) => return Ok(None),
        };

        let graph = JobGraph::build(workflow.templates())?;
        let run_id = RunId::new();
        let ledger = Arc::new(ApprovalLedger::new());
        let live = Arc::new(AtomicBool::new(true));
        let cancel = CancelSignal::new();

        info!(
            run_id = %run_id,
            workflow = %workflow.name(),
            branch = %context.branch,
            jobs = graph.len(),
            "Run started"
        );

        let shared = Arc::new(RunShared {
            run_id,
            gate: EnvironmentGate::new(run_id, ledger.clone(), live.clone()),
            publisher: Publisher::new(self.registry.clone(), self.resolver.clone()),
            runner: self.runner.clone(),
            clock: self.clock.clone(),
            workers: self.workers.clone(),
            workspace: self.config.workspace.clone(),
            release_version: OnceCell::new(),
            cancel: cancel.clone(),
            workflow,
            context,
        });

        let coordinator = RunCoordinator {
            shared,
            graph,
            live,
            started_at: self.clock.now(),
        };
        let task = tokio::spawn(coordinator.drive());

        Ok(Some(RunHandle {
            run_id,
            ledger,
            cancel,
            task,
        }))
    }
}

/// Control surface of a running run.
pub struct RunHandle {
    run_id: RunId,
    ledger: Arc<ApprovalLedger>,
    cancel: CancelSignal,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub async fn approve(&self, token: ApprovalToken, actor: &str) -> Result<()> {
        self.ledger.approve(token, actor).await
    }

    pub async fn reject(&self, token: ApprovalToken, actor: &str) -> Result<()> {
        self.ledger.reject(token, actor).await
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.ledger.pending().await
    }

    /// Notified whenever an approval is requested or resolved.
    pub fn approval_updates(&self) -> watch::Receiver<u64> {
        self.ledger.subscribe()
    }

    /// The run's approval ledger, for resolving approvals while the run is
    /// awaited.
    pub fn ledger(&self) -> Arc<ApprovalLedger> {
        self.ledger.clone()
    }

    /// A signal that cancels this run, usable after the handle is consumed
    /// by [`RunHandle::wait`].
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Cancel every non-terminal job instance and abort steps in flight.
    pub fn cancel(&self, reason: &str) {
        if self.cancel.cancel(reason) {
            info!(run_id = %self.run_id, reason = %reason, "Run cancellation requested");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("cancel", &self.cancel)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// State shared by the coordinator and every job task of one run.
struct RunShared {
    run_id: RunId,
    workflow: Arc<Workflow>,
    context: RunContext,
    gate: EnvironmentGate,
    publisher: Publisher,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    workspace: PathBuf,
    /// Stamped once per run, on first use by a release job instance.
    release_version: OnceCell<std::result::Result<VersionStamp, String>>,
    cancel: CancelSignal,
}

struct JobTaskResult {
    outcome: JobOutcome,
    publish: Option<PublishResult>,
}

impl From<JobOutcome> for JobTaskResult {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            publish: None,
        }
    }
}

/// Owns the job graph; the only place graph state changes.
struct RunCoordinator {
    shared: Arc<RunShared>,
    graph: JobGraph,
    live: Arc<AtomicBool>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl RunCoordinator {
    async fn drive(mut self) -> RunReport {
        let shared = self.shared.clone();
        let mut tasks: JoinSet<(JobId, JobTaskResult)> = JoinSet::new();
        let mut publish: Option<PublishResult> = None;
        let mut cancel_seen = false;

        loop {
            if !cancel_seen {
                let ready: Vec<JobInstance> = self.graph.ready().into_iter().cloned().collect();
                for instance in ready {
                    if let Err(e) = self.graph.start(instance.id) {
                        warn!(job = %instance.display_name, error = %e, "Could not start job");
                        continue;
                    }
                    debug!(run_id = %shared.run_id, job = %instance.display_name, "Job ready");
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        let id = instance.id;
                        (id, run_job(shared, instance).await)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                reason = shared.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    self.cancel_all(&reason);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((id, result))) => {
                        // A job that observed the signal may finish before the
                        // cancel branch is polled; cancel the rest first
                        if !cancel_seen && let Some(reason) = shared.cancel.reason() {
                            cancel_seen = true;
                            self.cancel_all(&reason);
                        }
                        if let Some(attempt) = result.publish
                            && (publish.is_none() || !matches!(attempt, PublishResult::Duplicate { .. }))
                        {
                            publish = Some(attempt);
                        }
                        match self.graph.advance(id, result.outcome) {
                            Ok(skipped) if !skipped.is_empty() => {
                                info!(run_id = %shared.run_id, count = skipped.len(), "Dependents skipped");
                            }
                            Ok(_) => {}
                            // Instances already cancelled by the run
                            Err(e) => debug!(run_id = %shared.run_id, error = %e, "Late job outcome ignored"),
                        }
                    }
                    Some(Err(e)) => {
                        error!(run_id = %shared.run_id, error = %e, "Job task aborted");
                    }
                    None => {}
                },
            }
        }

        // A task that panicked leaves its instance running
        if !self.graph.is_complete() {
            let reason = shared
                .cancel
                .reason()
                .unwrap_or_else(|| "job task aborted".to_string());
            self.graph.cancel_all(&reason);
        }

        // Scope handles must not outlive the run
        self.live.store(false, Ordering::Release);

        self.report(publish)
    }

    fn cancel_all(&mut self, reason: &str) {
        let cancelled = self.graph.cancel_all(reason);
        info!(
            run_id = %self.shared.run_id,
            reason = %reason,
            cancelled = cancelled.len(),
            "Run cancelled"
        );
    }

    fn report(&self, publish: Option<PublishResult>) -> RunReport {
        let shared = &self.shared;
        let jobs = self.graph.report();
        let release_job = shared.workflow.release().map(|r| r.job.as_str());

        let failed: Vec<_> = jobs
            .iter()
            .filter(|j| matches!(j.state, JobState::Failed | JobState::Cancelled))
            .collect();
        let publish_failed = matches!(publish, Some(PublishResult::Failed { .. }));

        let outcome = if shared.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else if !failed.is_empty() || publish_failed {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        };

        let retryable = outcome == RunOutcome::Failure
            && matches!(
                publish,
                Some(PublishResult::Failed {
                    kind: PublishFailureKind::Transient,
                    ..
                })
            )
            && failed.iter().all(|j| Some(j.template.as_str()) == release_job);

        let report = RunReport {
            run_id: shared.run_id,
            workflow: shared.workflow.name().to_string(),
            context: shared.context.clone(),
            jobs,
            publish,
            outcome,
            retryable,
            started_at: self.started_at,
            completed_at: shared.clock.now(),
        };

        info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            succeeded = report.count(JobState::Succeeded),
            failed = report.count(JobState::Failed),
            skipped = report.count(JobState::Skipped),
            "Run finished"
        );
        report
    }
}

/// Gate, execute and (for the release job) publish one job instance.
async fn run_job(shared: Arc<RunShared>, instance: JobInstance) -> JobTaskResult {
    let workflow = shared.workflow.clone();
    let Some(template) = workflow.template(&instance.template) else {
        return JobOutcome::Failed(format!("unknown job template '{}'", instance.template)).into();
    };

    let condition = workflow
        .branch_condition(&template.name)
        .unwrap_or(BranchCondition::Always);
    let environment = template
        .environment
        .as_deref()
        .and_then(|name| workflow.environment(name));

    let mut decision = shared
        .gate
        .authorize(&instance, &condition, environment, &shared.context)
        .await;
    if let GateResult::Pending(token) = decision {
        let Some(env) = environment else {
            return JobOutcome::Failed("approval requested without an environment".to_string())
                .into();
        };
        decision = match shared.gate.await_approval(token, env, &shared.cancel).await {
            Ok(decision) => decision,
            Err(Error::RunCancelled { reason }) => return JobOutcome::Cancelled(reason).into(),
            Err(e) => return JobOutcome::Failed(e.to_string()).into(),
        };
    }

    let scope = match decision {
        GateResult::Granted(scope) => scope,
        GateResult::Denied(reason) => {
            info!(job = %instance.display_name, reason = %reason, "Job skipped by gate");
            return JobOutcome::Skipped(reason).into();
        }
        GateResult::Pending(token) => {
            return JobOutcome::Failed(format!("approval {} unresolved", token)).into();
        }
    };

    // Gate waits happen before a worker is taken
    let _permit = tokio::select! {
        permit = shared.workers.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return JobOutcome::Failed("worker pool closed".to_string()).into(),
        },
        reason = shared.cancel.cancelled() => return JobOutcome::Cancelled(reason).into(),
    };

    let release = workflow
        .release()
        .filter(|r| r.job == template.name);

    let version = match release {
        Some(release) => {
            let stamped = shared
                .release_version
                .get_or_init(|| async { prepare_release(&shared, release) })
                .await;
            match stamped {
                Ok(version) => Some(version.clone()),
                Err(e) => return JobOutcome::Failed(e.clone()).into(),
            }
        }
        None => None,
    };

    let execution = JobExecution {
        run_id: shared.run_id,
        instance: instance.clone(),
        template: template.clone(),
        variables: workflow.variables().clone(),
        branch: shared.context.branch.clone(),
        version: version.as_ref().map(VersionStamp::to_string),
    };
    let outcome = shared.runner.run(&execution, &shared.cancel).await;

    if outcome != JobOutcome::Succeeded {
        return outcome.into();
    }
    let (Some(release), Some(version)) = (release, version) else {
        return outcome.into();
    };

    let artifact = Artifact {
        name: release.artifact.name.clone(),
        path: shared.workspace.join(&release.artifact.path),
    };
    let result = shared
        .publisher
        .publish(&artifact, &version, &scope, &release.credential)
        .await;

    let outcome = match &result {
        PublishResult::Published { .. } | PublishResult::Duplicate { .. } => JobOutcome::Succeeded,
        PublishResult::Failed { kind, message, .. } => {
            let kind = match kind {
                PublishFailureKind::Transient => "transient",
                PublishFailureKind::Fatal => "fatal",
            };
            JobOutcome::Failed(format!("publish failed ({}): {}", kind, message))
        }
    };

    JobTaskResult {
        outcome,
        publish: Some(result),
    }
}

/// Stamp the release version and write it to the version file, if any.
fn prepare_release(
    shared: &RunShared,
    release: &ReleaseConfig,
) -> std::result::Result<VersionStamp, String> {
    let version_file = release
        .version_file
        .as_ref()
        .map(|path| VersionFile::new(shared.workspace.join(path)));

    let base = match (&release.base_version, &version_file) {
        (Some(base), _) => base.clone(),
        (None, Some(file)) => file.read().map_err(|e| e.to_string())?,
        (None, None) => return Err("release has no version source".to_string()),
    };

    let version = stamp(&base, shared.clock.now()).map_err(|e| e.to_string())?;
    if let Some(file) = &version_file {
        file.write(&version).map_err(|e| e.to_string())?;
        debug!(path = %file.path().display(), version = %version, "Version file updated");
    }

    info!(run_id = %shared.run_id, version = %version, "Release version stamped");
    Ok(version)
}
