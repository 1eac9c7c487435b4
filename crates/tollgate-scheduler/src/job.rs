//! Execution of one job instance's steps.

use crate::cancel::CancelSignal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tollgate_core::ids::RunId;
use tollgate_core::interpolation::InterpolationContext;
use tollgate_core::ports::{StepContext, StepExecutor, StepOutput};
use tollgate_core::run::{JobInstance, JobOutcome};
use tollgate_core::workflow::{JobTemplate, StepDefinition};
use tollgate_core::{Error, Result};
use tracing::{debug, info, warn};

/// Everything a job instance needs besides the executor.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub run_id: RunId,
    pub instance: JobInstance,
    pub template: JobTemplate,
    /// Workflow variables; job variables take precedence.
    pub variables: HashMap<String, String>,
    pub branch: String,
    /// Stamped release version, for the release job.
    pub version: Option<String>,
}

impl JobExecution {
    fn interpolation(&self) -> InterpolationContext {
        let mut variables = self.variables.clone();
        variables.extend(self.template.variables.clone());
        InterpolationContext {
            variables,
            matrix: self.instance.matrix_values(),
            branch: Some(self.branch.clone()),
            version: self.version.clone(),
        }
    }
}

/// Runs a job instance's steps in order through a [`StepExecutor`].
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<dyn StepExecutor>,
    workspace: PathBuf,
    default_timeout: Option<Duration>,
}

/// Why a single step attempt failed.
enum StepFailure {
    /// Worth another attempt if any remain.
    Retryable(String),
    /// Quality gate verdicts are deterministic and never retried.
    Final(String),
}

impl JobRunner {
    pub fn new(executor: Arc<dyn StepExecutor>, workspace: PathBuf) -> Self {
        Self {
            executor,
            workspace,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Run every step; the first step that fails after its retries fails the
    /// job. Cancellation aborts the step in flight.
    pub async fn run(&self, job: &JobExecution, cancel: &CancelSignal) -> JobOutcome {
        let interpolation = job.interpolation();
        let total = job.template.steps.len();

        for (idx, step) in job.template.steps.iter().enumerate() {
            if let Some(reason) = cancel.reason() {
                return JobOutcome::Cancelled(reason);
            }

            debug!(
                job = %job.instance.display_name,
                step = %step.name,
                "Step {}/{}",
                idx + 1,
                total
            );

            let ctx = self.step_context(job, step, &interpolation);
            let attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
            let delay = step
                .retry
                .as_ref()
                .map_or(Duration::ZERO, |r| Duration::from_secs(r.delay_seconds.into()));

            let mut attempt = 1;
            loop {
                let result = tokio::select! {
                    result = self.attempt(&ctx) => result,
                    reason = cancel.cancelled() => return JobOutcome::Cancelled(reason),
                };

                match result {
                    Ok(()) => break,
                    Err(StepFailure::Retryable(message)) if attempt < attempts => {
                        warn!(
                            job = %job.instance.display_name,
                            step = %step.name,
                            attempt,
                            max_attempts = attempts,
                            error = %message,
                            "Step failed, retrying"
                        );
                        attempt += 1;
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = sleep(delay) => {}
                                reason = cancel.cancelled() => return JobOutcome::Cancelled(reason),
                            }
                        }
                    }
                    Err(StepFailure::Retryable(message)) | Err(StepFailure::Final(message)) => {
                        warn!(
                            job = %job.instance.display_name,
                            step = %step.name,
                            error = %message,
                            "Step failed"
                        );
                        return JobOutcome::Failed(format!("step '{}': {}", step.name, message));
                    }
                }
            }
        }

        info!(job = %job.instance.display_name, steps = total, "Job succeeded");
        JobOutcome::Succeeded
    }

    fn step_context(
        &self,
        job: &JobExecution,
        step: &StepDefinition,
        interpolation: &InterpolationContext,
    ) -> StepContext {
        let mut env: HashMap<String, String> = step
            .env
            .iter()
            .map(|(k, v)| (k.clone(), interpolation.interpolate(v)))
            .collect();
        if let Some(version) = &job.version {
            env.entry("TOLLGATE_VERSION".to_string())
                .or_insert_with(|| version.clone());
        }

        let workspace = match &step.working_directory {
            Some(dir) => self.workspace.join(interpolation.interpolate(dir)),
            None => self.workspace.clone(),
        };

        StepContext {
            run_id: job.run_id,
            job_id: job.instance.id,
            job_name: job.instance.display_name.clone(),
            workspace,
            command: interpolation.interpolate(&step.run),
            env,
            step: step.clone(),
        }
    }

    async fn attempt(&self, ctx: &StepContext) -> std::result::Result<(), StepFailure> {
        let output = self
            .execute_with_timeout(ctx)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;

        if !output.success() {
            return Err(StepFailure::Retryable(format!(
                "exited with code {}",
                output.exit_code
            )));
        }

        if let Some(gate) = &ctx.step.coverage {
            let err = match output.coverage {
                None => Some(Error::CoverageMissing),
                Some(actual) if !gate.passes(actual) => Some(Error::CoverageBelowThreshold {
                    actual,
                    minimum: gate.minimum,
                }),
                Some(_) => None,
            };
            if let Some(err) = err {
                return Err(StepFailure::Final(err.to_string()));
            }
        }

        Ok(())
    }

    async fn execute_with_timeout(&self, ctx: &StepContext) -> Result<StepOutput> {
        let limit = ctx
            .step
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
            .or(self.default_timeout);

        match limit {
            Some(limit) => timeout(limit, self.executor.execute(ctx))
                .await
                .map_err(|_| Error::StepTimeout { after: limit })?,
            None => self.executor.execute(ctx).await,
        }
    }
}
