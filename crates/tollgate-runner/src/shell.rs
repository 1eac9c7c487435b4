//! Shell-based step execution on the host.

use crate::coverage::CoverageExtractor;
use crate::runner::{OutputLine, OutputStream, RunnerConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};
use tollgate_core::ports::{StepContext, StepExecutor, StepOutput};
use tollgate_core::{Error, Result};
use tracing::{debug, info, warn};

/// Shell runner for executing step commands on the host.
///
/// The child process is killed if the step future is dropped, which is how
/// run cancellation aborts a step in flight.
pub struct ShellRunner {
    config: RunnerConfig,
    output: Option<mpsc::Sender<OutputLine>>,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            output: None,
        }
    }

    /// Forward every output line to `tx` in addition to logging it.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output = Some(tx);
        self
    }

    fn extractor(&self, ctx: &StepContext) -> Result<Option<CoverageExtractor>> {
        let Some(gate) = &ctx.step.coverage else {
            return Ok(None);
        };
        let pattern = gate
            .pattern
            .as_deref()
            .unwrap_or(&self.config.coverage_pattern);
        CoverageExtractor::new(pattern).map(Some)
    }

    async fn run_command(&self, ctx: &StepContext) -> Result<StepOutput> {
        let start = Instant::now();
        let mut extractor = self.extractor(ctx)?;

        info!(
            job = %ctx.job_name,
            step = %ctx.step.name,
            command = %ctx.command,
            workspace = %ctx.workspace.display(),
            "Executing shell command"
        );

        let mut env_vars: HashMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env_vars.extend(ctx.env.clone());

        let mut command = Command::new(&ctx.step.shell);
        command
            .arg("-c")
            .arg(&ctx.command)
            .current_dir(&ctx.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.inherit_env {
            command.env_clear();
        }
        command.envs(&env_vars);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {}", e)))?;

        let (line_tx, mut line_rx) = mpsc::channel::<(OutputStream, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        // Drain output until both streams close
        let mut line_number = 0u32;
        let drain = async {
            while let Some((stream, content)) = line_rx.recv().await {
                line_number += 1;
                match stream {
                    OutputStream::Stdout => debug!(job = %ctx.job_name, "{}", content),
                    OutputStream::Stderr => debug!(job = %ctx.job_name, stream = "stderr", "{}", content),
                }
                if let Some(extractor) = extractor.as_mut() {
                    extractor.scan(&content);
                }
                if let Some(tx) = &self.output {
                    let line = OutputLine {
                        job: ctx.job_name.clone(),
                        step: ctx.step.name.clone(),
                        stream,
                        content,
                        line_number,
                        timestamp: chrono::Utc::now(),
                    };
                    let _ = tx.send(line).await;
                }
            }
        };

        let completed = async {
            drain.await;
            child.wait().await
        };

        let status = match self.config.timeout_seconds {
            Some(secs) => match timeout(Duration::from_secs(secs), completed).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(timeout_secs = secs, step = %ctx.step.name, "Command timed out, killing process");
                    return Err(Error::StepTimeout {
                        after: Duration::from_secs(secs),
                    });
                }
            },
            None => completed.await,
        }
        .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        let coverage = extractor.as_ref().and_then(CoverageExtractor::value);

        debug!(exit_code, duration_ms, coverage = ?coverage, "Command completed");

        Ok(StepOutput {
            exit_code,
            coverage,
            duration_ms,
        })
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepExecutor for ShellRunner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput> {
        self.run_command(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tollgate_core::ids::{JobId, RunId};
    use tollgate_core::workflow::{CoverageGate, StepDefinition};

    fn make_ctx(command: &str, workspace: &Path) -> StepContext {
        StepContext {
            run_id: RunId::new(),
            job_id: JobId::new(),
            job_name: "validate".to_string(),
            workspace: workspace.to_path_buf(),
            command: command.to_string(),
            env: HashMap::new(),
            step: StepDefinition {
                name: "test".to_string(),
                run: command.to_string(),
                shell: "sh".to_string(),
                working_directory: None,
                env: Default::default(),
                coverage: None,
                retry: None,
                timeout_minutes: None,
            },
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(100);
        let runner = ShellRunner::default().with_output(tx);

        let result = runner.execute(&make_ctx("echo hello", dir.path())).await.unwrap();
        assert!(result.success());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.coverage, None);

        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "hello");
        assert_eq!(line.stream, OutputStream::Stdout);
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellRunner::default()
            .execute(&make_ctx("exit 3", dir.path()))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_step_env_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = make_ctx("printf '%s' \"$PYVER\" > out.txt", dir.path());
        ctx.env.insert("PYVER".to_string(), "3.10".to_string());

        let result = ShellRunner::default().execute(&ctx).await.unwrap();
        assert!(result.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "3.10"
        );
    }

    #[tokio::test]
    async fn test_coverage_extracted_from_total_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = make_ctx(
            "echo 'Name    Stmts   Miss  Cover'; echo 'TOTAL    200      6    97%'",
            dir.path(),
        );
        ctx.step.coverage = Some(CoverageGate {
            minimum: 100.0,
            pattern: None,
        });

        let result = ShellRunner::default().execute(&ctx).await.unwrap();
        assert_eq!(result.coverage, Some(97.0));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            timeout_seconds: Some(1),
            ..RunnerConfig::default()
        });
        let err = runner
            .execute(&make_ctx("sleep 30", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepTimeout { .. }));
    }
}
