//! Command handlers.

use crate::commands::EventArgs;
use crate::config::CliConfig;
use anyhow::Context;
use console::style;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tollgate_core::environment::ApprovalRequest;
use tollgate_core::ports::Registry;
use tollgate_core::run::{JobState, PublishResult, RunOutcome, RunReport, TriggerEvent};
use tollgate_core::workflow::{EventKind, Workflow, WorkflowDefinition};
use tollgate_registry::{DirectoryRegistry, HttpRegistry};
use tollgate_runner::{RunnerConfig, ShellRunner};
use tollgate_scheduler::{
    ActivationDecision, ApprovalLedger, Engine, EngineConfig, JobGraph, SuppressReason,
    TriggerEvaluator,
};
use tollgate_secrets::{EnvProvider, FileProvider, SecretManager};
use tracing::warn;

/// Options of `tollgate run`, after merging flags with the config file.
pub struct RunOptions {
    pub approve: bool,
    pub registry_dir: Option<PathBuf>,
    pub registry_url: Option<String>,
    pub secrets_file: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub workspace: Option<PathBuf>,
    pub json: bool,
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    Workflow::from_yaml(&content).with_context(|| format!("invalid workflow {}", path.display()))
}

/// The typed event for the flags; an unknown kind is ignored, not an error.
fn trigger_event(args: &EventArgs) -> Result<TriggerEvent, SuppressReason> {
    let Ok(kind) = args.event.parse::<EventKind>() else {
        warn!(kind = %args.event, "Ignoring event of unknown kind");
        return Err(SuppressReason::UnknownKind(args.event.clone()));
    };
    Ok(TriggerEvent {
        kind,
        branch: args.branch.clone(),
        target_branch: args.target.clone(),
        actor: args.actor.clone(),
    })
}

/// Validate a workflow document.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let graph = JobGraph::build(workflow.templates())?;

    println!(
        "{} Workflow \"{}\" is valid",
        style("✓").green(),
        workflow.name()
    );
    println!(
        "  Jobs: {} templates, {} instances",
        workflow.templates().len(),
        graph.len()
    );

    for template in workflow.templates() {
        let count = graph.instances_of(&template.name).len();
        let mut line = format!("    - {} ({} instances", template.name, count);
        if let Some(env) = &template.environment {
            line.push_str(&format!(", environment {}", env));
        }
        line.push(')');
        if !template.needs.is_empty() {
            line.push_str(&format!(" needs {}", template.needs.join(", ")));
        }
        println!("{}", line);
    }

    if let Some(release) = workflow.release() {
        println!(
            "  Release: {} from job {} on branch {}",
            style(&release.artifact.name).bold(),
            release.job,
            release.branch
        );
    }

    Ok(())
}

/// Show the activation decision and the ordered job instances for an event.
pub fn plan(path: &Path, args: &EventArgs) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let decision = TriggerEvaluator::new().evaluate_raw(
        &workflow,
        &args.event,
        &args.branch,
        args.target.as_deref(),
        &args.actor,
    );

    let context = match decision {
        ActivationDecision::Activate(context) => context,
        ActivationDecision::Suppress(reason) => {
            println!("{} Suppressed: {}", style("-").dim(), reason);
            return Ok(());
        }
    };

    println!(
        "{} Activated by {} on {}",
        style("▶").cyan(),
        context.kind,
        style(&context.branch).bold()
    );

    let graph = JobGraph::build(workflow.templates())?;
    let stages = stages(&workflow);

    for node in graph.instances() {
        let instance = &node.instance;
        let stage = stages.get(instance.template.as_str()).copied().unwrap_or(0);
        let mut notes = Vec::new();
        if let Some(condition) = workflow.branch_condition(&instance.template)
            && !condition.evaluate(&context.branch)
        {
            notes.push("skipped by branch".to_string());
        }
        if let Some(env) = workflow
            .template(&instance.template)
            .and_then(|t| t.environment.as_deref())
            .and_then(|name| workflow.environment(name))
        {
            notes.push(if env.require_approval {
                format!("environment {} (approval)", env.name)
            } else {
                format!("environment {}", env.name)
            });
        }
        if workflow.is_release_job(&instance.template) {
            notes.push("publishes".to_string());
        }
        if node.state == JobState::Failed {
            notes.push(node.reason.clone().unwrap_or_else(|| "fails".to_string()));
        }

        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!("  [{}]", notes.join("; "))
        };
        println!(
            "  {} {}{}",
            style(format!("{}.", stage + 1)).dim(),
            instance.display_name,
            style(notes).dim()
        );
    }

    Ok(())
}

/// Depth of each template in the needs relation, starting at zero.
fn stages(workflow: &Workflow) -> HashMap<&str, usize> {
    fn depth<'a>(
        workflow: &'a Workflow,
        name: &'a str,
        memo: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(&d) = memo.get(name) {
            return d;
        }
        let d = workflow
            .template(name)
            .map(|t| {
                t.needs
                    .iter()
                    .map(|n| depth(workflow, n, memo) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(name, d);
        d
    }

    let mut memo = HashMap::new();
    for template in workflow.templates() {
        depth(workflow, &template.name, &mut memo);
    }
    memo
}

/// Run a workflow for an event.
pub async fn run(
    config: &CliConfig,
    path: &Path,
    args: &EventArgs,
    options: RunOptions,
) -> anyhow::Result<ExitCode> {
    let workflow = Arc::new(load_workflow(path)?);
    let event = match trigger_event(args) {
        Ok(event) => event,
        Err(reason) => {
            println!("{} Suppressed: {}", style("-").dim(), reason);
            return Ok(ExitCode::SUCCESS);
        }
    };
    let workspace = options.workspace.unwrap_or_else(|| PathBuf::from("."));

    let mut secrets = SecretManager::new();
    secrets.register_provider("env", Arc::new(EnvProvider::new(config.env_prefix.clone())));
    if let Some(file) = &options.secrets_file {
        let provider = FileProvider::load_from_file(file)
            .await
            .with_context(|| format!("loading secrets from {}", file.display()))?;
        secrets.register_provider("file", Arc::new(provider));
    }

    let registry: Arc<dyn Registry> = match (&options.registry_url, &options.registry_dir) {
        (Some(url), _) => Arc::new(HttpRegistry::new(url)?),
        (None, Some(dir)) => Arc::new(DirectoryRegistry::new(dir)),
        (None, None) => Arc::new(DirectoryRegistry::new(workspace.join(".tollgate/registry"))),
    };

    let engine_config = EngineConfig {
        max_parallel: options
            .max_parallel
            .unwrap_or_else(|| EngineConfig::default().max_parallel),
        workspace: workspace.clone(),
        default_step_timeout_secs: config.step_timeout_secs,
    };
    let engine = Engine::new(
        Arc::new(ShellRunner::new(RunnerConfig::default())),
        Arc::new(secrets),
        registry,
        engine_config,
    );

    let Some(handle) = engine.start(workflow.clone(), &event)? else {
        println!(
            "{} Event suppressed for workflow {}, nothing to run",
            style("-").dim(),
            workflow.name()
        );
        return Ok(ExitCode::SUCCESS);
    };

    if !options.json {
        println!(
            "{} Run {} of {} on {}",
            style("▶").cyan(),
            handle.run_id(),
            style(workflow.name()).bold(),
            style(&event.branch).dim()
        );
    }

    let approver = tokio::spawn(resolve_approvals(
        handle.ledger(),
        options.approve,
        args.actor.clone(),
    ));
    let interrupt = handle.cancel_signal();
    let interrupt_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel("interrupted by operator");
        }
    });

    let report = handle.wait().await?;
    approver.abort();
    interrupt_task.abort();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Resolve every approval the run requests, either automatically or by
/// prompting on the terminal.
async fn resolve_approvals(ledger: Arc<ApprovalLedger>, auto_approve: bool, actor: String) {
    let mut updates = ledger.subscribe();
    loop {
        for request in ledger.pending().await {
            let approved = auto_approve || prompt_approval(&request).await;
            let result = if approved {
                ledger.approve(request.token, &actor).await
            } else {
                ledger.reject(request.token, &actor).await
            };
            if let Err(e) = result {
                warn!(token = %request.token, error = %e, "Could not resolve approval");
            }
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}

async fn prompt_approval(request: &ApprovalRequest) -> bool {
    let prompt = format!(
        "Approve job {} for environment {}?",
        request.job_name, request.environment
    );
    let answer = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
    })
    .await;

    match answer {
        Ok(Ok(approved)) => approved,
        Ok(Err(e)) => {
            warn!(error = %e, "Approval prompt failed, rejecting");
            false
        }
        Err(e) => {
            warn!(error = %e, "Approval prompt aborted, rejecting");
            false
        }
    }
}

fn print_report(report: &RunReport) {
    for job in &report.jobs {
        let marker = match job.state {
            JobState::Succeeded => style("✓").green(),
            JobState::Failed => style("✗").red(),
            JobState::Cancelled => style("✗").yellow(),
            JobState::Skipped => style("-").dim(),
            JobState::Pending | JobState::Running => style("?").dim(),
        };
        match &job.reason {
            Some(reason) => println!(
                "  {} {} {}",
                marker,
                job.display_name,
                style(format!("({}: {})", job.state, reason)).dim()
            ),
            None => println!("  {} {}", marker, job.display_name),
        }
    }

    match &report.publish {
        Some(PublishResult::Published { artifact, version }) => {
            println!("{} Published {} {}", style("✓").green(), artifact, version)
        }
        Some(PublishResult::Duplicate { artifact, version }) => {
            println!("{} {} {} was already published", style("!").yellow(), artifact, version)
        }
        Some(PublishResult::Failed {
            artifact,
            version,
            kind,
            message,
        }) => println!(
            "{} Publishing {} {} failed ({:?}): {}",
            style("✗").red(),
            artifact,
            version,
            kind,
            message
        ),
        None => {}
    }

    match report.outcome {
        RunOutcome::Success => println!("{} Run succeeded", style("✓").green()),
        RunOutcome::Failure if report.retryable => println!(
            "{} Run failed on a transient publish error; retrying the run may succeed",
            style("✗").red()
        ),
        RunOutcome::Failure => println!("{} Run failed", style("✗").red()),
        RunOutcome::Cancelled => println!("{} Run cancelled", style("!").yellow()),
    }
}

/// Stamp a base version.
pub fn stamp(base: &str, at: Option<&str>) -> anyhow::Result<()> {
    let now = match at {
        Some(at) => chrono::DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid timestamp: {}", at))?
            .with_timezone(&chrono::Utc),
        None => chrono::Utc::now(),
    };
    println!("{}", tollgate_scheduler::stamp(base, now)?);
    Ok(())
}

/// Print the workflow document schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    let unset = "(not set)".to_string();
    let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

    println!("Current configuration:");
    println!("  registry_url: {}", config.registry_url.as_ref().unwrap_or(&unset));
    println!("  registry_dir: {}", path(&config.registry_dir).unwrap_or_else(|| unset.clone()));
    println!("  secrets_file: {}", path(&config.secrets_file).unwrap_or_else(|| unset.clone()));
    println!("  env_prefix: {}", config.env_prefix.as_ref().unwrap_or(&unset));
    println!(
        "  max_parallel: {}",
        config
            .max_parallel
            .map(|n| n.to_string())
            .unwrap_or_else(|| unset.clone())
    );
    println!(
        "  step_timeout_secs: {}",
        config
            .step_timeout_secs
            .map(|n| n.to_string())
            .unwrap_or_else(|| unset.clone())
    );
    println!("  output_format: {:?}", config.output_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: demo
jobs:
  - name: lint
    steps: [{ name: lint, run: "true" }]
  - name: test
    needs: [lint]
    steps: [{ name: test, run: "true" }]
  - name: package
    needs: [test, lint]
    steps: [{ name: build, run: "true" }]
"#;

    #[test]
    fn test_stages_follow_needs_depth() {
        let workflow = Workflow::from_yaml(WORKFLOW).unwrap();
        let stages = stages(&workflow);
        assert_eq!(stages["lint"], 0);
        assert_eq!(stages["test"], 1);
        assert_eq!(stages["package"], 2);
    }

    #[test]
    fn test_trigger_event_rejects_unknown_kind() {
        let args = EventArgs {
            event: "tag".to_string(),
            branch: "main".to_string(),
            target: None,
            actor: "me".to_string(),
        };
        assert!(matches!(
            trigger_event(&args),
            Err(SuppressReason::UnknownKind(kind)) if kind == "tag"
        ));
    }

    #[tokio::test]
    async fn test_run_ignores_unknown_event_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.yaml");
        std::fs::write(&path, WORKFLOW).unwrap();

        let args = EventArgs {
            event: "tag".to_string(),
            branch: "main".to_string(),
            target: None,
            actor: "me".to_string(),
        };
        let options = RunOptions {
            approve: true,
            registry_dir: Some(dir.path().join("registry")),
            registry_url: None,
            secrets_file: None,
            max_parallel: Some(1),
            workspace: Some(dir.path().to_path_buf()),
            json: false,
        };

        let code = run(&CliConfig::default(), &path, &args, options).await.unwrap();
        assert_eq!(format!("{:?}", code), format!("{:?}", ExitCode::SUCCESS));
        assert!(!dir.path().join("registry").exists());
    }

    #[test]
    fn test_stamp_with_fixed_time() {
        assert!(stamp("3.6", Some("2024-05-01T08:30:00Z")).is_ok());
        assert!(stamp("3", Some("2024-05-01T08:30:00Z")).is_err());
        assert!(stamp("3.6", Some("yesterday")).is_err());
    }

    #[tokio::test]
    async fn test_run_exit_code_reflects_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.yaml");
        std::fs::write(
            &path,
            r#"
name: failing
jobs:
  - name: check
    steps: [{ name: check, run: "exit 1" }]
"#,
        )
        .unwrap();

        let args = EventArgs {
            event: "push".to_string(),
            branch: "main".to_string(),
            target: None,
            actor: "me".to_string(),
        };
        let options = RunOptions {
            approve: true,
            registry_dir: Some(dir.path().join("registry")),
            registry_url: None,
            secrets_file: None,
            max_parallel: Some(1),
            workspace: Some(dir.path().to_path_buf()),
            json: true,
        };

        let code = run(&CliConfig::default(), &path, &args, options).await.unwrap();
        assert_eq!(format!("{:?}", code), format!("{:?}", ExitCode::FAILURE));
    }

    #[test]
    fn test_unreadable_workflow() {
        let err = load_workflow(Path::new("/nonexistent/tollgate.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading workflow"));
    }
}
