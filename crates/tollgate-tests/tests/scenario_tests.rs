//! End-to-end release scenarios against in-memory collaborators.

use pretty_assertions::assert_eq;
use regex::Regex;
use tokio_test::{assert_err, assert_ok};
use tollgate_core::run::{
    JobState, PublishFailureKind, PublishResult, RunOutcome, RunReport, TriggerEvent,
};
use tollgate_core::workflow::{Workflow, WorkflowError};
use tollgate_scheduler::GraphError;
use tollgate_tests::{
    Behavior, Harness, REGISTRY_TOKEN, RecordingRegistry, RegistryResponse, ScriptedExecutor,
    WorkflowFixture, init_test_logging, next_approval,
};

const VERSION: &str = "2.0.RC20240501083000";

async fn run(h: &Harness, event: TriggerEvent) -> RunReport {
    let handle = assert_ok!(h.engine.start(WorkflowFixture::yamlpath(), &event))
        .expect("event should activate the workflow");
    assert_ok!(handle.wait().await)
}

fn states(report: &RunReport, template: &str) -> Vec<JobState> {
    report.jobs_for(template).iter().map(|j| j.state).collect()
}

#[tokio::test]
async fn release_from_development_publishes_once() {
    init_test_logging();
    let h = Harness::new(ScriptedExecutor::new());

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(states(&report, "validate"), vec![JobState::Succeeded; 5]);
    assert_eq!(states(&report, "publish"), vec![JobState::Succeeded]);

    let pattern = Regex::new(r"^2\.0\.RC\d{14}$").unwrap();
    let version = report.publish.as_ref().unwrap().version().to_string();
    assert!(pattern.is_match(&version), "unexpected version {}", version);
    assert_eq!(version, VERSION);

    assert_eq!(
        h.registry.pushes(),
        vec![("yamlpath".to_string(), VERSION.to_string())]
    );
    assert_eq!(h.registry.credentials(), vec![REGISTRY_TOKEN.to_string()]);
    assert_eq!(h.executor.count(&format!("python -m build --version {}", VERSION)), 1);
}

#[tokio::test]
async fn pull_request_from_feature_branch_skips_publish() {
    let h = Harness::new(ScriptedExecutor::new());

    let report = run(
        &h,
        TriggerEvent::pull_request("feature/x", "development", "contributor"),
    )
    .await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(states(&report, "validate"), vec![JobState::Succeeded; 5]);
    assert_eq!(states(&report, "publish"), vec![JobState::Skipped]);
    assert!(report.publish.is_none());
    assert!(h.registry.pushes().is_empty());
    assert_eq!(h.executor.count("python -m build"), 0);
}

#[tokio::test]
async fn pull_request_to_other_target_is_suppressed() {
    let h = Harness::new(ScriptedExecutor::new());

    let handle = assert_ok!(h.engine.start(
        WorkflowFixture::yamlpath(),
        &TriggerEvent::pull_request("feature/x", "main", "contributor"),
    ));

    assert!(handle.is_none());
    assert!(h.executor.executed().is_empty());
}

#[tokio::test]
async fn one_cell_below_coverage_fails_alone() {
    let executor =
        ScriptedExecutor::new().on("pytest --cov=yamlpath --python 3.8", Behavior::Coverage(97.0));
    let h = Harness::new(executor);

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert!(!report.retryable);
    assert_eq!(
        states(&report, "validate"),
        vec![
            JobState::Succeeded,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Succeeded,
            JobState::Succeeded,
        ]
    );

    let failed = report.jobs_for("validate")[2];
    assert_eq!(failed.display_name, "validate (python-version=3.8)");
    assert!(failed.reason.as_deref().unwrap().contains("97.00%"));

    assert_eq!(states(&report, "publish"), vec![JobState::Skipped]);
    assert!(h.registry.pushes().is_empty());

    // Every cell ran its coverage step, once
    for python in ["3.6", "3.7", "3.8", "3.9", "3.10"] {
        assert_eq!(
            h.executor
                .count(&format!("pytest --cov=yamlpath --python {}", python)),
            1
        );
    }
}

#[tokio::test]
async fn approved_environment_publishes() {
    let h = Harness::new(ScriptedExecutor::new());
    let handle = assert_ok!(h.engine.start(
        WorkflowFixture::yamlpath_approved(),
        &TriggerEvent::push("development", "maintainer"),
    ))
    .unwrap();

    let request = next_approval(&handle).await;
    assert_eq!(request.environment, "pypi");
    assert_eq!(request.job_name, "publish");
    assert!(h.registry.pushes().is_empty());

    assert_ok!(handle.approve(request.token, "release-manager").await);
    assert_err!(handle.approve(request.token, "release-manager").await);

    let report = assert_ok!(handle.wait().await);
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.registry.pushes().len(), 1);
}

#[tokio::test]
async fn rejected_environment_skips_publish() {
    let h = Harness::new(ScriptedExecutor::new());
    let handle = assert_ok!(h.engine.start(
        WorkflowFixture::yamlpath_approved(),
        &TriggerEvent::push("development", "maintainer"),
    ))
    .unwrap();

    let request = next_approval(&handle).await;
    assert_ok!(handle.reject(request.token, "release-manager").await);

    let report = assert_ok!(handle.wait().await);
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(states(&report, "publish"), vec![JobState::Skipped]);
    assert!(h.registry.pushes().is_empty());
}

#[tokio::test]
async fn cancel_while_awaiting_approval() {
    let h = Harness::new(ScriptedExecutor::new());
    let handle = assert_ok!(h.engine.start(
        WorkflowFixture::yamlpath_approved(),
        &TriggerEvent::push("development", "maintainer"),
    ))
    .unwrap();

    next_approval(&handle).await;
    handle.cancel("superseded by a newer push");

    let report = assert_ok!(handle.wait().await);
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    // Finished work is not rolled back
    assert_eq!(states(&report, "validate"), vec![JobState::Succeeded; 5]);
    assert_eq!(states(&report, "publish"), vec![JobState::Cancelled]);
    assert_eq!(
        report.jobs_for("publish")[0].reason.as_deref(),
        Some("superseded by a newer push")
    );
    assert!(h.registry.pushes().is_empty());
}

#[tokio::test]
async fn cancel_aborts_steps_in_flight() {
    let executor = ScriptedExecutor::new().on("pytest", Behavior::Hang);
    let h = Harness::new(executor);
    let handle = assert_ok!(h.engine.start(
        WorkflowFixture::yamlpath(),
        &TriggerEvent::push("development", "maintainer"),
    ))
    .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.cancel("operator abort");

    let report = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run should finish")
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.count(JobState::Cancelled), 6);
    assert!(h.registry.pushes().is_empty());
}

#[tokio::test]
async fn cancelled_run_reports_every_unfinished_job_as_cancelled() {
    for _ in 0..20 {
        let executor = ScriptedExecutor::new().on("pytest", Behavior::Hang);
        let h = Harness::new(executor);
        let handle = assert_ok!(h.engine.start(
            WorkflowFixture::yamlpath(),
            &TriggerEvent::push("development", "maintainer"),
        ))
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle.cancel("operator abort");

        let report = assert_ok!(handle.wait().await);
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.count(JobState::Skipped), 0, "{:#?}", report.jobs);
        assert_eq!(states(&report, "publish"), vec![JobState::Cancelled]);
        assert!(
            report
                .jobs
                .iter()
                .all(|j| j.state == JobState::Cancelled
                    && j.reason.as_deref() == Some("operator abort"))
        );
    }
}

#[tokio::test]
async fn gate_denied_job_skips_only_its_dependents() {
    let h = Harness::new(ScriptedExecutor::new());
    let workflow = WorkflowFixture::from_yaml(
        r#"
name: site
jobs:
  - name: build
    steps: [{ name: build, run: "make site" }]
  - name: deploy
    needs: [build]
    branch: { equals: main }
    steps: [{ name: deploy, run: "make deploy" }]
  - name: smoke
    needs: [deploy]
    steps: [{ name: smoke, run: "make smoke" }]
  - name: docs
    needs: [build]
    steps: [{ name: docs, run: "make docs" }]
"#,
    );

    let report = assert_ok!(h.engine.start(
        workflow.clone(),
        &TriggerEvent::push("feature/x", "contributor"),
    ))
    .unwrap()
    .wait()
    .await
    .unwrap();

    // Skips alone do not fail the run
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(states(&report, "build"), vec![JobState::Succeeded]);
    assert_eq!(states(&report, "deploy"), vec![JobState::Skipped]);
    assert_eq!(states(&report, "smoke"), vec![JobState::Skipped]);
    assert_eq!(states(&report, "docs"), vec![JobState::Succeeded]);
    assert!(
        report.jobs_for("smoke")[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("deploy")
    );
    assert_eq!(h.executor.count("make deploy"), 0);
    assert_eq!(h.executor.count("make smoke"), 0);

    // On the allowed branch nothing is skipped
    let report = assert_ok!(h.engine.start(workflow, &TriggerEvent::push("main", "maintainer")))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.count(JobState::Skipped), 0);
    assert_eq!(report.count(JobState::Succeeded), 4);
}

#[tokio::test]
async fn retried_build_still_publishes_once() {
    let executor = ScriptedExecutor::new().on("python -m build", Behavior::FailTimes(1));
    let h = Harness::new(executor);

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.executor.count("python -m build"), 2);
    assert_eq!(h.registry.pushes().len(), 1);
}

#[tokio::test]
async fn build_failing_every_attempt_never_publishes() {
    let executor = ScriptedExecutor::new().on("python -m build", Behavior::Exit(2));
    let h = Harness::new(executor);

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert!(!report.retryable);
    assert_eq!(h.executor.count("python -m build"), 2);
    assert!(report.publish.is_none());
    assert!(h.registry.pushes().is_empty());
}

#[tokio::test]
async fn transient_publish_failure_is_retryable() {
    let h = Harness::with_registry(
        ScriptedExecutor::new(),
        RecordingRegistry::new(RegistryResponse::Transport),
    );

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert!(report.retryable);
    assert!(matches!(
        report.publish,
        Some(PublishResult::Failed {
            kind: PublishFailureKind::Transient,
            ..
        })
    ));
    assert_eq!(states(&report, "publish"), vec![JobState::Failed]);
    assert_eq!(h.registry.pushes().len(), 1);
}

#[tokio::test]
async fn rejected_credentials_fail_without_retry() {
    let h = Harness::with_registry(
        ScriptedExecutor::new(),
        RecordingRegistry::new(RegistryResponse::Unauthorized),
    );

    let report = run(&h, TriggerEvent::push("development", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert!(!report.retryable);
    assert!(matches!(
        report.publish,
        Some(PublishResult::Failed {
            kind: PublishFailureKind::Fatal,
            ..
        })
    ));
    assert_eq!(h.registry.pushes().len(), 1);
    assert_eq!(h.executor.count("python -m build"), 1);
}

#[tokio::test]
async fn push_to_main_validates_without_publishing() {
    let h = Harness::new(ScriptedExecutor::new());

    let report = run(&h, TriggerEvent::push("main", "maintainer")).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(states(&report, "publish"), vec![JobState::Skipped]);
    assert!(h.registry.pushes().is_empty());
}

#[tokio::test]
async fn cyclic_workflow_never_starts() {
    let h = Harness::new(ScriptedExecutor::new());
    let workflow = WorkflowFixture::from_yaml(
        r#"
name: loop
jobs:
  - name: a
    needs: [c]
    steps: [{ name: s, run: "true" }]
  - name: b
    needs: [a]
    steps: [{ name: s, run: "true" }]
  - name: c
    needs: [b]
    steps: [{ name: s, run: "true" }]
"#,
    );

    let err = match h.engine.start(workflow, &TriggerEvent::push("main", "dev")) {
        Err(err) => err,
        Ok(_) => panic!("cyclic workflow started"),
    };
    match err {
        GraphError::Structure(WorkflowError::Cycle(path)) => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert!(h.executor.executed().is_empty());
}

#[test]
fn empty_matrix_axis_is_rejected_at_load() {
    let doc = r#"
name: empty
jobs:
  - name: test
    matrix:
      python-version: []
    steps: [{ name: s, run: "true" }]
"#;
    assert!(matches!(
        Workflow::from_yaml(doc),
        Err(WorkflowError::EmptyAxis { .. })
    ));
}
