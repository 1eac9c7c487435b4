//! Workflow fixtures and an engine harness.

use crate::fakes::{RecordingRegistry, ScriptedExecutor};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tollgate_core::environment::ApprovalRequest;
use tollgate_core::workflow::Workflow;
use tollgate_scheduler::{Engine, EngineConfig, FixedClock, RunHandle};
use tollgate_secrets::{FileProvider, SecretManager};

/// Credential value the fixture secret store holds for the registry.
pub const REGISTRY_TOKEN: &str = "pypi-test-token";

/// The instant fixture engines stamp release versions with.
pub fn release_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
}

/// Factory for test workflows.
pub struct WorkflowFixture;

impl WorkflowFixture {
    /// A Python package pipeline: five-cell coverage-gated validation, then
    /// a release from `development` through the `pypi` environment.
    pub fn yamlpath() -> Arc<Workflow> {
        Self::yamlpath_with(false)
    }

    /// As [`WorkflowFixture::yamlpath`], with the `pypi` environment
    /// requiring approval.
    pub fn yamlpath_approved() -> Arc<Workflow> {
        Self::yamlpath_with(true)
    }

    fn yamlpath_with(require_approval: bool) -> Arc<Workflow> {
        let doc = format!(
            r#"
name: yamlpath
triggers:
  - type: push
    branches: [development, main]
  - type: pull_request
    branches: [development]
  - type: manual
environments:
  - name: pypi
    require_approval: {}
    secrets:
      PUBLISH_TOKEN: {{ provider: file, path: PYPI_API_TOKEN }}
release:
  job: publish
  branch: development
  base_version: "2.0"
  artifact: {{ name: yamlpath, path: dist/yamlpath.tar.gz }}
  credential: PUBLISH_TOKEN
jobs:
  - name: validate
    matrix:
      python-version: ["3.6", "3.7", "3.8", "3.9", "3.10"]
    steps:
      - name: lint
        run: "pycodestyle yamlpath --python ${{{{ matrix.python-version }}}}"
      - name: test
        run: "pytest --cov=yamlpath --python ${{{{ matrix.python-version }}}}"
        coverage: {{ minimum: 100 }}
  - name: publish
    needs: [validate]
    environment: pypi
    steps:
      - name: build
        run: "python -m build --version ${{{{ version }}}}"
        retry: {{ max_attempts: 2 }}
"#,
            require_approval
        );
        Arc::new(Workflow::from_yaml(&doc).unwrap())
    }

    /// Parse an inline workflow document.
    pub fn from_yaml(doc: &str) -> Arc<Workflow> {
        Arc::new(Workflow::from_yaml(doc).unwrap())
    }
}

/// Secret manager whose `file` provider holds the registry token.
pub fn secret_manager() -> SecretManager {
    let mut values = HashMap::new();
    values.insert("PYPI_API_TOKEN".to_string(), REGISTRY_TOKEN.to_string());

    let mut manager = SecretManager::new();
    manager.register_provider("file", Arc::new(FileProvider::from_map(values)));
    manager
}

/// An engine wired to in-memory collaborators and a fixed clock.
pub struct Harness {
    pub engine: Engine,
    pub executor: Arc<ScriptedExecutor>,
    pub registry: Arc<RecordingRegistry>,
    pub workspace: TempDir,
}

impl Harness {
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self::with_registry(executor, RecordingRegistry::default())
    }

    pub fn with_registry(executor: ScriptedExecutor, registry: RecordingRegistry) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let executor = Arc::new(executor);
        let registry = Arc::new(registry);
        let config = EngineConfig {
            max_parallel: 3,
            workspace: workspace.path().to_path_buf(),
            default_step_timeout_secs: None,
        };
        let engine = Engine::new(
            executor.clone(),
            Arc::new(secret_manager()),
            registry.clone(),
            config,
        )
        .with_clock(Arc::new(FixedClock(release_instant())));

        Self {
            engine,
            executor,
            registry,
            workspace,
        }
    }
}

/// Wait until the run requests an approval and return the request.
///
/// Panics after five seconds without one.
pub async fn next_approval(handle: &RunHandle) -> ApprovalRequest {
    let mut updates = handle.approval_updates();
    let wait = async {
        loop {
            if let Some(request) = handle.pending_approvals().await.into_iter().next() {
                return request;
            }
            if updates.changed().await.is_err() {
                panic!("approval ledger closed");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("run never requested an approval")
}
