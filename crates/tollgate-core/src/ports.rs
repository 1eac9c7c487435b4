//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! external collaborators: the toolchain that runs steps, the secret store,
//! and the artifact registry.

use crate::Result;
use crate::ids::{JobId, RunId};
use crate::secrets::{Credential, ScopeHandle};
use crate::workflow::StepDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Everything a step executor needs to run one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_name: String,
    pub workspace: PathBuf,
    /// The step command after interpolation.
    pub command: String,
    /// Step environment after interpolation, including matrix values.
    pub env: HashMap<String, String>,
    pub step: StepDefinition,
}

/// What a step executor reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub exit_code: i32,
    /// Coverage percentage, when the step produced one.
    pub coverage: Option<f64>,
    pub duration_ms: u64,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one step against the external toolchain.
///
/// `Err` means the step could not be run at all (spawn failure, timeout);
/// a non-zero exit code is reported through `Ok`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput>;
}

/// Resolves secrets exposed by a gate's scope handle.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, scope: &ScopeHandle, name: &str) -> Result<Credential>;
}

/// An artifact to publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

/// Registry acknowledgement of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAck {
    pub location: Option<String>,
    /// The registry already held this exact (artifact, version).
    pub already_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Registry transport failure: {0}")]
    Transport(String),
    #[error("Registry rejected credentials: {0}")]
    Unauthorized(String),
    #[error("Registry rejected artifact: {0}")]
    Rejected(String),
}

/// Artifact registry. Pushes of identical (artifact, version) pairs are
/// expected to be idempotent.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn push(
        &self,
        artifact: &Artifact,
        version: &str,
        credential: &Credential,
    ) -> std::result::Result<RegistryAck, RegistryError>;

    /// Registry name for logging.
    fn name(&self) -> &str;
}
