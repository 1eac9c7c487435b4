//! In-memory collaborators.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tollgate_core::Result;
use tollgate_core::ports::{
    Artifact, Registry, RegistryAck, RegistryError, StepContext, StepExecutor, StepOutput,
};
use tollgate_core::secrets::Credential;

/// What a scripted command does.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Exit(i32),
    /// Succeeds and reports this coverage percentage.
    Coverage(f64),
    /// Exits 1 for the first `n` calls, then succeeds.
    FailTimes(usize),
    /// Never completes; only cancellation ends it.
    Hang,
}

/// Step executor driven by substring rules on the interpolated command.
///
/// Commands matching no rule succeed, reporting full coverage when the step
/// has a coverage gate.
pub struct ScriptedExecutor {
    rules: Vec<(String, Behavior)>,
    executed: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            executed: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Apply `behavior` to commands containing `needle`. Earlier rules win.
    pub fn on(mut self, needle: &str, behavior: Behavior) -> Self {
        self.rules.push((needle.to_string(), behavior));
        self
    }

    /// Every command executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Number of executions whose command contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput> {
        self.executed.lock().unwrap().push(ctx.command.clone());
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(ctx.command.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let full = ctx.step.coverage.as_ref().map(|_| 100.0);
        let behavior = self
            .rules
            .iter()
            .find(|(needle, _)| ctx.command.contains(needle.as_str()))
            .map(|(_, b)| b.clone());

        let (exit_code, coverage) = match behavior {
            None => (0, full),
            Some(Behavior::Exit(code)) => (code, full),
            Some(Behavior::Coverage(value)) => (0, Some(value)),
            Some(Behavior::FailTimes(n)) if call <= n => (1, full),
            Some(Behavior::FailTimes(_)) => (0, full),
            Some(Behavior::Hang) => std::future::pending().await,
        };

        Ok(StepOutput {
            exit_code,
            coverage,
            duration_ms: 1,
        })
    }
}

/// How a [`RecordingRegistry`] answers pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryResponse {
    Accept,
    Transport,
    Unauthorized,
}

/// Registry that records every push and the credential it carried.
pub struct RecordingRegistry {
    response: RegistryResponse,
    pushes: Mutex<Vec<(String, String)>>,
    credentials: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn new(response: RegistryResponse) -> Self {
        Self {
            response,
            pushes: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
        }
    }

    /// `(artifact, version)` of every push, in order.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }
}

impl Default for RecordingRegistry {
    fn default() -> Self {
        Self::new(RegistryResponse::Accept)
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    async fn push(
        &self,
        artifact: &Artifact,
        version: &str,
        credential: &Credential,
    ) -> std::result::Result<RegistryAck, RegistryError> {
        self.pushes
            .lock()
            .unwrap()
            .push((artifact.name.clone(), version.to_string()));
        self.credentials
            .lock()
            .unwrap()
            .push(credential.expose().to_string());

        match self.response {
            RegistryResponse::Accept => Ok(RegistryAck {
                location: Some(format!("memory://{}/{}", artifact.name, version)),
                already_present: false,
            }),
            RegistryResponse::Transport => {
                Err(RegistryError::Transport("connection reset".to_string()))
            }
            RegistryResponse::Unauthorized => {
                Err(RegistryError::Unauthorized("invalid token".to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
