//! Versioned artifact publishing.

use crate::version::VersionStamp;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tollgate_core::ports::{Artifact, Registry, RegistryError, SecretResolver};
use tollgate_core::run::{PublishFailureKind, PublishResult};
use tollgate_core::secrets::ScopeHandle;
use tracing::{error, info, warn};

/// Publishes release artifacts for one run.
///
/// Each (artifact, version) pair is pushed at most once per publisher; a
/// repeated request is answered with `Duplicate` without touching the
/// registry, whatever the first attempt's outcome was.
pub struct Publisher {
    registry: Arc<dyn Registry>,
    resolver: Arc<dyn SecretResolver>,
    attempted: Mutex<HashSet<(String, String)>>,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>, resolver: Arc<dyn SecretResolver>) -> Self {
        Self {
            registry,
            resolver,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn publish(
        &self,
        artifact: &Artifact,
        version: &VersionStamp,
        scope: &ScopeHandle,
        credential: &str,
    ) -> PublishResult {
        let version = version.to_string();

        // Record the attempt before any await on the registry
        {
            let mut attempted = self.attempted.lock().await;
            if !attempted.insert((artifact.name.clone(), version.clone())) {
                warn!(
                    artifact = %artifact.name,
                    version = %version,
                    "Publish already attempted in this run"
                );
                return PublishResult::Duplicate {
                    artifact: artifact.name.clone(),
                    version,
                };
            }
        }

        let secret = match self.resolver.resolve(scope, credential).await {
            Ok(secret) => secret,
            Err(e) => {
                error!(
                    artifact = %artifact.name,
                    environment = %scope.environment(),
                    credential = %credential,
                    error = %e,
                    "Credential unavailable"
                );
                return PublishResult::Failed {
                    artifact: artifact.name.clone(),
                    version,
                    kind: PublishFailureKind::Fatal,
                    message: e.to_string(),
                };
            }
        };

        info!(
            artifact = %artifact.name,
            version = %version,
            registry = %self.registry.name(),
            "Publishing artifact"
        );

        match self.registry.push(artifact, &version, &secret).await {
            Ok(ack) => {
                info!(
                    artifact = %artifact.name,
                    version = %version,
                    location = ?ack.location,
                    already_present = ack.already_present,
                    "Artifact published"
                );
                PublishResult::Published {
                    artifact: artifact.name.clone(),
                    version,
                }
            }
            Err(e) => {
                let kind = failure_kind(&e);
                error!(
                    artifact = %artifact.name,
                    version = %version,
                    kind = ?kind,
                    error = %e,
                    "Publish failed"
                );
                PublishResult::Failed {
                    artifact: artifact.name.clone(),
                    version,
                    kind,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Number of distinct (artifact, version) pairs attempted.
    pub async fn attempts(&self) -> usize {
        self.attempted.lock().await.len()
    }
}

fn failure_kind(err: &RegistryError) -> PublishFailureKind {
    match err {
        RegistryError::Transport(_) => PublishFailureKind::Transient,
        RegistryError::Unauthorized(_) | RegistryError::Rejected(_) => PublishFailureKind::Fatal,
    }
}
