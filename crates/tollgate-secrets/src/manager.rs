//! Secret manager resolving secrets through gate-issued scope handles.

use crate::providers::SecretProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tollgate_core::ports::SecretResolver;
use tollgate_core::secrets::{Credential, ScopeHandle};
use tollgate_core::{Error, Result};
use tracing::{debug, info, warn};

/// Resolves secrets from registered providers. Only names exposed by a live
/// scope handle can be resolved.
pub struct SecretManager {
    providers: HashMap<String, Arc<dyn SecretProvider>>,
}

impl SecretManager {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a secret provider under the name secret references use.
    pub fn register_provider(&mut self, name: &str, provider: Arc<dyn SecretProvider>) {
        info!(provider = %name, "Registering secret provider");
        self.providers.insert(name.to_string(), provider);
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretResolver for SecretManager {
    async fn resolve(&self, scope: &ScopeHandle, name: &str) -> Result<Credential> {
        if !scope.is_live() {
            warn!(run_id = %scope.run_id(), secret = %name, "Scope handle used after its run ended");
            return Err(Error::SecretAccessDenied(format!(
                "scope for run {} has been revoked",
                scope.run_id()
            )));
        }

        let reference = scope.lookup(name).ok_or_else(|| {
            Error::SecretNotFound(format!(
                "{} (not exposed by environment '{}')",
                name,
                scope.environment()
            ))
        })?;

        let provider = self
            .providers
            .get(&reference.provider)
            .ok_or_else(|| Error::SecretProviderNotConfigured(reference.provider.clone()))?;

        let path = reference.path.as_deref().unwrap_or(name);
        let credential = provider.get(path).await?;

        debug!(
            secret = %name,
            provider = %provider.name(),
            environment = %scope.environment(),
            "Secret resolved"
        );
        Ok(credential)
    }
}
