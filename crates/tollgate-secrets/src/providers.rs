//! Secret provider trait and implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tollgate_core::secrets::Credential;
use tollgate_core::{Error, Result};

/// Trait for secret providers.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by provider-specific path.
    async fn get(&self, path: &str) -> Result<Credential>;

    /// Check if a secret exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Environment variable secret provider.
pub struct EnvProvider {
    prefix: Option<String>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn resolve_name(&self, path: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{}_{}", p, path),
            None => path.to_string(),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, path: &str) -> Result<Credential> {
        std::env::var(self.resolve_name(path))
            .map(Credential::new)
            .map_err(|_| Error::SecretNotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(std::env::var(self.resolve_name(path)).is_ok())
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// File-based secret provider: a flat JSON object of name to value.
pub struct FileProvider {
    secrets: HashMap<String, String>,
}

impl FileProvider {
    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let secrets: HashMap<String, String> = serde_json::from_str(&content)?;

        Ok(Self { secrets })
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, path: &str) -> Result<Credential> {
        self.secrets
            .get(path)
            .map(Credential::new)
            .ok_or_else(|| Error::SecretNotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.secrets.contains_key(path))
    }

    fn name(&self) -> &str {
        "file"
    }
}
