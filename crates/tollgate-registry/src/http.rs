//! HTTP artifact registry.

use crate::sha256_hex;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tollgate_core::ports::{Artifact, Registry, RegistryAck, RegistryError};
use tollgate_core::secrets::Credential;
use tracing::{debug, info};
use url::Url;

/// Registry that accepts `PUT {base}/{artifact}/{version}` with a bearer
/// token. A `409 Conflict` means the exact version is already stored.
pub struct HttpRegistry {
    base: Url,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base: &str) -> Result<Self, RegistryError> {
        Self::with_timeout(base, Duration::from_secs(300))
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let mut base = Url::parse(base)
            .map_err(|e| RegistryError::Rejected(format!("invalid registry URL '{}': {}", base, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        Ok(Self { base, client })
    }

    fn artifact_url(&self, artifact: &str, version: &str) -> Result<Url, RegistryError> {
        self.base
            .join(&format!("{}/{}", artifact, version))
            .map_err(|e| RegistryError::Rejected(format!("invalid artifact path: {}", e)))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn push(
        &self,
        artifact: &Artifact,
        version: &str,
        credential: &Credential,
    ) -> Result<RegistryAck, RegistryError> {
        let body = tokio::fs::read(&artifact.path).await.map_err(|e| {
            RegistryError::Rejected(format!(
                "cannot read artifact {}: {}",
                artifact.path.display(),
                e
            ))
        })?;
        let url = self.artifact_url(&artifact.name, version)?;
        let checksum = sha256_hex(&body);

        debug!(url = %url, bytes = body.len(), "Uploading artifact");

        let response = self
            .client
            .put(url.clone())
            .bearer_auth(credential.expose())
            .header("X-Checksum-Sha256", &checksum)
            .body(body)
            .send()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| Some(url.to_string()));

        match status {
            s if s.is_success() => {
                info!(artifact = %artifact.name, version = %version, "Registry accepted artifact");
                Ok(RegistryAck {
                    location,
                    already_present: false,
                })
            }
            StatusCode::CONFLICT => {
                info!(artifact = %artifact.name, version = %version, "Registry already holds artifact");
                Ok(RegistryAck {
                    location,
                    already_present: true,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RegistryError::Unauthorized(format!("registry returned {}", status)))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Err(RegistryError::Transport(format!("registry returned {}", status)))
            }
            s if s.is_server_error() => {
                Err(RegistryError::Transport(format!("registry returned {}", status)))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Rejected(format!(
                    "registry returned {}: {}",
                    status, body
                )))
            }
        }
    }

    fn name(&self) -> &str {
        self.base.as_str()
    }
}
