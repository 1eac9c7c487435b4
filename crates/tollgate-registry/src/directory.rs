//! Local directory registry, for dry runs and tests.

use crate::sha256_hex;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tollgate_core::ports::{Artifact, Registry, RegistryAck, RegistryError};
use tollgate_core::secrets::Credential;
use tracing::info;

/// Stores artifacts under `<root>/<name>/<version>/<file name>`.
///
/// Re-pushing identical contents is acknowledged as already present;
/// different contents under an existing version are rejected.
pub struct DirectoryRegistry {
    root: PathBuf,
    name: String,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("dir:{}", root.display());
        Self { root, name }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(e: std::io::Error) -> RegistryError {
    RegistryError::Transport(e.to_string())
}

#[async_trait]
impl Registry for DirectoryRegistry {
    async fn push(
        &self,
        artifact: &Artifact,
        version: &str,
        _credential: &Credential,
    ) -> Result<RegistryAck, RegistryError> {
        let contents = tokio::fs::read(&artifact.path).await.map_err(|e| {
            RegistryError::Rejected(format!(
                "cannot read artifact {}: {}",
                artifact.path.display(),
                e
            ))
        })?;
        let file_name = artifact
            .path
            .file_name()
            .ok_or_else(|| RegistryError::Rejected("artifact path has no file name".to_string()))?;

        let dir = self.root.join(&artifact.name).join(version);
        let dest = dir.join(file_name);
        let location = Some(dest.display().to_string());

        if tokio::fs::try_exists(&dest).await.map_err(io_error)? {
            let existing = tokio::fs::read(&dest).await.map_err(io_error)?;
            if sha256_hex(&existing) == sha256_hex(&contents) {
                return Ok(RegistryAck {
                    location,
                    already_present: true,
                });
            }
            return Err(RegistryError::Rejected(format!(
                "{} {} already exists with different contents",
                artifact.name, version
            )));
        }

        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        tokio::fs::write(&dest, &contents).await.map_err(io_error)?;

        info!(artifact = %artifact.name, version = %version, path = %dest.display(), "Artifact stored");
        Ok(RegistryAck {
            location,
            already_present: false,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
