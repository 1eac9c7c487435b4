//! Secret references, scopes and credentials.

use crate::ids::RunId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a secret lives. Never holds the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretRef {
    pub provider: String,
    /// Provider-specific path; defaults to the secret's name.
    #[serde(default)]
    pub path: Option<String>,
}

/// The secret references an environment exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretScope {
    pub environment: String,
    pub refs: BTreeMap<String, SecretRef>,
}

impl SecretScope {
    pub fn empty(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            refs: BTreeMap::new(),
        }
    }
}

/// Read-only handle to a secret scope, issued by the environment gate.
///
/// Handles are bound to the run that issued them; once the run ends they are
/// revoked and resolvers refuse them.
#[derive(Clone)]
pub struct ScopeHandle {
    run_id: RunId,
    scope: Arc<SecretScope>,
    live: Arc<AtomicBool>,
}

impl ScopeHandle {
    pub fn new(run_id: RunId, scope: SecretScope, live: Arc<AtomicBool>) -> Self {
        Self {
            run_id,
            scope: Arc::new(scope),
            live,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn environment(&self) -> &str {
        &self.scope.environment
    }

    pub fn lookup(&self, name: &str) -> Option<&SecretRef> {
        self.scope.refs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scope.refs.keys().map(String::as_str)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("run_id", &self.run_id)
            .field("environment", &self.scope.environment)
            .field("secrets", &self.scope.refs.keys().collect::<Vec<_>>())
            .field("live", &self.is_live())
            .finish()
    }
}

/// An opaque credential. Its value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a registry client.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("pypi-AgEIcHlwaS5vcmc");
        assert_eq!(format!("{:?}", cred), "Credential(***)");
        assert_eq!(cred.expose(), "pypi-AgEIcHlwaS5vcmc");
    }

    #[test]
    fn test_scope_handle_revocation() {
        let live = Arc::new(AtomicBool::new(true));
        let mut refs = BTreeMap::new();
        refs.insert(
            "TOKEN".to_string(),
            SecretRef {
                provider: "env".to_string(),
                path: None,
            },
        );
        let handle = ScopeHandle::new(
            RunId::new(),
            SecretScope {
                environment: "pypi".to_string(),
                refs,
            },
            live.clone(),
        );

        assert!(handle.is_live());
        assert!(handle.lookup("TOKEN").is_some());
        live.store(false, Ordering::Release);
        assert!(!handle.is_live());
    }
}
