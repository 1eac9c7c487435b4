//! Error types for Tollgate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    // Run errors
    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    // Step errors
    #[error("Step timed out after {after:?}")]
    StepTimeout { after: std::time::Duration },

    #[error("Coverage {actual:.2}% is below the required {minimum:.2}%")]
    CoverageBelowThreshold { actual: f64, minimum: f64 },

    #[error("Coverage gate set but step reported no coverage")]
    CoverageMissing,

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    #[error("Secret access denied: {0}")]
    SecretAccessDenied(String),

    // Approval errors
    #[error("Approval token not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval already resolved: {0}")]
    ApprovalAlreadyResolved(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
