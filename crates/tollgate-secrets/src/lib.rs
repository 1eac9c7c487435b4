//! Secret providers and scope-based resolution for Tollgate.

pub mod manager;
pub mod providers;

pub use manager::SecretManager;
pub use providers::{EnvProvider, FileProvider, SecretProvider};
