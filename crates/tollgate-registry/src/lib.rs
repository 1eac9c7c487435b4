//! Artifact registry adapters for Tollgate.

pub mod directory;
pub mod http;

pub use directory::DirectoryRegistry;
pub use http::HttpRegistry;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an artifact's contents.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
