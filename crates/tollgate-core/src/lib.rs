//! Tollgate Core
//!
//! Domain vocabulary shared by every Tollgate crate: workflow documents,
//! run and job state, environments, secret references, and the port traits
//! behind which the external toolchain, secret store, and artifact registry
//! live. This crate performs no I/O of its own.

pub mod branch;
pub mod environment;
pub mod error;
pub mod ids;
pub mod interpolation;
pub mod ports;
pub mod run;
pub mod secrets;
pub mod workflow;

pub use branch::BranchCondition;
pub use error::{Error, Result};
pub use ids::*;
