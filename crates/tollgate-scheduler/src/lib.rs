//! Orchestration core for Tollgate.
//!
//! Decides whether an event activates a workflow, expands job templates
//! into matrix instances, schedules them through a dependency graph, gates
//! protected jobs on their environment, and performs the versioned release.

pub mod cancel;
pub mod dag;
pub mod engine;
pub mod gate;
pub mod job;
pub mod matrix;
pub mod publisher;
pub mod triggers;
pub mod version;

pub use cancel::CancelSignal;
pub use dag::{GraphError, JobGraph};
pub use engine::{Engine, EngineConfig, RunHandle};
pub use gate::{ApprovalLedger, EnvironmentGate, GateResult};
pub use job::JobRunner;
pub use matrix::{MatrixError, MatrixExpander};
pub use publisher::Publisher;
pub use triggers::{ActivationDecision, SuppressReason, TriggerEvaluator};
pub use version::{Clock, FixedClock, SystemClock, VersionError, VersionFile, VersionStamp, stamp};
