//! Test infrastructure for Tollgate.
//!
//! In-memory collaborators and workflow fixtures for driving the engine end
//! to end without a real toolchain, secret store or registry.
//!
//! ```ignore
//! use tollgate_tests::{Harness, ScriptedExecutor, WorkflowFixture};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let h = Harness::new(ScriptedExecutor::new());
//!     let handle = h.engine.start(WorkflowFixture::yamlpath(), &event).unwrap();
//! }
//! ```

pub mod fakes;
pub mod fixtures;

pub use fakes::*;
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tollgate_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
