//! Step execution on the host for Tollgate.

pub mod coverage;
pub mod runner;
pub mod shell;

pub use coverage::CoverageExtractor;
pub use runner::{OutputLine, OutputStream, RunnerConfig};
pub use shell::ShellRunner;
