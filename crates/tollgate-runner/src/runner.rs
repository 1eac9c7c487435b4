//! Runner configuration and output types.

use serde::{Deserialize, Serialize};

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: String,
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Hard limit on any single command, independent of step timeouts.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Coverage regex used when a step's coverage gate sets no pattern. The
    /// first capture group must be the percentage.
    #[serde(default = "default_coverage_pattern")]
    pub coverage_pattern: String,
    /// Pass the engine's own environment through to steps.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
}

/// Trailing percentage on a coverage.py style `TOTAL` line.
pub const DEFAULT_COVERAGE_PATTERN: &str = r"^TOTAL\s.*?(\d+(?:\.\d+)?)%\s*$";

fn default_coverage_pattern() -> String {
    DEFAULT_COVERAGE_PATTERN.to_string()
}

fn default_inherit_env() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            coverage_pattern: default_coverage_pattern(),
            inherit_env: default_inherit_env(),
        }
    }
}
