//! Coverage percentage extraction from step output.

use regex::Regex;
use tollgate_core::{Error, Result};

/// Scans output lines for a coverage percentage; the last match wins.
#[derive(Debug, Clone)]
pub struct CoverageExtractor {
    pattern: Regex,
    found: Option<f64>,
}

impl CoverageExtractor {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::InvalidWorkflow(format!("invalid coverage pattern: {}", e)))?;
        if pattern.captures_len() < 2 {
            return Err(Error::InvalidWorkflow(
                "coverage pattern needs a capture group".to_string(),
            ));
        }
        Ok(Self {
            pattern,
            found: None,
        })
    }

    pub fn scan(&mut self, line: &str) {
        if let Some(value) = self
            .pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            self.found = Some(value);
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.found
    }
}
