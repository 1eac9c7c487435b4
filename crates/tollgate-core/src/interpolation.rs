use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation regex"));

/// Context for `${{ ... }}` interpolation in step commands and env values.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Workflow and job variables
    pub variables: HashMap<String, String>,
    /// Matrix values for the current job instance
    pub matrix: HashMap<String, String>,
    /// Triggering branch
    pub branch: Option<String>,
    /// Release version, once stamped
    pub version: Option<String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - variable, falling back to the process environment
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ branch }}` and `${{ version }}`
    ///
    /// Unknown expressions resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        match expr {
            "branch" => self.branch.clone().unwrap_or_default(),
            "version" => self.version.clone().unwrap_or_default(),
            _ => self.variables.get(expr).cloned().unwrap_or_default(),
        }
    }
}
