//! Matrix expansion of job templates into job instances.

use thiserror::Error;
use tollgate_core::ids::JobId;
use tollgate_core::run::JobInstance;
use tollgate_core::workflow::{JobTemplate, MatrixAxis, render_value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("Matrix axis '{axis}' of job '{template}' has no values")]
    EmptyAxis { template: String, axis: String },
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a template using its own declared axes.
    pub fn expand_template(&self, template: &JobTemplate) -> Result<Vec<JobInstance>, MatrixError> {
        self.expand(template, &template.matrix)
    }

    /// Expand a template over the given axes.
    ///
    /// Zero axes yield exactly one instance. Otherwise the result is the
    /// cartesian product in axis declaration order, the last axis varying
    /// fastest, so the same axes always produce the same sequence.
    pub fn expand(
        &self,
        template: &JobTemplate,
        axes: &[MatrixAxis],
    ) -> Result<Vec<JobInstance>, MatrixError> {
        if let Some(empty) = axes.iter().find(|a| a.values.is_empty()) {
            return Err(MatrixError::EmptyAxis {
                template: template.name.clone(),
                axis: empty.name.clone(),
            });
        }

        let combinations = self.generate_combinations(axes);

        Ok(combinations
            .into_iter()
            .enumerate()
            .map(|(index, matrix)| {
                let display_name = self.format_display_name(template, &matrix);
                JobInstance {
                    id: JobId::new(),
                    template: template.name.clone(),
                    index,
                    matrix,
                    display_name,
                }
            })
            .collect())
    }

    fn generate_combinations(&self, axes: &[MatrixAxis]) -> Vec<Vec<(String, serde_json::Value)>> {
        let mut result = vec![Vec::new()];

        for axis in axes {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in &axis.values {
                    let mut extended = combo.clone();
                    extended.push((axis.name.clone(), value.clone()));
                    next.push(extended);
                }
            }
            result = next;
        }

        result
    }

    fn format_display_name(
        &self,
        template: &JobTemplate,
        matrix: &[(String, serde_json::Value)],
    ) -> String {
        let base = template.display_name.as_deref().unwrap_or(&template.name);
        if matrix.is_empty() {
            return base.to_string();
        }

        let parts: Vec<String> = matrix
            .iter()
            .map(|(k, v)| format!("{}={}", k, render_value(v)))
            .collect();

        format!("{} ({})", base, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tollgate_core::workflow::StepDefinition;

    fn template(name: &str, matrix: Vec<MatrixAxis>) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            display_name: None,
            needs: vec![],
            matrix,
            environment: None,
            branch: None,
            variables: Default::default(),
            steps: vec![StepDefinition {
                name: "run".to_string(),
                run: "pytest".to_string(),
                shell: "sh".to_string(),
                working_directory: None,
                env: Default::default(),
                coverage: None,
                retry: None,
                timeout_minutes: None,
            }],
        }
    }

    #[test]
    fn test_zero_axes_is_identity() {
        let expander = MatrixExpander::new();
        let jobs = expander.expand_template(&template("lint", vec![])).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].display_name, "lint");
        assert!(jobs[0].matrix.is_empty());
    }

    #[test]
    fn test_cartesian_product_order() {
        let expander = MatrixExpander::new();
        let tpl = template(
            "test",
            vec![
                MatrixAxis::of("os", &["linux", "macos"]),
                MatrixAxis::of("version", &["18", "20", "22"]),
            ],
        );

        let jobs = expander.expand_template(&tpl).unwrap();
        assert_eq!(jobs.len(), 6); // 2 OS × 3 versions

        let cells: Vec<Vec<String>> = jobs.iter().map(|j| j.cell()).collect();
        assert_eq!(
            cells,
            vec![
                vec!["linux", "18"],
                vec!["linux", "20"],
                vec!["linux", "22"],
                vec!["macos", "18"],
                vec!["macos", "20"],
                vec!["macos", "22"],
            ]
        );
        assert_eq!(jobs[4].display_name, "test (os=macos, version=20)");
        assert_eq!(jobs.iter().map(|j| j.index).collect::<Vec<_>>(), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_instances_are_unique_and_stable() {
        let expander = MatrixExpander::new();
        let tpl = template(
            "validate",
            vec![
                MatrixAxis::of("python-version", &["3.6", "3.7", "3.8", "3.9", "3.10"]),
                MatrixAxis::of("os", &["ubuntu", "windows"]),
                MatrixAxis::of("extras", &["none", "all", "docs"]),
            ],
        );

        let first = expander.expand_template(&tpl).unwrap();
        let second = expander.expand_template(&tpl).unwrap();
        assert_eq!(first.len(), 5 * 2 * 3);

        let unique: HashSet<Vec<String>> = first.iter().map(|j| j.cell()).collect();
        assert_eq!(unique.len(), first.len());

        let a: Vec<Vec<String>> = first.iter().map(|j| j.cell()).collect();
        let b: Vec<Vec<String>> = second.iter().map(|j| j.cell()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_axis_fails() {
        let expander = MatrixExpander::new();
        let tpl = template(
            "validate",
            vec![
                MatrixAxis::of("python-version", &["3.9"]),
                MatrixAxis::new("os", vec![]),
            ],
        );
        assert_eq!(
            expander.expand_template(&tpl).unwrap_err(),
            MatrixError::EmptyAxis {
                template: "validate".to_string(),
                axis: "os".to_string()
            }
        );
    }

    #[test]
    fn test_non_string_values_render() {
        let expander = MatrixExpander::new();
        let tpl = template(
            "shard",
            vec![MatrixAxis::new("n", vec![serde_json::json!(1), serde_json::json!(2)])],
        );
        let jobs = expander.expand_template(&tpl).unwrap();
        assert_eq!(jobs[1].display_name, "shard (n=2)");
    }
}
