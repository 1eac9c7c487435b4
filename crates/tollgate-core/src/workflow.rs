//! Workflow definition types.
//!
//! These types represent the user-authored workflow YAML document. A
//! [`Workflow`] is a definition that passed structural validation; it is
//! immutable for the duration of a run and shared read-only by every job
//! instance created from it.

use crate::branch::BranchCondition;
use crate::environment::EnvironmentDefinition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Structural errors found while loading a workflow. All of them block run
/// creation; nothing executes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("Malformed workflow document: {0}")]
    Malformed(String),
    #[error("Workflow declares no jobs")]
    NoJobs,
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("Job '{job}' needs unknown job '{needs}'")]
    UnknownNeeds { job: String, needs: String },
    #[error("Cycle detected in job dependencies: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Matrix axis '{axis}' of job '{job}' has no values")]
    EmptyAxis { job: String, axis: String },
    #[error("Matrix axis '{axis}' is declared twice in job '{job}'")]
    DuplicateAxis { job: String, axis: String },
    #[error("Matrix axis '{axis}' of job '{job}' lists '{value}' more than once")]
    DuplicateAxisValue {
        job: String,
        axis: String,
        value: String,
    },
    #[error(
        "Matrix axis '{axis}' of job '{job}' has the unquoted number {value}; quote it to keep its text"
    )]
    UnquotedFloat {
        job: String,
        axis: String,
        value: String,
    },
    #[error("Job '{job}' is bound to unknown environment '{environment}'")]
    UnknownEnvironment { job: String, environment: String },
    #[error("Duplicate environment name: {0}")]
    DuplicateEnvironment(String),
    #[error("Release job '{0}' is not declared")]
    UnknownReleaseJob(String),
    #[error("Release needs a base_version or a version_file")]
    MissingVersionSource,
    #[error("Job '{job}' has no steps")]
    NoSteps { job: String },
}

/// Kinds of events a workflow can be triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Manual,
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Manual => "manual",
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            "push" => Ok(EventKind::Push),
            "pull_request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub environments: Vec<EnvironmentDefinition>,
    #[serde(default)]
    pub release: Option<ReleaseConfig>,
    pub jobs: Vec<JobTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Branch filters. Push events match them exactly, pull requests match
    /// their target branch against them as globs. Empty matches any branch.
    #[serde(default)]
    pub branches: Vec<String>,
}

impl TriggerConfig {
    /// The branch conditions this trigger applies to events of its kind.
    pub fn branch_conditions(&self) -> Vec<BranchCondition> {
        if self.branches.is_empty() {
            return vec![BranchCondition::Always];
        }
        self.branches
            .iter()
            .map(|b| match self.kind {
                EventKind::PullRequest => BranchCondition::Glob(b.clone()),
                EventKind::Push | EventKind::Manual => BranchCondition::Equals(b.clone()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(
        default,
        serialize_with = "axes::serialize",
        deserialize_with = "axes::deserialize"
    )]
    #[schemars(with = "std::collections::BTreeMap<String, Vec<serde_json::Value>>")]
    pub matrix: Vec<MatrixAxis>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub branch: Option<BranchCondition>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

/// One matrix axis: a name and its ordered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Build an axis from string values.
    pub fn of<S: AsRef<str>>(name: impl Into<String>, values: &[S]) -> Self {
        Self::new(
            name,
            values
                .iter()
                .map(|v| serde_json::Value::String(v.as_ref().to_string()))
                .collect(),
        )
    }
}

impl MatrixAxis {
    /// Values must render distinctly. YAML floats are rejected since `3.10`
    /// would render as `3.1`.
    fn check_values(&self, job: &str) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for value in &self.values {
            let rendered = render_value(value);
            if value.is_f64() {
                return Err(WorkflowError::UnquotedFloat {
                    job: job.to_string(),
                    axis: self.name.clone(),
                    value: rendered,
                });
            }
            if !seen.insert(rendered.clone()) {
                return Err(WorkflowError::DuplicateAxisValue {
                    job: job.to_string(),
                    axis: self.name.clone(),
                    value: rendered,
                });
            }
        }
        Ok(())
    }
}

/// Render a matrix value the way it appears in names and interpolation.
pub fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Matrix axes are written as an ordered mapping; declaration order is kept.
mod axes {
    use super::MatrixAxis;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(axes: &[MatrixAxis], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(axes.len()))?;
        for axis in axes {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<MatrixAxis>, D::Error> {
        struct AxesVisitor;

        impl<'de> Visitor<'de> for AxesVisitor {
            type Value = Vec<MatrixAxis>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis name to a list of values")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut axes = Vec::new();
                while let Some((name, values)) = map.next_entry::<String, Vec<serde_json::Value>>()? {
                    axes.push(MatrixAxis { name, values });
                }
                Ok(axes)
            }
        }

        deserializer.deserialize_map(AxesVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub coverage: Option<CoverageGate>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Minimum-coverage quality gate on a step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoverageGate {
    /// Required percentage, 0-100.
    pub minimum: f64,
    /// Regex with one capture group yielding the percentage from step output.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl CoverageGate {
    /// Compare a reported percentage against the threshold.
    pub fn passes(&self, actual: f64) -> bool {
        actual >= self.minimum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_seconds: u32,
}

fn default_max_attempts() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReleaseConfig {
    /// Job template whose success performs the publish.
    pub job: String,
    /// Only runs triggered from this branch may publish.
    pub branch: String,
    #[serde(default)]
    pub base_version: Option<String>,
    #[serde(default)]
    pub version_file: Option<String>,
    pub artifact: ArtifactConfig,
    /// Name of the secret, within the release job's environment, used to
    /// authenticate against the registry.
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactConfig {
    pub name: String,
    pub path: String,
}

impl WorkflowDefinition {
    /// Parse a workflow document without validating it.
    pub fn from_yaml(content: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(content).map_err(|e| WorkflowError::Malformed(e.to_string()))
    }

    /// Document-level structural validation. Dependency cycles are detected
    /// when the job graph is built.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Malformed("workflow name is empty".to_string()));
        }
        if self.jobs.is_empty() {
            return Err(WorkflowError::NoJobs);
        }

        let mut environments = HashSet::new();
        for env in &self.environments {
            if !environments.insert(env.name.as_str()) {
                return Err(WorkflowError::DuplicateEnvironment(env.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(WorkflowError::Malformed("job name is empty".to_string()));
            }
            if !names.insert(job.name.as_str()) {
                return Err(WorkflowError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &self.jobs {
            if job.steps.is_empty() {
                return Err(WorkflowError::NoSteps {
                    job: job.name.clone(),
                });
            }
            for dep in &job.needs {
                if !names.contains(dep.as_str()) {
                    return Err(WorkflowError::UnknownNeeds {
                        job: job.name.clone(),
                        needs: dep.clone(),
                    });
                }
            }
            let mut axis_names = HashSet::new();
            for axis in &job.matrix {
                if !axis_names.insert(axis.name.as_str()) {
                    return Err(WorkflowError::DuplicateAxis {
                        job: job.name.clone(),
                        axis: axis.name.clone(),
                    });
                }
                if axis.values.is_empty() {
                    return Err(WorkflowError::EmptyAxis {
                        job: job.name.clone(),
                        axis: axis.name.clone(),
                    });
                }
                axis.check_values(&job.name)?;
            }
            if let Some(env) = &job.environment
                && !environments.contains(env.as_str())
            {
                return Err(WorkflowError::UnknownEnvironment {
                    job: job.name.clone(),
                    environment: env.clone(),
                });
            }
        }

        if let Some(release) = &self.release {
            if !names.contains(release.job.as_str()) {
                return Err(WorkflowError::UnknownReleaseJob(release.job.clone()));
            }
            if release.base_version.is_none() && release.version_file.is_none() {
                return Err(WorkflowError::MissingVersionSource);
            }
        }

        Ok(())
    }
}

/// A structurally valid workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    definition: WorkflowDefinition,
}

impl Workflow {
    pub fn from_definition(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        definition.validate()?;
        Ok(Self { definition })
    }

    pub fn from_yaml(content: &str) -> Result<Self, WorkflowError> {
        Self::from_definition(WorkflowDefinition::from_yaml(content)?)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn triggers(&self) -> &[TriggerConfig] {
        &self.definition.triggers
    }

    pub fn templates(&self) -> &[JobTemplate] {
        &self.definition.jobs
    }

    pub fn template(&self, name: &str) -> Option<&JobTemplate> {
        self.definition.jobs.iter().find(|j| j.name == name)
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentDefinition> {
        self.definition.environments.iter().find(|e| e.name == name)
    }

    pub fn release(&self) -> Option<&ReleaseConfig> {
        self.definition.release.as_ref()
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.definition.variables
    }

    /// The branch condition the gate enforces for a template: its own
    /// condition, or for the release job an exact match on the release branch.
    pub fn branch_condition(&self, template: &str) -> Option<BranchCondition> {
        let job = self.template(template)?;
        if let Some(release) = self.release()
            && release.job == template
        {
            return Some(BranchCondition::Equals(release.branch.clone()));
        }
        job.branch.clone()
    }

    pub fn is_release_job(&self, template: &str) -> bool {
        self.release().is_some_and(|r| r.job == template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"
name: yamlpath
triggers:
  - type: push
    branches: [development]
  - type: pull_request
    branches: [development]
  - type: manual
environments:
  - name: pypi
    secrets:
      PUBLISH_TOKEN: { provider: env, path: PYPI_API_TOKEN }
release:
  job: publish
  branch: development
  base_version: "3.6"
  artifact: { name: yamlpath, path: dist/yamlpath.tar.gz }
  credential: PUBLISH_TOKEN
jobs:
  - name: validate
    matrix:
      python-version: ["3.6", "3.7", "3.8", "3.9", "3.10"]
      os: [ubuntu, macos]
    steps:
      - name: test
        run: pytest --cov
        coverage: { minimum: 100 }
  - name: publish
    needs: [validate]
    environment: pypi
    steps:
      - name: build
        run: python -m build
"#;

    #[test]
    fn test_parse_keeps_axis_order() {
        let workflow = Workflow::from_yaml(DOC).unwrap();
        let validate = workflow.template("validate").unwrap();
        let names: Vec<&str> = validate.matrix.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["python-version", "os"]);
        assert_eq!(render_value(&validate.matrix[0].values[4]), "3.10");
    }

    #[test]
    fn test_release_job_gets_branch_condition() {
        let workflow = Workflow::from_yaml(DOC).unwrap();
        assert_eq!(
            workflow.branch_condition("publish"),
            Some(BranchCondition::Equals("development".to_string()))
        );
        assert_eq!(workflow.branch_condition("validate"), None);
        assert!(workflow.is_release_job("publish"));
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let mut def = WorkflowDefinition::from_yaml(DOC).unwrap();
        def.jobs[1].needs = vec!["lint".to_string()];
        assert_eq!(
            def.validate(),
            Err(WorkflowError::UnknownNeeds {
                job: "publish".to_string(),
                needs: "lint".to_string()
            })
        );
    }

    #[test]
    fn test_empty_axis_rejected() {
        let mut def = WorkflowDefinition::from_yaml(DOC).unwrap();
        def.jobs[0].matrix[1].values.clear();
        assert_eq!(
            def.validate(),
            Err(WorkflowError::EmptyAxis {
                job: "validate".to_string(),
                axis: "os".to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_axis_value_rejected() {
        let doc = DOC.replace(
            r#"["3.6", "3.7", "3.8", "3.9", "3.10"]"#,
            r#"["3.9", "3.9"]"#,
        );
        assert_eq!(
            Workflow::from_yaml(&doc).unwrap_err(),
            WorkflowError::DuplicateAxisValue {
                job: "validate".to_string(),
                axis: "python-version".to_string(),
                value: "3.9".to_string(),
            }
        );
    }

    #[test]
    fn test_unquoted_version_list_rejected() {
        let doc = DOC.replace(
            r#"["3.6", "3.7", "3.8", "3.9", "3.10"]"#,
            "[3.6, 3.7, 3.8, 3.9, 3.10]",
        );
        assert!(matches!(
            Workflow::from_yaml(&doc),
            Err(WorkflowError::UnquotedFloat { ref axis, .. }) if axis == "python-version"
        ));

        // Integers and booleans render exactly and are accepted
        let doc = DOC.replace(r#"["3.6", "3.7", "3.8", "3.9", "3.10"]"#, "[2, 3]");
        let workflow = Workflow::from_yaml(&doc).unwrap();
        assert_eq!(
            render_value(&workflow.template("validate").unwrap().matrix[0].values[1]),
            "3"
        );
    }

    #[test]
    fn test_job_branch_condition_mapping() {
        let doc = r#"
name: docs
jobs:
  - name: deploy-docs
    branch: { equals: main }
    steps: [{ name: s, run: "true" }]
  - name: preview
    branch: { glob: "feature/*" }
    steps: [{ name: s, run: "true" }]
  - name: lint
    branch: always
    steps: [{ name: s, run: "true" }]
"#;
        let workflow = Workflow::from_yaml(doc).unwrap();
        assert_eq!(
            workflow.branch_condition("deploy-docs"),
            Some(BranchCondition::Equals("main".to_string()))
        );
        assert_eq!(
            workflow.branch_condition("preview"),
            Some(BranchCondition::Glob("feature/*".to_string()))
        );
        assert_eq!(
            workflow.branch_condition("lint"),
            Some(BranchCondition::Always)
        );
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let mut def = WorkflowDefinition::from_yaml(DOC).unwrap();
        def.jobs[1].environment = Some("staging".to_string());
        assert!(matches!(
            def.validate(),
            Err(WorkflowError::UnknownEnvironment { .. })
        ));
    }

    #[test]
    fn test_malformed_document() {
        let err = Workflow::from_yaml("name: x\njobs: 12").unwrap_err();
        assert!(matches!(err, WorkflowError::Malformed(_)));
    }

    #[test]
    fn test_trigger_branch_conditions() {
        let workflow = Workflow::from_yaml(DOC).unwrap();
        let push = &workflow.triggers()[0];
        assert_eq!(
            push.branch_conditions(),
            vec![BranchCondition::Equals("development".to_string())]
        );
        let manual = &workflow.triggers()[2];
        assert_eq!(manual.branch_conditions(), vec![BranchCondition::Always]);
    }
}
