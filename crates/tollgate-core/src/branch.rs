//! Branch conditions evaluated by triggers and environment gates.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A condition on a branch name.
///
/// Serialized as a single-key mapping, e.g. `{ equals: development }` or
/// `{ glob: "release/*" }`; the bare string `always` is also accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConditionRepr", into = "ConditionRepr")]
pub enum BranchCondition {
    Always,
    Equals(String),
    Glob(String),
}

/// Document form of a [`BranchCondition`].
#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
enum ConditionRepr {
    /// Only `always`.
    Keyword(String),
    Equals { equals: String },
    Glob { glob: String },
}

impl TryFrom<ConditionRepr> for BranchCondition {
    type Error = String;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        match repr {
            ConditionRepr::Keyword(word) if word == "always" => Ok(BranchCondition::Always),
            ConditionRepr::Keyword(word) => Err(format!(
                "unknown branch condition '{}', expected always, {{ equals: .. }} or {{ glob: .. }}",
                word
            )),
            ConditionRepr::Equals { equals } => Ok(BranchCondition::Equals(equals)),
            ConditionRepr::Glob { glob } => Ok(BranchCondition::Glob(glob)),
        }
    }
}

impl From<BranchCondition> for ConditionRepr {
    fn from(condition: BranchCondition) -> Self {
        match condition {
            BranchCondition::Always => ConditionRepr::Keyword("always".to_string()),
            BranchCondition::Equals(equals) => ConditionRepr::Equals { equals },
            BranchCondition::Glob(glob) => ConditionRepr::Glob { glob },
        }
    }
}

impl JsonSchema for BranchCondition {
    fn schema_name() -> String {
        "BranchCondition".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        ConditionRepr::json_schema(generator)
    }
}

impl BranchCondition {
    pub fn evaluate(&self, branch: &str) -> bool {
        match self {
            BranchCondition::Always => true,
            BranchCondition::Equals(expected) => expected == branch,
            BranchCondition::Glob(pattern) => glob_match(pattern, branch),
        }
    }
}

impl std::fmt::Display for BranchCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchCondition::Always => write!(f, "any branch"),
            BranchCondition::Equals(b) => write!(f, "branch == {}", b),
            BranchCondition::Glob(p) => write!(f, "branch matches {}", p),
        }
    }
}

/// Match a branch against a pattern supporting `*`, `prefix/*` and `prefix/**`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(&format!("{}/", prefix));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if let Some(rest) = text.strip_prefix(&prefix_slash) {
            return !rest.is_empty() && !rest.contains('/');
        }
        return false;
    }
    if let Some((head, tail)) = pattern.split_once('*')
        && !tail.contains('*')
    {
        return text.len() >= head.len() + tail.len()
            && text.starts_with(head)
            && text.ends_with(tail);
    }
    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_is_exact() {
        let cond = BranchCondition::Equals("development".to_string());
        assert!(cond.evaluate("development"));
        assert!(!cond.evaluate("development-old"));
        assert!(!cond.evaluate("feature/x"));
    }

    #[test]
    fn test_glob_patterns() {
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(!glob_match("release/**", "releases"));
        assert!(glob_match("v*-rc", "v1.2-rc"));
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "master"));
    }

    #[test]
    fn test_deserialize_tagged() {
        let cond: BranchCondition = serde_yaml::from_str("equals: development").unwrap();
        assert_eq!(cond, BranchCondition::Equals("development".to_string()));

        let cond: BranchCondition = serde_yaml::from_str("{ glob: \"release/*\" }").unwrap();
        assert_eq!(cond, BranchCondition::Glob("release/*".to_string()));

        let cond: BranchCondition = serde_yaml::from_str("always").unwrap();
        assert_eq!(cond, BranchCondition::Always);
    }

    #[test]
    fn test_unknown_keyword_is_rejected() {
        assert!(serde_yaml::from_str::<BranchCondition>("never").is_err());
        assert!(serde_yaml::from_str::<BranchCondition>("{ matches: main }").is_err());
    }

    #[test]
    fn test_serializes_as_mapping() {
        let json = serde_json::to_value(BranchCondition::Equals("main".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({ "equals": "main" }));

        let json = serde_json::to_value(BranchCondition::Always).unwrap();
        assert_eq!(json, serde_json::json!("always"));
    }
}
