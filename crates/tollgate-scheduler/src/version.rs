//! Release-candidate version stamping.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static VERSION_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(\s*__version__\s*=\s*)(["'])([^"']*)(["'])"#)
        .expect("valid version assignment regex")
});

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Malformed base version '{0}': expected at least two dot-separated non-negative integers")]
    Malformed(String),
    #[error("No version found in {0}")]
    NotFound(PathBuf),
    #[error("Version file IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A release-candidate version: the base version plus an `RC` timestamp
/// suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionStamp {
    pub base: Vec<u64>,
    pub suffix: String,
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base: Vec<String> = self.base.iter().map(u64::to_string).collect();
        write!(f, "{}.{}", base.join("."), self.suffix)
    }
}

/// Compute the release-candidate version for `base` at `now`.
///
/// Two stamps for the same base within the same second are identical.
pub fn stamp(base: &str, now: DateTime<Utc>) -> Result<VersionStamp, VersionError> {
    let base = parse_base(base)?;
    Ok(VersionStamp {
        base,
        suffix: format!("RC{}", now.format(STAMP_FORMAT)),
    })
}

fn parse_base(base: &str) -> Result<Vec<u64>, VersionError> {
    let malformed = || VersionError::Malformed(base.to_string());
    let parts: Vec<&str> = base.trim().split('.').collect();
    if parts.len() < 2 {
        return Err(malformed());
    }
    parts
        .iter()
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            p.parse::<u64>().map_err(|_| malformed())
        })
        .collect()
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A file carrying the package version, either as a
/// `__version__ = "x.y.z"` assignment or as the bare version.
#[derive(Debug, Clone)]
pub struct VersionFile {
    path: PathBuf,
}

impl VersionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<String, VersionError> {
        let content = std::fs::read_to_string(&self.path)?;
        if let Some(caps) = VERSION_ASSIGNMENT.captures(&content) {
            return Ok(caps[3].to_string());
        }

        let bare = content.trim();
        if bare.is_empty() || bare.contains(char::is_whitespace) {
            return Err(VersionError::NotFound(self.path.clone()));
        }
        Ok(bare.to_string())
    }

    /// Write the stamped version back, keeping the rest of the file.
    pub fn write(&self, version: &VersionStamp) -> Result<(), VersionError> {
        let content = std::fs::read_to_string(&self.path)?;
        let rendered = version.to_string();

        let updated = if VERSION_ASSIGNMENT.is_match(&content) {
            VERSION_ASSIGNMENT
                .replacen(&content, 1, |caps: &regex::Captures| {
                    format!("{}{}{}{}", &caps[1], &caps[2], rendered, &caps[4])
                })
                .into_owned()
        } else {
            format!("{}\n", rendered)
        };

        std::fs::write(&self.path, updated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, secs).unwrap()
    }

    #[test]
    fn test_stamp_format() {
        let stamp = stamp("2.0", at(7)).unwrap();
        assert_eq!(stamp.to_string(), "2.0.RC20240309140507");

        let pattern = Regex::new(r"^2\.0\.RC\d{14}$").unwrap();
        assert!(pattern.is_match(&stamp.to_string()));
    }

    #[test]
    fn test_stamps_differ_by_second() {
        assert_ne!(stamp("1.2", at(1)).unwrap(), stamp("1.2", at(2)).unwrap());
        assert_eq!(stamp("1.2", at(1)).unwrap(), stamp("1.2", at(1)).unwrap());
    }

    #[test]
    fn test_malformed_base() {
        for bad in ["2", "", "2.x", "1..2", "-1.0", "v1.2", "1.2-beta"] {
            assert!(
                matches!(stamp(bad, at(0)), Err(VersionError::Malformed(_))),
                "{bad} should be rejected"
            );
        }
        assert!(stamp("3.6.1.0", at(0)).is_ok());
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock(at(30));
        assert_eq!(clock.now(), at(30));
    }

    #[test]
    fn test_version_file_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("__init__.py");
        std::fs::write(&path, "\"\"\"Package.\"\"\"\n__version__ = \"3.6.4\"\n").unwrap();

        let file = VersionFile::new(&path);
        assert_eq!(file.read().unwrap(), "3.6.4");

        let stamped = stamp("3.6.4", at(0)).unwrap();
        file.write(&stamped).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "\"\"\"Package.\"\"\"\n__version__ = \"3.6.4.RC20240309140500\"\n"
        );
    }

    #[test]
    fn test_version_file_bare() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VERSION");
        std::fs::write(&path, "1.4\n").unwrap();

        let file = VersionFile::new(&path);
        assert_eq!(file.read().unwrap(), "1.4");
        file.write(&stamp("1.4", at(9)).unwrap()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1.4.RC20240309140509\n");
    }

    #[test]
    fn test_version_file_without_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.py");
        std::fs::write(&path, "import os\nprint(os.name)\n").unwrap();
        assert!(matches!(
            VersionFile::new(&path).read(),
            Err(VersionError::NotFound(_))
        ));
    }
}
