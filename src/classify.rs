//! Advisory line classification. Affects display color only; the text of a
//! line is never touched.

use serde::{Deserialize, Serialize};

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Error,
    Warning,
    Info,
    Plain,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Error => write!(f, "error"),
            Classification::Warning => write!(f, "warning"),
            Classification::Info => write!(f, "info"),
            Classification::Plain => write!(f, "plain"),
        }
    }
}

/// Case-insensitive substring lists per severity. Stored in the config file
/// so users can tune them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationPolicy {
    pub error: Vec<String>,
    pub warning: Vec<String>,
    pub info: Vec<String>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            error: vec![
                "error".to_string(),
                "exception".to_string(),
                "traceback".to_string(),
                "failed".to_string(),
            ],
            warning: vec!["warn".to_string()],
            info: vec!["info".to_string()],
        }
    }
}

impl ClassificationPolicy {
    /// Classify one line. Anything on stderr is an error regardless of
    /// content.
    pub fn classify(&self, text: &str, stream: Stream) -> Classification {
        if stream == Stream::Stderr {
            return Classification::Error;
        }
        let lowered = text.to_lowercase();
        if matches_any(&lowered, &self.error) {
            Classification::Error
        } else if matches_any(&lowered, &self.warning) {
            Classification::Warning
        } else if matches_any(&lowered, &self.info) {
            Classification::Info
        } else {
            Classification::Plain
        }
    }
}

fn matches_any(lowered: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .filter(|n| !n.is_empty())
        .any(|n| lowered.contains(&n.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_forces_error() {
        let policy = ClassificationPolicy::default();
        assert_eq!(policy.classify("all good", Stream::Stderr), Classification::Error);
    }

    #[test]
    fn test_substring_tiers() {
        let policy = ClassificationPolicy::default();
        assert_eq!(policy.classify("Traceback (most recent call last):", Stream::Stdout), Classification::Error);
        assert_eq!(policy.classify("ERROR: disk full", Stream::Stdout), Classification::Error);
        assert_eq!(policy.classify("DeprecationWarning: old api", Stream::Stdout), Classification::Warning);
        assert_eq!(policy.classify("[INFO] starting", Stream::Stdout), Classification::Info);
        assert_eq!(policy.classify("hello", Stream::Stdout), Classification::Plain);
    }

    #[test]
    fn test_error_beats_warning() {
        let policy = ClassificationPolicy::default();
        assert_eq!(policy.classify("warning: error count 3", Stream::Stdout), Classification::Error);
    }

    #[test]
    fn test_custom_policy() {
        let policy = ClassificationPolicy {
            error: vec!["FATAL".to_string()],
            warning: vec![],
            info: vec![String::new()],
        };
        assert_eq!(policy.classify("fatal: boom", Stream::Stdout), Classification::Error);
        assert_eq!(policy.classify("error: not listed", Stream::Stdout), Classification::Plain);
    }
}
