use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity label as reported by the scanned tool, normalized to lower case.
///
/// The set of accepted labels is configuration, not code; see
/// [`crate::parser::ParserConfig::severities`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Severity(String);

impl Severity {
    /// Returns `None` for labels that are empty after trimming.
    pub fn new(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.is_empty() {
            return None;
        }
        Some(Self(label.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
