use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_EXCERPT_CHARS: usize = 120;

/// Why a record that looked like a finding was not counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum SkipReason {
    MissingCategory,
    MissingSeverity,
    UnknownSeverity(String),
    MalformedRecord,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingCategory => f.write_str("カテゴリがありません"),
            SkipReason::MissingSeverity => f.write_str("重大度がありません"),
            SkipReason::UnknownSeverity(label) => write!(f, "未知の重大度です: {label}"),
            SkipReason::MalformedRecord => f.write_str("レコードの形式が不正です"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: usize,
    pub reason: SkipReason,
    pub excerpt: String,
}

impl Diagnostic {
    pub fn new(line: usize, reason: SkipReason, source: &str) -> Self {
        Self {
            line,
            reason,
            excerpt: excerpt(source),
        }
    }
}

pub(crate) fn excerpt(s: &str) -> String {
    let s = s.trim();
    if s.chars().count() <= MAX_EXCERPT_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_EXCERPT_CHARS - 3).collect();
    out.push_str("...");
    out
}
