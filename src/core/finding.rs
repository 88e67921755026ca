use crate::core::Severity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub line: usize,
}

impl Finding {
    pub fn new(category: impl Into<String>, severity: Severity) -> Self {
        Self {
            category: category.into(),
            severity,
            name: None,
            resource: None,
            line: 0,
        }
    }
}
