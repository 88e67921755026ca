use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregate::Aggregate;
use crate::core::Diagnostic;

/// Outcome of a successful scan.
///
/// `categories` and `severities` compare by key/value set, so they can be
/// checked directly against expected fixtures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub categories: BTreeMap<String, u64>,
    pub severities: BTreeMap<String, u64>,
    pub count: u64,
    pub exit_code: i32,
    pub skipped: Vec<Diagnostic>,
    pub duration_ms: u64,
    pub finished_at: String,
}

impl ScanResult {
    pub fn new(
        aggregate: Aggregate,
        exit_code: i32,
        skipped: Vec<Diagnostic>,
        duration_ms: u64,
        finished_at: String,
    ) -> Self {
        let count = aggregate.total();
        Self {
            categories: aggregate.categories,
            severities: aggregate.severities,
            count,
            exit_code,
            skipped,
            duration_ms,
            finished_at,
        }
    }

    pub fn category(&self, label: &str) -> u64 {
        self.categories.get(label).copied().unwrap_or(0)
    }

    pub fn severity(&self, label: &str) -> u64 {
        self.severities.get(label).copied().unwrap_or(0)
    }
}
