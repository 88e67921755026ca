use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::Finding;

/// Finding counts keyed by category and by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub categories: BTreeMap<String, u64>,
    pub severities: BTreeMap<String, u64>,
}

impl Aggregate {
    pub fn add(&mut self, finding: &Finding) {
        *self.categories.entry(finding.category.clone()).or_insert(0) += 1;
        *self
            .severities
            .entry(finding.severity.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &Aggregate) {
        for (label, n) in &other.categories {
            *self.categories.entry(label.clone()).or_insert(0) += n;
        }
        for (label, n) in &other.severities {
            *self.severities.entry(label.clone()).or_insert(0) += n;
        }
    }

    /// Number of findings counted. Both maps always sum to this value.
    pub fn total(&self) -> u64 {
        self.categories.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.severities.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        self.categories.values().sum::<u64>() == self.severities.values().sum::<u64>()
    }
}

pub fn aggregate<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Aggregate {
    let mut agg = Aggregate::default();
    for finding in findings {
        agg.add(finding);
    }
    agg
}
