//! Turns raw scanner output into findings.
//!
//! Accepted record encodings, one per line:
//!
//! - a JSON object (`{"category": "...", "severity": "low", ...}`),
//! - a JSON array of such objects (several findings on one line),
//! - logfmt pairs (`category="..." severity=low`).
//!
//! A line opening a JSON value that does not close on the same line is read
//! as one document spanning the following lines (pretty-printed
//! `findings.json`); its records report the line the document starts on.
//!
//! A record is a finding candidate when it carries the category key or the
//! severity key. JSON objects and logfmt lines with `level`/`msg` but neither
//! key are log lines and are ignored. A JSON-looking line that names either
//! key but does not parse is skipped as malformed. Blank lines, separators
//! and prose are noise.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Diagnostic, Finding, Severity, SkipReason};
use crate::error::ParseError;

mod json;
mod logfmt;

type Fields = Vec<(String, String)>;

const NAME_KEYS: &[&str] = &["name", "AuditResultName", "rule"];
const LOG_KEYS: &[&str] = &["level", "msg", "time"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    pub category_key: String,
    pub severity_key: String,
    /// Accepted severity labels, compared case-insensitively. Empty accepts any label.
    pub severities: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            category_key: "category".to_string(),
            severity_key: "severity".to_string(),
            severities: ["informational", "low", "medium", "high", "critical"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl ParserConfig {
    fn accepts(&self, severity: &Severity) -> bool {
        self.severities.is_empty()
            || self
                .severities
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(severity.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    /// In emission order.
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn parse(raw: &str) -> Result<ParsedOutput, ParseError> {
    parse_with(raw, &ParserConfig::default())
}

pub fn parse_with(raw: &str, cfg: &ParserConfig) -> Result<ParsedOutput, ParseError> {
    let mut out = ParsedOutput::default();
    let mut recognized = false;
    let mut meaningful = 0usize;
    let mut first_unmatched: Option<&str> = None;
    // Byte offset where line scanning resumes after a multi-line document.
    let mut resume_at = 0usize;

    let mut offset = 0usize;
    for (idx, chunk) in raw.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += chunk.len();
        if start < resume_at {
            continue;
        }
        let trimmed = chunk.trim();
        if is_noise(trimmed) {
            continue;
        }
        meaningful += 1;
        let line = idx + 1;

        match classify(trimmed, cfg) {
            Line::Records(records) => {
                recognized = true;
                for record in records {
                    out.accept(record, line, trimmed, cfg);
                }
            }
            Line::Log => recognized = true,
            Line::Unmatched if opens_json(trimmed) => {
                let doc_start = start + (chunk.len() - chunk.trim_start().len());
                if let Some((doc, consumed)) = json::parse_document(&raw[doc_start..]) {
                    recognized = true;
                    resume_at = doc_start + consumed;
                    for record in records_from_json(doc, cfg) {
                        out.accept(record, line, trimmed, cfg);
                    }
                } else if mentions_keys(trimmed, cfg) {
                    recognized = true;
                    out.skip(line, SkipReason::MalformedRecord, trimmed);
                } else {
                    first_unmatched.get_or_insert(trimmed);
                }
            }
            Line::Unmatched => {
                first_unmatched.get_or_insert(trimmed);
            }
        }
    }

    if recognized || meaningful == 0 {
        debug!(
            findings = out.findings.len(),
            skipped = out.diagnostics.len(),
            "parsed scanner output"
        );
        return Ok(out);
    }

    Err(ParseError::UnparsableOutput {
        lines: meaningful,
        sample: crate::core::diagnostic_excerpt(first_unmatched.unwrap_or_default()),
    })
}

/// Blank lines and decorative separators such as `-----` or `=== * ===`.
pub fn is_noise(line: &str) -> bool {
    line.chars().all(|c| {
        c.is_whitespace() || matches!(c, '-' | '=' | '*' | '_' | '#' | '~' | '+' | '|' | '─' | '━' | '═')
    })
}

enum Line {
    Records(Vec<Candidate>),
    Log,
    Unmatched,
}

enum Candidate {
    Record(Fields),
    Malformed,
}

fn classify(line: &str, cfg: &ParserConfig) -> Line {
    if line.starts_with('{') || line.starts_with('[') {
        if let Some(doc) = json::parse_line(line) {
            let records = records_from_json(doc, cfg);
            return if records.is_empty() {
                Line::Log
            } else {
                Line::Records(records)
            };
        }
    }

    if let Some(fields) = logfmt::parse_pairs(line) {
        if is_candidate(&fields, cfg) {
            return Line::Records(vec![Candidate::Record(fields)]);
        }
        if fields.iter().any(|(k, _)| LOG_KEYS.contains(&k.as_str())) {
            return Line::Log;
        }
    }

    Line::Unmatched
}

fn records_from_json(doc: json::JsonLine, cfg: &ParserConfig) -> Vec<Candidate> {
    match doc {
        json::JsonLine::Object(fields) => {
            if is_candidate(&fields, cfg) {
                vec![Candidate::Record(fields)]
            } else {
                Vec::new()
            }
        }
        json::JsonLine::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Some(fields) if is_candidate(&fields, cfg) => Some(Candidate::Record(fields)),
                Some(_) => None,
                None => Some(Candidate::Malformed),
            })
            .collect(),
    }
}

fn opens_json(line: &str) -> bool {
    line.starts_with('{') || line.starts_with('[')
}

/// Whether a JSON-looking line names the category or severity key.
fn mentions_keys(line: &str, cfg: &ParserConfig) -> bool {
    [&cfg.category_key, &cfg.severity_key]
        .iter()
        .any(|key| line.contains(&format!("\"{key}\"")))
}

fn is_candidate(fields: &Fields, cfg: &ParserConfig) -> bool {
    fields
        .iter()
        .any(|(k, _)| *k == cfg.category_key || *k == cfg.severity_key)
}

fn field<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn resource(fields: &Fields) -> Option<String> {
    match (field(fields, "ResourceKind"), field(fields, "ResourceName")) {
        (Some(kind), Some(name)) => Some(format!("{kind}/{name}")),
        (None, Some(name)) => Some(name.to_string()),
        _ => field(fields, "location").map(str::to_string),
    }
}

impl ParsedOutput {
    fn accept(&mut self, candidate: Candidate, line: usize, source: &str, cfg: &ParserConfig) {
        let fields = match candidate {
            Candidate::Record(fields) => fields,
            Candidate::Malformed => {
                self.skip(line, SkipReason::MalformedRecord, source);
                return;
            }
        };

        let Some(category) = field(&fields, &cfg.category_key) else {
            self.skip(line, SkipReason::MissingCategory, source);
            return;
        };
        let Some(severity) = field(&fields, &cfg.severity_key).and_then(Severity::new) else {
            self.skip(line, SkipReason::MissingSeverity, source);
            return;
        };
        if !cfg.accepts(&severity) {
            self.skip(
                line,
                SkipReason::UnknownSeverity(severity.as_str().to_string()),
                source,
            );
            return;
        }

        self.findings.push(Finding {
            category: category.to_string(),
            severity,
            name: NAME_KEYS
                .iter()
                .filter(|k| **k != cfg.category_key)
                .find_map(|k| field(&fields, k))
                .map(str::to_string),
            resource: resource(&fields),
            line,
        });
    }

    fn skip(&mut self, line: usize, reason: SkipReason, source: &str) {
        warn!(line, reason = %reason, "skipping finding record");
        self.diagnostics.push(Diagnostic::new(line, reason, source));
    }
}
