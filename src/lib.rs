//! Run an external security-auditing CLI against a namespace and count its
//! findings by category and severity.
//!
//! ```no_run
//! let result = scanharness::scan("kubeaudit-tests", "kubeaudit", &["-n", "kubeaudit-tests"], 90)?;
//! assert_eq!(result.count, result.severities.values().sum::<u64>());
//! # Ok::<(), scanharness::error::ScanError>(())
//! ```

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit;
pub mod parser;
pub mod platform;
pub mod ui;

pub use crate::aggregate::{Aggregate, aggregate};
pub use crate::core::{ExitCodePolicy, Finding, ScanRequest, ScanResult, ScanState, Severity};
pub use crate::engine::{Engine, scan};
pub use crate::error::{ParseError, RunError, ScanError, ScanErrorKind};
pub use crate::parser::{ParsedOutput, ParserConfig, parse, parse_with};
