mod diagnostic;
mod finding;
mod request;
mod result;
mod severity;
mod state;

pub use diagnostic::{Diagnostic, SkipReason};
pub(crate) use diagnostic::excerpt as diagnostic_excerpt;
pub use finding::Finding;
pub use request::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_NAMESPACE_FLAG, ExitCodePolicy, MAX_TIMEOUT, ScanRequest,
};
pub use result::ScanResult;
pub use severity::Severity;
pub use state::ScanState;
