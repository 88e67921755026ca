use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_NAMESPACE_FLAG: &str = "-n";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;
/// Longest accepted scan timeout (7 days).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What a non-zero exit status of the scanned tool means to the harness.
///
/// Many scanners exit non-zero to say "issues found", so the default keeps
/// parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitCodePolicy {
    #[default]
    Parse,
    FailOnNonZero,
}

impl ExitCodePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExitCodePolicy::Parse => "parse",
            ExitCodePolicy::FailOnNonZero => "fail-on-nonzero",
        }
    }
}

impl fmt::Display for ExitCodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitCodePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parse" => Ok(ExitCodePolicy::Parse),
            "fail-on-nonzero" | "fail" => Ok(ExitCodePolicy::FailOnNonZero),
            other => Err(format!(
                "終了コードポリシーが不正です: {other}（parse|fail-on-nonzero を指定してください）"
            )),
        }
    }
}

/// Input of one scan. Built by the caller, read-only to the harness.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub namespace: String,
    pub tool: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub namespace_flag: String,
    pub exit_policy: ExitCodePolicy,
    pub max_output_bytes: usize,
}

impl ScanRequest {
    pub fn new(namespace: impl Into<String>, tool: impl Into<String>, timeout: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            tool: tool.into(),
            args: Vec::new(),
            timeout,
            env: Vec::new(),
            working_dir: None,
            namespace_flag: DEFAULT_NAMESPACE_FLAG.to_string(),
            exit_policy: ExitCodePolicy::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn namespace_flag(mut self, flag: impl Into<String>) -> Self {
        self.namespace_flag = flag.into();
        self
    }

    pub fn exit_policy(mut self, policy: ExitCodePolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Argument list actually passed to the tool.
    ///
    /// `<namespace_flag> <namespace>` is prepended unless the caller already
    /// selects a namespace, or the flag is empty.
    pub fn tool_args(&self) -> Vec<String> {
        let flag = self.namespace_flag.trim();
        if flag.is_empty() || self.selects_namespace() {
            return self.args.clone();
        }
        let mut args = Vec::with_capacity(self.args.len() + 2);
        args.push(flag.to_string());
        args.push(self.namespace.clone());
        args.extend(self.args.iter().cloned());
        args
    }

    fn selects_namespace(&self) -> bool {
        let flag = self.namespace_flag.trim();
        self.args.iter().any(|a| {
            a == flag
                || a == "--namespace"
                || a.starts_with("--namespace=")
                || (!flag.is_empty() && a.starts_with(&format!("{flag}=")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ScanRequest {
        ScanRequest::new("kubeaudit-tests", "kubeaudit", Duration::from_secs(90))
    }

    #[test]
    fn namespace_flag_is_prepended_when_missing() {
        let r = req().args(["all", "-p", "json"]);
        assert_eq!(
            r.tool_args(),
            vec!["-n", "kubeaudit-tests", "all", "-p", "json"]
        );
    }

    #[test]
    fn explicit_namespace_selection_is_left_alone() {
        let r = req().args(["-n", "kubeaudit-tests"]);
        assert_eq!(r.tool_args(), vec!["-n", "kubeaudit-tests"]);

        let r = req().args(["all", "--namespace=other"]);
        assert_eq!(r.tool_args(), vec!["all", "--namespace=other"]);
    }

    #[test]
    fn empty_flag_disables_injection() {
        let r = req().namespace_flag("").args(["scan"]);
        assert_eq!(r.tool_args(), vec!["scan"]);
    }

    #[test]
    fn custom_flag_is_used() {
        let r = req().namespace_flag("--ns").args(["audit"]);
        assert_eq!(r.tool_args(), vec!["--ns", "kubeaudit-tests", "audit"]);
    }

    #[test]
    fn exit_policy_parses_aliases() {
        assert_eq!("parse".parse::<ExitCodePolicy>(), Ok(ExitCodePolicy::Parse));
        assert_eq!(
            " FAIL ".parse::<ExitCodePolicy>(),
            Ok(ExitCodePolicy::FailOnNonZero)
        );
        assert!("never".parse::<ExitCodePolicy>().is_err());
    }
}
