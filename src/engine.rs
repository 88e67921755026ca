use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use crate::aggregate::aggregate;
use crate::core::{ExitCodePolicy, MAX_TIMEOUT, ScanRequest, ScanResult, ScanState};
use crate::error::{RunError, ScanContext, ScanError, ScanErrorKind};
use crate::parser::{self, ParserConfig};
use crate::platform::{Invocation, ProcessRunner, RawOutput, SystemRunner};

const STDERR_TAIL_BYTES: usize = 512;

/// Runs scans: invoke the tool, parse its output, aggregate the findings.
///
/// Holds no per-scan state, so one engine can serve concurrent scans.
#[derive(Debug, Clone)]
pub struct Engine<R = SystemRunner> {
    runner: R,
    parser: ParserConfig,
}

impl Engine<SystemRunner> {
    pub fn system() -> Self {
        Self::new(SystemRunner)
    }
}

impl Default for Engine<SystemRunner> {
    fn default() -> Self {
        Self::system()
    }
}

impl<R: ProcessRunner> Engine<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            parser: ParserConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn parser_config(&self) -> &ParserConfig {
        &self.parser
    }

    pub fn scan(&self, req: &ScanRequest) -> Result<ScanResult, ScanError> {
        let context = ScanContext {
            namespace: req.namespace.clone(),
            tool: req.tool.clone(),
            timeout: req.timeout,
        };
        let fail = |kind: ScanErrorKind| ScanError::new(context.clone(), kind);

        let mut state = ScanState::NotStarted;
        validate(req).map_err(|msg| fail(ScanErrorKind::InvalidRequest(msg)))?;

        let invocation = Invocation {
            program: req.tool.clone(),
            args: req.tool_args(),
            env: req.env.clone(),
            working_dir: req.working_dir.clone(),
            timeout: req.timeout,
            max_output_bytes: req.max_output_bytes,
        };

        advance(&mut state, ScanState::Running, req);
        let output = match self.runner.run(&invocation) {
            Ok(output) => output,
            Err(err) => {
                let next = match err {
                    RunError::TimedOut { .. } => ScanState::TimedOut,
                    RunError::Launch { .. } | RunError::Wait { .. } => ScanState::LaunchFailed,
                };
                advance(&mut state, next, req);
                return Err(fail(err.into()));
            }
        };
        advance(&mut state, ScanState::Completed, req);

        if output.exit_code != 0 {
            match req.exit_policy {
                ExitCodePolicy::FailOnNonZero => {
                    return Err(fail(ScanErrorKind::NonZeroExit {
                        code: output.exit_code,
                        stderr: stderr_tail(&output),
                    }));
                }
                ExitCodePolicy::Parse => debug!(
                    namespace = %req.namespace,
                    exit_code = output.exit_code,
                    "tool exited non-zero, parsing output anyway"
                ),
            }
        }

        let parsed =
            parser::parse_with(&output.combined, &self.parser).map_err(|e| fail(e.into()))?;
        let agg = aggregate(&parsed.findings);

        info!(
            namespace = %req.namespace,
            tool = %req.tool,
            findings = agg.total(),
            skipped = parsed.diagnostics.len(),
            "scan completed"
        );

        Ok(ScanResult::new(
            agg,
            output.exit_code,
            parsed.diagnostics,
            u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
            now_rfc3339(),
        ))
    }
}

/// Scans `namespace` with `tool` using the real process runner and default
/// parser settings.
pub fn scan(
    namespace: &str,
    tool: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<ScanResult, ScanError> {
    let req = ScanRequest::new(namespace, tool, Duration::from_secs(timeout_secs))
        .args(args.iter().copied());
    Engine::system().scan(&req)
}

fn validate(req: &ScanRequest) -> Result<(), String> {
    let namespace = req.namespace.trim();
    if namespace.is_empty() {
        return Err("namespace が空です".to_string());
    }
    if namespace.chars().any(char::is_whitespace) {
        return Err(format!("namespace に空白は使えません: {:?}", req.namespace));
    }
    if req.tool.trim().is_empty() {
        return Err("ツールが指定されていません".to_string());
    }
    if req.timeout.is_zero() {
        return Err("timeout は正の値を指定してください".to_string());
    }
    if req.timeout > MAX_TIMEOUT {
        return Err(format!(
            "timeout が長すぎます（上限 {} 秒）: {} 秒",
            MAX_TIMEOUT.as_secs(),
            req.timeout.as_secs()
        ));
    }
    if req.max_output_bytes == 0 {
        return Err("max_output_bytes は正の値を指定してください".to_string());
    }
    Ok(())
}

fn advance(state: &mut ScanState, next: ScanState, req: &ScanRequest) {
    debug_assert!(state.can_advance_to(next), "{state} -> {next}");
    debug!(namespace = %req.namespace, tool = %req.tool, from = %state, to = %next, "scan state");
    *state = next;
}

fn stderr_tail(output: &RawOutput) -> String {
    let s = output.stderr.trim_end();
    if s.len() <= STDERR_TAIL_BYTES {
        return s.to_string();
    }
    let mut start = s.len() - STDERR_TAIL_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRunner {
        result: fn() -> Result<RawOutput, RunError>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl FakeRunner {
        fn new(result: fn() -> Result<RawOutput, RunError>) -> Self {
            Self {
                result,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Invocation> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ProcessRunner for FakeRunner {
        fn run(&self, invocation: &Invocation) -> Result<RawOutput, RunError> {
            self.seen.lock().unwrap().push(invocation.clone());
            (self.result)()
        }
    }

    fn output(exit_code: i32, combined: &str) -> RawOutput {
        RawOutput {
            exit_code,
            stdout: combined.to_string(),
            combined: combined.to_string(),
            ..RawOutput::default()
        }
    }

    fn request() -> ScanRequest {
        ScanRequest::new("kubeaudit-tests", "kubeaudit", Duration::from_secs(90))
            .args(["-n", "kubeaudit-tests"])
    }

    #[test]
    fn passes_namespace_and_timeout_to_the_runner() {
        let runner = FakeRunner::new(|| Ok(output(0, "")));
        let engine = Engine::new(&runner);
        let req = ScanRequest::new("ns-a", "kubeaudit", Duration::from_secs(5))
            .args(["all"])
            .env("KUBECONFIG", "/tmp/kc");
        engine.scan(&req).expect("scan");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "kubeaudit");
        assert_eq!(calls[0].args, vec!["-n", "ns-a", "all"]);
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
        assert_eq!(
            calls[0].env,
            vec![("KUBECONFIG".to_string(), "/tmp/kc".to_string())]
        );
    }

    #[test]
    fn invalid_requests_never_reach_the_runner() {
        let runner = FakeRunner::new(|| Ok(output(0, "")));
        let engine = Engine::new(&runner);

        for req in [
            ScanRequest::new("", "kubeaudit", Duration::from_secs(5)),
            ScanRequest::new("a b", "kubeaudit", Duration::from_secs(5)),
            ScanRequest::new("ns", " ", Duration::from_secs(5)),
            ScanRequest::new("ns", "kubeaudit", Duration::ZERO),
            ScanRequest::new("ns", "kubeaudit", Duration::from_secs(u64::MAX)),
            ScanRequest::new("ns", "kubeaudit", MAX_TIMEOUT + Duration::from_secs(1)),
            ScanRequest::new("ns", "kubeaudit", Duration::from_secs(5)).max_output_bytes(0),
        ] {
            let err = engine.scan(&req).unwrap_err();
            assert!(
                matches!(err.kind(), ScanErrorKind::InvalidRequest(_)),
                "{err:?}"
            );
            assert_eq!(err.state(), ScanState::NotStarted);
        }
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn non_zero_exit_is_parsed_by_default() {
        let runner = FakeRunner::new(|| {
            Ok(output(
                2,
                "{\"category\":\"Non Root User Not Enforced\",\"severity\":\"medium\"}\n",
            ))
        });
        let result = Engine::new(&runner).scan(&request()).expect("scan");
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.category("Non Root User Not Enforced"), 1);
        assert_eq!(result.severity("medium"), 1);
    }

    #[test]
    fn strict_policy_turns_non_zero_exit_into_an_error() {
        let runner = FakeRunner::new(|| {
            let mut out = output(1, "{\"category\":\"X\",\"severity\":\"low\"}\n");
            out.stderr = "error: forbidden\n".to_string();
            Ok(out)
        });
        let req = request().exit_policy(ExitCodePolicy::FailOnNonZero);
        let err = Engine::new(&runner).scan(&req).unwrap_err();
        match err.kind() {
            ScanErrorKind::NonZeroExit { code, stderr } => {
                assert_eq!(*code, 1);
                assert_eq!(stderr, "error: forbidden");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(err.context.namespace, "kubeaudit-tests");
    }

    #[test]
    fn timeout_yields_no_result() {
        let runner = FakeRunner::new(|| {
            Err(RunError::TimedOut {
                program: "kubeaudit".to_string(),
                timeout: Duration::from_secs(90),
                captured_bytes: 4096,
            })
        });
        let err = Engine::new(&runner).scan(&request()).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.state(), ScanState::TimedOut);
        assert_eq!(err.context.tool, "kubeaudit");
        assert_eq!(err.context.timeout, Duration::from_secs(90));
    }

    #[test]
    fn launch_failure_is_propagated() {
        let runner = FakeRunner::new(|| {
            Err(RunError::Launch {
                program: "kubeaudit".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let err = Engine::new(&runner).scan(&request()).unwrap_err();
        assert!(err.is_launch_failure());
        assert_eq!(err.state(), ScanState::LaunchFailed);
    }

    #[test]
    fn unparsable_output_is_an_error() {
        let runner = FakeRunner::new(|| Ok(output(2, "panic: nil pointer dereference\n")));
        let err = Engine::new(&runner).scan(&request()).unwrap_err();
        assert!(err.is_unparsable());
    }

    #[test]
    fn skipped_records_are_reported_not_counted() {
        let runner = FakeRunner::new(|| {
            Ok(output(
                0,
                "{\"category\":\"A\",\"severity\":\"low\"}\n{\"category\":\"B\",\"severity\":\"bogus\"}\n",
            ))
        });
        let result = Engine::new(&runner).scan(&request()).expect("scan");
        assert_eq!(result.count, 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].line, 2);
    }

    #[test]
    fn custom_parser_config_is_used() {
        let runner = FakeRunner::new(|| {
            Ok(output(
                0,
                "{\"AuditResultName\":\"PrivilegedTrue\",\"level\":\"error\"}\n",
            ))
        });
        let engine = Engine::new(&runner).with_parser(ParserConfig {
            category_key: "AuditResultName".to_string(),
            severity_key: "level".to_string(),
            severities: vec!["error".to_string(), "warning".to_string()],
        });
        assert_eq!(engine.parser_config().category_key, "AuditResultName");
        assert_eq!(Engine::new(&runner).parser_config(), &ParserConfig::default());

        let result = engine.scan(&request()).expect("scan");
        assert_eq!(result.category("PrivilegedTrue"), 1);
        assert_eq!(result.severity("error"), 1);
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let mut out = output(1, "");
        out.stderr = format!("{}END\n", "x".repeat(2000));
        let tail = stderr_tail(&out);
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("END"));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }
}
