use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::core::MAX_TIMEOUT;
use crate::error::RunError;

#[cfg(unix)]
mod unix;

/// Grace period for reader threads once the process tree has been killed.
const READER_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout,
            max_output_bytes: crate::core::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn cmdline(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Lines of both streams in arrival order.
    pub combined: String,
    pub truncated: bool,
    pub elapsed: Duration,
}

/// Runs an external program to completion or until its deadline.
///
/// A non-zero exit is not an error here; it is reported in
/// [`RawOutput::exit_code`].
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<RawOutput, RunError>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn run(&self, invocation: &Invocation) -> Result<RawOutput, RunError> {
        (**self).run(invocation)
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for Box<R> {
    fn run(&self, invocation: &Invocation) -> Result<RawOutput, RunError> {
        (**self).run(invocation)
    }
}

/// [`ProcessRunner`] backed by real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, inv: &Invocation) -> Result<RawOutput, RunError> {
        let timeout = inv.timeout.min(MAX_TIMEOUT);
        let started = Instant::now();
        let deadline = started + timeout;

        let mut command = Command::new(&inv.program);
        command
            .args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (k, v) in &inv.env {
            command.env(k, v);
        }
        if let Some(dir) = &inv.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| RunError::Launch {
            program: inv.program.clone(),
            source,
        })?;
        debug!(pid = child.id(), cmd = %inv.cmdline(), "process started");

        let capture = Arc::new(Mutex::new(Capture::new(inv.max_output_bytes)));
        let (done_tx, done_rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Stream::Stdout, &capture, done_tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Stream::Stderr, &capture, done_tx.clone()));
        }
        drop(done_tx);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate(&mut child);
                finish_readers(readers, &done_rx, Instant::now() + READER_GRACE);
                return Err(timed_out(inv, &capture));
            }
            Err(source) => {
                terminate(&mut child);
                finish_readers(readers, &done_rx, Instant::now() + READER_GRACE);
                return Err(RunError::Wait {
                    program: inv.program.clone(),
                    source,
                });
            }
        };

        // Descendants can keep the pipes open after the child itself exits.
        if !finish_readers(readers, &done_rx, deadline) {
            debug!(program = %inv.program, "output still open at deadline, killing process group");
            kill_tree(&mut child);
            return Err(timed_out(inv, &capture));
        }

        let capture = std::mem::take(&mut *lock(&capture));
        if capture.truncated {
            warn!(
                program = %inv.program,
                limit = inv.max_output_bytes,
                seen = capture.seen,
                "output exceeded capture limit and was truncated"
            );
        }

        let exit_code = status.code().unwrap_or(-1);
        let elapsed = started.elapsed();
        debug!(program = %inv.program, exit_code, ?elapsed, "process finished");

        Ok(RawOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
            combined: String::from_utf8_lossy(&capture.combined).into_owned(),
            truncated: capture.truncated,
            elapsed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    const fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

#[derive(Debug, Default)]
struct Capture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    /// Incomplete trailing line per stream, never longer than `limit`.
    pending: [Vec<u8>; 2],
    stored: usize,
    seen: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Stores whole lines only; once the limit is hit the rest is counted and dropped.
    fn feed(&mut self, stream: Stream, chunk: &[u8]) {
        self.seen = self.seen.saturating_add(chunk.len());
        if self.truncated {
            return;
        }

        for piece in chunk.split_inclusive(|b| *b == b'\n') {
            let pending = &mut self.pending[stream.index()];
            pending.extend_from_slice(piece);
            if self.stored.saturating_add(pending.len()) > self.limit {
                self.truncated = true;
                self.pending = Default::default();
                return;
            }
            if piece.ends_with(b"\n") {
                let line = std::mem::take(pending);
                self.commit(stream, &line);
            }
        }
    }

    /// Flushes an unterminated last line at EOF.
    fn finish(&mut self, stream: Stream) {
        let line = std::mem::take(&mut self.pending[stream.index()]);
        if !line.is_empty() && !self.truncated {
            self.commit(stream, &line);
        }
    }

    fn commit(&mut self, stream: Stream, line: &[u8]) {
        self.stored += line.len();
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(line),
            Stream::Stderr => self.stderr.extend_from_slice(line),
        }
        self.combined.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            self.combined.push(b'\n');
        }
    }
}

fn lock(capture: &Mutex<Capture>) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader<R: Read + Send + 'static>(
    mut stream: R,
    kind: Stream,
    capture: &Arc<Mutex<Capture>>,
    done: Sender<()>,
) -> JoinHandle<()> {
    let capture = Arc::clone(capture);
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => lock(&capture).feed(kind, &buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(stream = ?kind, error = %err, "read failed");
                    break;
                }
            }
        }
        lock(&capture).finish(kind);
        let _ = done.send(());
    })
}

/// Waits for every reader to hit EOF before `deadline`. Returns `false` if any
/// is still open; those threads are detached.
fn finish_readers(readers: Vec<JoinHandle<()>>, done: &Receiver<()>, deadline: Instant) -> bool {
    let mut pending = readers.len();
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(()) => pending -= 1,
            Err(RecvTimeoutError::Timeout) => return false,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
    true
}

fn terminate(child: &mut Child) {
    kill_tree(child);
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    unix::kill_tree(child);
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn timed_out(inv: &Invocation, capture: &Arc<Mutex<Capture>>) -> RunError {
    let captured_bytes = lock(capture).seen;
    RunError::TimedOut {
        program: inv.program.clone(),
        timeout: inv.timeout,
        captured_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_whole_lines_until_the_limit() {
        let mut cap = Capture::new(10);
        cap.feed(Stream::Stdout, b"12345\n");
        cap.feed(Stream::Stderr, b"abc\n");
        cap.feed(Stream::Stdout, b"overflow\n");
        cap.feed(Stream::Stdout, b"x\n");

        assert!(cap.truncated);
        assert_eq!(cap.stdout, b"12345\n");
        assert_eq!(cap.stderr, b"abc\n");
        assert_eq!(cap.combined, b"12345\nabc\n");
        assert_eq!(cap.seen, 21);
    }

    #[test]
    fn lines_split_across_reads_are_joined() {
        let mut cap = Capture::new(1024);
        cap.feed(Stream::Stdout, b"{\"category\":");
        cap.feed(Stream::Stdout, b"\"A\"}\nnext");
        cap.finish(Stream::Stdout);
        assert_eq!(cap.stdout, b"{\"category\":\"A\"}\nnext");
        assert_eq!(cap.combined, b"{\"category\":\"A\"}\nnext\n");
    }

    #[test]
    fn unterminated_lines_do_not_merge_in_combined_output() {
        let mut cap = Capture::new(1024);
        cap.feed(Stream::Stdout, b"partial");
        cap.feed(Stream::Stderr, b"other\n");
        cap.finish(Stream::Stdout);
        cap.finish(Stream::Stderr);
        assert_eq!(cap.combined, b"other\npartial\n");
        assert_eq!(cap.stdout, b"partial");
    }

    #[test]
    fn newline_free_stream_stays_within_the_limit() {
        let mut cap = Capture::new(4096);
        for _ in 0..64 {
            cap.feed(Stream::Stdout, &[b'a'; 1024]);
            assert!(cap.pending.iter().all(|p| p.len() <= 4096));
        }
        cap.finish(Stream::Stdout);
        assert!(cap.truncated);
        assert!(cap.stdout.is_empty());
        assert_eq!(cap.seen, 64 * 1024);
    }

    #[test]
    fn cmdline_joins_program_and_args() {
        let mut inv = Invocation::new("kubeaudit", Duration::from_secs(1));
        inv.args = vec!["-n".to_string(), "ns".to_string()];
        assert_eq!(inv.cmdline(), "kubeaudit -n ns");
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let inv = Invocation::new(
            "scanharness-definitely-not-installed-tool",
            Duration::from_secs(30),
        );
        let started = Instant::now();
        let err = SystemRunner.run(&inv).unwrap_err();
        assert!(matches!(err, RunError::Launch { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_and_exit_code() {
        let mut inv = Invocation::new("sh", Duration::from_secs(10));
        inv.args = vec![
            "-c".to_string(),
            "echo out; echo err 1>&2; exit 3".to_string(),
        ];
        let out = SystemRunner.run(&inv).expect("run sh");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(out.combined.contains("out\n"));
        assert!(out.combined.contains("err\n"));
        assert!(!out.truncated);
    }

    #[cfg(unix)]
    #[test]
    fn env_and_working_dir_are_applied() {
        let dir = std::env::temp_dir();
        let mut inv = Invocation::new("sh", Duration::from_secs(10));
        inv.args = vec!["-c".to_string(), "echo $SCANHARNESS_PROBE; pwd".to_string()];
        inv.env = vec![("SCANHARNESS_PROBE".to_string(), "hello".to_string())];
        inv.working_dir = Some(dir.clone());
        let out = SystemRunner.run(&inv).expect("run sh");
        let mut lines = out.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let pwd = std::path::PathBuf::from(lines.next().expect("pwd"));
        assert_eq!(
            pwd.canonicalize().expect("canonicalize pwd"),
            dir.canonicalize().expect("canonicalize temp")
        );
    }

    #[cfg(unix)]
    #[test]
    fn large_output_is_drained_while_running() {
        let mut inv = Invocation::new("sh", Duration::from_secs(20));
        // Well past the pipe buffer size; blocks forever unless drained.
        inv.args = vec![
            "-c".to_string(),
            "i=0; while [ $i -lt 20000 ]; do echo 'line of progress output ........'; i=$((i+1)); done".to_string(),
        ];
        let out = SystemRunner.run(&inv).expect("run sh");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.lines().count(), 20000);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_process_and_reports_captured_bytes() {
        let mut inv = Invocation::new("sh", Duration::from_millis(300));
        inv.args = vec!["-c".to_string(), "echo started; sleep 30".to_string()];
        let started = Instant::now();
        let err = SystemRunner.run(&inv).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            RunError::TimedOut { captured_bytes, .. } => assert_eq!(captured_bytes, 8),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn background_children_holding_the_pipe_hit_the_deadline() {
        let mut inv = Invocation::new("sh", Duration::from_millis(500));
        inv.args = vec!["-c".to_string(), "sleep 30 & echo parent-done".to_string()];
        let started = Instant::now();
        let err = SystemRunner.run(&inv).unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn oversized_timeout_is_clamped() {
        let mut inv = Invocation::new("sh", Duration::MAX);
        inv.args = vec!["-c".to_string(), "echo ok".to_string()];
        let out = SystemRunner.run(&inv).expect("run sh");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "ok\n");
    }

    #[cfg(unix)]
    #[test]
    fn output_cap_sets_truncated() {
        let mut inv = Invocation::new("sh", Duration::from_secs(10));
        inv.args = vec!["-c".to_string(), "echo aaaa; echo bbbb; echo cccc".to_string()];
        inv.max_output_bytes = 10;
        let out = SystemRunner.run(&inv).expect("run sh");
        assert!(out.truncated);
        assert_eq!(out.stdout, "aaaa\nbbbb\n");
    }
}
