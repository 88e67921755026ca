use serde::Serialize;
use std::fmt;

/// Lifecycle of a single scan.
///
/// `NotStarted -> Running -> {Completed, TimedOut, LaunchFailed}`. Only
/// `Completed` proceeds to parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    NotStarted,
    Running,
    Completed,
    TimedOut,
    LaunchFailed,
}

impl ScanState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ScanState::NotStarted => "not_started",
            ScanState::Running => "running",
            ScanState::Completed => "completed",
            ScanState::TimedOut => "timed_out",
            ScanState::LaunchFailed => "launch_failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::TimedOut | ScanState::LaunchFailed
        )
    }

    pub const fn can_advance_to(self, next: ScanState) -> bool {
        matches!(
            (self, next),
            (ScanState::NotStarted, ScanState::Running)
                | (ScanState::Running, ScanState::Completed)
                | (ScanState::Running, ScanState::TimedOut)
                | (ScanState::Running, ScanState::LaunchFailed)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
