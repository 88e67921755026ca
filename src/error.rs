use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::ScanState;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("プロセス起動に失敗しました: {program}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("タイムアウトしました（{timeout:?}）: {program}（取得済み出力 {captured_bytes} バイト）")]
    TimedOut {
        program: String,
        timeout: Duration,
        captured_bytes: usize,
    },

    #[error("プロセス待機に失敗しました: {program}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("出力を解析できませんでした（{lines} 行中に認識できるレコードがありません）: {sample}")]
    UnparsableOutput { lines: usize, sample: String },
}

#[derive(Debug, Error)]
pub enum ScanErrorKind {
    #[error("リクエストが不正です: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("ツールが終了コード {code} で終了しました: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Where a failed scan was pointed, attached for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanContext {
    pub namespace: String,
    pub tool: String,
    pub timeout: Duration,
}

impl fmt::Display for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "namespace={} tool={} timeout={}s",
            self.namespace,
            self.tool,
            self.timeout.as_secs()
        )
    }
}

#[derive(Debug, Error)]
#[error("スキャンに失敗しました（{context}）")]
pub struct ScanError {
    pub context: ScanContext,
    #[source]
    pub kind: ScanErrorKind,
}

impl ScanError {
    pub fn new(context: ScanContext, kind: impl Into<ScanErrorKind>) -> Self {
        Self {
            context,
            kind: kind.into(),
        }
    }

    pub fn kind(&self) -> &ScanErrorKind {
        &self.kind
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ScanErrorKind::Run(RunError::TimedOut { .. }))
    }

    pub fn is_launch_failure(&self) -> bool {
        matches!(self.kind, ScanErrorKind::Run(RunError::Launch { .. }))
    }

    pub fn is_unparsable(&self) -> bool {
        matches!(self.kind, ScanErrorKind::Parse(ParseError::UnparsableOutput { .. }))
    }

    /// State the scan was in when it failed.
    pub fn state(&self) -> ScanState {
        match &self.kind {
            ScanErrorKind::InvalidRequest(_) => ScanState::NotStarted,
            ScanErrorKind::Run(RunError::TimedOut { .. }) => ScanState::TimedOut,
            ScanErrorKind::Run(RunError::Launch { .. } | RunError::Wait { .. }) => {
                ScanState::LaunchFailed
            }
            ScanErrorKind::NonZeroExit { .. } | ScanErrorKind::Parse(_) => ScanState::Completed,
        }
    }
}
