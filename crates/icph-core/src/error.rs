//! Error types.
//!
//! Two families live here: [`Error`] covers conditions that stop a whole run,
//! while [`ProcessFailure`] describes why one file ended up in the error tree.
//! Per-file failures are recorded in the ledger and never abort the run.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::CancelledError;
use crate::ledger::LedgerError;

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Conditions that stop a run.
#[derive(Debug, Error)]
pub enum Error {
    /// No CSV/JSON sidecar with a recognised schema exists under the inputs.
    #[error("no sidecar CSV/JSON with a recognised schema found under the input folders")]
    EmptyLibrary,
    /// Input folders or options are unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// `resume` was requested but there is no ledger to resume from.
    #[error("no ledger found at {0}; use `start` for a fresh run")]
    LedgerMissing(PathBuf),
    /// The ledger was written for a different set of inputs or format version.
    #[error("ledger at {path} cannot be resumed ({why}); use `start` for a fresh run")]
    LedgerIncompatible { path: PathBuf, why: &'static str },
    /// The ledger could not be opened or created.
    #[error("ledger unavailable")]
    Ledger(#[from] LedgerError),
    /// A status change could not be persisted. Continuing would leave resume
    /// state uncertain, so the run halts.
    #[error("failed to persist ledger entry for {key}")]
    LedgerWrite {
        key: String,
        #[source]
        source: LedgerError,
    },
    /// The metadata tool failed its preflight check.
    #[error("metadata tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Filesystem failure outside of per-file processing.
    #[error("{operation} failed for {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Report serialisation failure.
    #[error("failed to write report {path}")]
    Report {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write summary {path}")]
    Summary {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to start worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl From<CancelledError> for Error {
    fn from(_: CancelledError) -> Self {
        Error::Cancelled
    }
}

impl Error {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Why a file was routed to the error tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoRecord,
    AmbiguousRecord,
    UnparsableTimestamp,
    UnsupportedKind,
    CopyFailure,
    PatchFailure,
    VerifyMismatch,
}

impl FailureReason {
    pub const ALL: [FailureReason; 7] = [
        FailureReason::NoRecord,
        FailureReason::AmbiguousRecord,
        FailureReason::UnparsableTimestamp,
        FailureReason::UnsupportedKind,
        FailureReason::CopyFailure,
        FailureReason::PatchFailure,
        FailureReason::VerifyMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoRecord => "no_record",
            FailureReason::AmbiguousRecord => "ambiguous_record",
            FailureReason::UnparsableTimestamp => "unparsable_timestamp",
            FailureReason::UnsupportedKind => "unsupported_kind",
            FailureReason::CopyFailure => "copy_failure",
            FailureReason::PatchFailure => "patch_failure",
            FailureReason::VerifyMismatch => "verify_mismatch",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure for a single file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct ProcessFailure {
    pub reason: FailureReason,
    /// Whether the last error seen was retry-eligible. A transient failure
    /// that exhausted its retries is still terminal for this attempt.
    pub transient: bool,
    pub detail: String,
}

impl ProcessFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            transient: false,
            detail: detail.into(),
        }
    }

    /// Classify an I/O error raised while copying or renaming.
    pub fn copy(context: &str, err: &io::Error) -> Self {
        Self {
            reason: FailureReason::CopyFailure,
            transient: is_transient_io(err),
            detail: format!("{}: {}", context, err),
        }
    }

    /// Append a secondary failure, e.g. when the error tree itself is unwritable.
    pub fn with_context(mut self, extra: &ProcessFailure) -> Self {
        self.detail = format!("{}; additionally {}", self.detail, extra);
        self
    }
}

/// I/O errors that may succeed when retried shortly after.
pub fn is_transient_io(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(err.kind(), Interrupted | WouldBlock | TimedOut | ResourceBusy) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}
