//! Crate-wide error taxonomy.
//!
//! Each variant family corresponds to one of the failure kinds the
//! orchestration layers can produce. Test failures are never represented
//! here -- they live in [`crate::results::TestResults`] -- this enum is
//! reserved for infrastructure failures that keep a lane from running at
//! all.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type returned by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or inconsistent controller credentials, bad flag
    /// combinations, or a device record missing a required field.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A test file could not be read or the test tree could not be walked.
    #[error("discovery error reading {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Static classification exhausted all fallbacks; carries the bases
    /// that were seen so the caller can log them. This variant is recorded
    /// but never propagated as a hard failure -- see
    /// [`crate::resolver::TestTypeResolver`].
    #[error("no recognized base class in {path}: found {found_bases:?}")]
    Resolver {
        path: PathBuf,
        found_bases: Vec<String>,
    },

    /// A worker subprocess failed to start.
    #[error("failed to launch worker for lane {lane}: {source}")]
    WorkerLaunch {
        lane: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker subprocess exited with a code other than 0 or 1.
    #[error("worker for lane {lane} exited with code {code}")]
    WorkerExecution { lane: String, code: i32 },

    /// A device transport could not be established.
    #[error("broker transport error for device {device_id}: {message}")]
    BrokerTransport { device_id: String, message: String },

    /// Device authentication failed; never retried.
    #[error("broker authentication error for device {device_id}: {message}")]
    BrokerAuth { device_id: String, message: String },

    /// A transport or command exceeded its allotted time.
    #[error("broker timeout for device {device_id} running {command:?}")]
    BrokerTimeout { device_id: String, command: String },

    /// An archive was missing expected files or could not be merged.
    #[error("archive aggregation error: {0}")]
    Aggregation(String),

    /// The report/dashboard templating layer failed. Never blocks exit
    /// code determination.
    #[error("reporting error: {0}")]
    Reporting(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Classification of a broker transport failure, used to decide whether a
/// retry is appropriate. See [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Connection reset, broken pipe, or other recoverable I/O error.
    Transient,
    /// The transport or command exceeded its deadline.
    Timeout,
    /// Credentials were rejected; retrying will not help.
    Auth,
    /// Any other non-retryable failure.
    Other,
}

impl BrokerErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, BrokerErrorKind::Transient | BrokerErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BrokerErrorKind::Transient => "transient",
            BrokerErrorKind::Timeout => "timeout",
            BrokerErrorKind::Auth => "auth",
            BrokerErrorKind::Other => "other",
        }
    }
}
