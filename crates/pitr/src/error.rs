//! Error types for the recovery engine.
//!
//! One enum covers the whole run: configuration problems surface before any
//! network traffic, storage and cluster failures carry the failing operation
//! in the message, and child-process exits keep the tool name and status.

use std::process::ExitStatus;
use thiserror::Error;

/// Result type alias for recovery operations
pub type Result<T> = std::result::Result<T, PitrError>;

/// Errors produced while planning or replaying a recovery
#[derive(Error, Debug)]
pub enum PitrError {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Object storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// SQL failure talking to the cluster
    #[error("cluster error: {0}")]
    Cluster(String),

    /// No archived binlog is newer than the cluster's executed set
    #[error("no binlog objects for prefix {prefix:?} or with gtid set {gtid:?}")]
    NoApplicableBinlogs { prefix: String, gtid: String },

    /// Transaction-mode target was executed before the backup was taken
    #[error("cannot recover to {0}: transaction precedes the backup")]
    TargetBeforeBackup(String),

    /// Malformed GTID or GTID set
    #[error("invalid gtid {gtid:?}: {reason}")]
    InvalidGtid { gtid: String, reason: String },

    /// Replay plumbing failure (pipe setup, child spawn)
    #[error("replay pipeline error: {0}")]
    Pipeline(String),

    /// A child process exited with a failure status
    #[error("{tool} exited with {status}")]
    Process { tool: &'static str, status: ExitStatus },

    /// Backup metadata did not contain the expected GTID markers
    #[error("backup info error: {0}")]
    BackupInfo(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,
}

impl PitrError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an object-store failure with the failing operation's name
    pub fn storage(op: &str, err: object_store::Error) -> Self {
        Self::Storage(format!("{op}: {err}"))
    }

    /// Wrap a SQL failure with the failing operation's name
    pub fn cluster(op: &str, err: mysql_async::Error) -> Self {
        Self::Cluster(format!("{op}: {err}"))
    }

    /// Create a new invalid-gtid error
    pub fn invalid_gtid(gtid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGtid {
            gtid: gtid.into(),
            reason: reason.into(),
        }
    }
}
