//! Crate-wide error type.
//!
//! Errors are classified by kind rather than by hierarchy: validation and
//! not-found are reported to the caller, concurrency losses are retried
//! silently, transient store errors are retried with backoff, and
//! configuration errors are fatal at startup. The CLI maps kinds onto
//! distinct process exit codes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RailyardError>;

#[derive(Debug, Error)]
pub enum RailyardError {
    /// Rejected input: missing required field, bad reference, exceeded
    /// capacity. The message names the offending value.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Rejected status transition; names the currently allowed set.
    #[error("cannot transition car {car} from {from} to {to} (allowed: {allowed:?})")]
    Transition {
        car: String,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    /// Adding this edge would close a dependency loop.
    #[error("dependency cycle: {car} is already reachable from {blocked_by}")]
    DependencyCycle { car: String, blocked_by: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Lost a concurrent claim race. Never surfaced to callers; the claim
    /// loop re-enters.
    #[error("lost concurrent claim")]
    ClaimLost,

    /// Another live supervisor already holds the singleton slot.
    #[error("a supervisor is already registered: {0}")]
    SupervisorExists(String),

    #[error("session already running")]
    SessionRunning,

    #[error("no session running")]
    SessionNotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// External command (git, tmux, test runner, agent) failed.
    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by retry policy and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Concurrency,
    Transient,
    Config,
    Internal,
}

impl RailyardError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::Transition { .. }
            | Self::DependencyCycle { .. }
            | Self::SupervisorExists(_)
            | Self::SessionRunning
            | Self::SessionNotRunning => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ClaimLost => ErrorKind::Concurrency,
            Self::Store(_) | Self::Io(_) | Self::Command { .. } => ErrorKind::Transient,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code at the CLI boundary.
    ///
    /// 0 success, 2 configuration, 3 store unreachable, 4 session state,
    /// 1 everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Store(_) => 3,
            Self::SessionRunning | Self::SessionNotRunning => 4,
            _ => 1,
        }
    }
}
