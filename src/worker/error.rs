//! Bridge error types.
//!
//! Every message carried by a variant is already normalized: short, single
//! line, and safe to show to the person who triggered the request.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the bridge.
///
/// The type is `Clone` because a single failed worker start is shared by every
/// caller that was coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// No candidate executable could be started.
    #[error("{0}")]
    Unavailable(String),

    /// A call or a queue wait exceeded its bound.
    #[error("{what} timed out after {after_ms} ms")]
    Timeout {
        /// What timed out ("worker call", "queue wait", ...).
        what: &'static str,
        /// The bound that was exceeded.
        after_ms: u64,
    },

    /// The persistent worker died while the call was outstanding.
    #[error("worker exited: {0}")]
    WorkerExited(String),

    /// The external process produced malformed or non-JSON output.
    #[error("bad output from worker: {0}")]
    Protocol(String),

    /// The external process explicitly reported `ok: false`.
    #[error("{0}")]
    Application(String),

    /// Admission refused: the waiting queue is already full.
    #[error("too many pending requests ({depth} waiting), try again shortly")]
    QueueFull {
        /// Queue depth at the time of refusal.
        depth: usize,
    },

    /// The request payload failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Writing to the worker's pipes failed.
    #[error("worker I/O failed: {0}")]
    Io(String),
}

/// Stable labels for error classes, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    Timeout,
    WorkerExited,
    Protocol,
    Application,
    QueueFull,
    InvalidRequest,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WorkerExited => "worker_exited",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Application => "application",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Io => "io",
        }
    }
}

impl BridgeError {
    /// Build a timeout error for the given operation.
    pub fn timeout(what: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout {
            what,
            after_ms: after.as_millis() as u64,
        }
    }

    /// The class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::WorkerExited(_) => ErrorKind::WorkerExited,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Application(_) => ErrorKind::Application,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if this error means the persistent worker path is unusable.
    ///
    /// These are the failures that send a call down the fallback path. A slow
    /// call (`Timeout`) or an explicit worker answer (`Application`) is not one.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::WorkerExited(_) | Self::Protocol(_) | Self::Io(_)
        )
    }

    /// Check if this error indicates the worker has exited.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::WorkerExited(_))
    }

    /// Check if this error is an admission decision of the queue.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. }
                | Self::Timeout {
                    what: QUEUE_WAIT,
                    ..
                }
        )
    }
}

/// Operation label used for queue wait timeouts.
pub const QUEUE_WAIT: &str = "queue wait";

/// Operation label used for per-call worker timeouts.
pub const WORKER_CALL: &str = "worker call";

/// Operation label used for one-shot fallback timeouts.
pub const FALLBACK_CALL: &str = "fallback call";

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::WorkerExited("response channel closed".to_string())
    }
}
