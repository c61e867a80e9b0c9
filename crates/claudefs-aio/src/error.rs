//! Error types for the AIO engine.

use thiserror::Error;

/// Result type alias for AIO operations.
pub type AioResult<T> = Result<T, AioError>;

/// Error variants for AIO operations.
#[derive(Debug, Error)]
pub enum AioError {
    /// Wraps standard I/O errors (file open, metadata).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixed-size resource (control-block pool, hand-off queue) is exhausted.
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// Name of the exhausted resource.
        resource: &'static str,
    },

    /// A kernel AIO system call failed.
    #[error("System call {op} failed: {source}")]
    SystemCall {
        /// The system call that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration value or request parameter is invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded wait elapsed.
    #[error("Timed out waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: &'static str,
    },

    /// close() exceeded its wait budget; resources stay with the workers.
    #[error("Shutdown incomplete for {path}: harvest_finished={harvest_finished}, dispatch_finished={dispatch_finished}")]
    ShutdownIncomplete {
        /// Path of the context being closed.
        path: String,
        /// Whether the completion-harvesting thread exited.
        harvest_finished: bool,
        /// Whether the callback-dispatch thread exited.
        dispatch_finished: bool,
    },

    /// The context no longer accepts submissions.
    #[error("I/O context is closed")]
    Closed,

    /// The kernel completed fewer bytes than requested.
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        /// Requested length in bytes.
        expected: u64,
        /// The raw completion result.
        actual: i64,
    },
}

impl AioError {
    /// Builds a [`AioError::SystemCall`] from the calling thread's `errno`.
    pub fn last_os_error(op: &'static str) -> Self {
        AioError::SystemCall {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Builds a [`AioError::SystemCall`] from an explicit errno value.
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        AioError::SystemCall {
            op,
            source: std::io::Error::from_raw_os_error(errno),
        }
    }
}
