//! Error types for the transfer core
//!
//! Errors are categorized so the scheduler knows what to retry and the
//! engines know what to persist.
//!
//! # Error Categories
//!
//! - **Transient**: network and service faults that may succeed on retry
//! - **Cancellation**: a deliberate stop, never retried and never shown as a fault
//! - **Integrity**: checksum mismatches, fatal for the affected transfer
//! - **Not found**: the remote resource expired, handled by local cleanup
//! - **Validation**: malformed records or arguments, raised immediately
//!
//! # Example
//!
//! ```
//! use permafrost_core::error::TransferError;
//!
//! let err = TransferError::transport("connection reset");
//! assert!(err.should_retry());
//! assert!(!TransferError::Cancelled.should_retry());
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur while executing transfers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    // ============ Remote Errors ============
    /// Network-level failure talking to the storage service
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Service-side fault (throttling, 5xx)
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Service error code
        code: String,
        /// Service error message
        message: String,
    },

    /// Request rejected by the service for a reason retrying will not fix
    #[error("Request rejected {code}: {message}")]
    Rejected {
        /// Service error code
        code: String,
        /// Service error message
        message: String,
    },

    /// Remote resource no longer exists
    #[error("Not found: {0}")]
    NotFound(Cow<'static, str>),

    // ============ Control Flow ============
    /// Job was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Scheduler is not accepting work
    #[error("Queue not ready")]
    QueueNotReady,

    // ============ Integrity Errors ============
    /// Checksum verification failed
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Digest the content should have
        expected: String,
        /// Digest the content actually has
        actual: String,
    },

    // ============ Local Errors ============
    /// Malformed record or argument
    #[error("Validation failed: {0}")]
    Validation(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Local transfer record missing
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Job result channel closed without an answer
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl TransferError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Transport(_) | TransferError::Remote { .. } | TransferError::Io(_)
        )
    }

    /// Returns true if this error will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::Rejected { .. }
                | TransferError::NotFound(_)
                | TransferError::HashMismatch { .. }
                | TransferError::Validation(_)
                | TransferError::InvalidState(_)
                | TransferError::TransferNotFound(_)
                | TransferError::InvalidConfig(_)
        )
    }

    /// Returns true if the scheduler should re-run the job
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Returns true for the cancellation signal
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Returns true if the remote resource has expired
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::NotFound(_))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        TransferError::Transport(Cow::Borrowed(context))
    }

    /// Create a not-found error with static context (zero allocation)
    #[must_use]
    pub const fn not_found(context: &'static str) -> Self {
        TransferError::NotFound(Cow::Borrowed(context))
    }

    /// Create a validation error with static context (zero allocation)
    #[must_use]
    pub const fn validation(context: &'static str) -> Self {
        TransferError::Validation(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        TransferError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        TransferError::Serialization(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<permafrost_files::TreeHashError> for TransferError {
    fn from(err: permafrost_files::TreeHashError) -> Self {
        TransferError::Validation(Cow::Owned(err.to_string()))
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Channel(Cow::Owned(format!("task join failed: {err}")))
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: &str) -> TransferError {
        TransferError::Remote {
            code: code.into(),
            message: "test".into(),
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(TransferError::transport("test").is_transient());
        assert!(remote("ServiceUnavailableException").is_transient());
        assert!(TransferError::Io("disk".into()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(TransferError::not_found("job").is_permanent());
        assert!(TransferError::validation("test").is_permanent());
        assert!(TransferError::invalid_state("test").is_permanent());
        assert!(
            TransferError::HashMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .is_permanent()
        );
        assert!(
            TransferError::Rejected {
                code: "InvalidParameterValueException".into(),
                message: "bad range".into()
            }
            .is_permanent()
        );
    }

    #[test]
    fn test_should_retry() {
        assert!(TransferError::transport("test").should_retry());
        assert!(remote("RequestTimeoutException").should_retry());

        assert!(!TransferError::Cancelled.should_retry());
        assert!(!TransferError::not_found("test").should_retry());
        assert!(!TransferError::validation("test").should_retry());
        assert!(!TransferError::QueueNotReady.should_retry());
    }

    #[test]
    fn test_cancellation_is_neither_transient_nor_permanent() {
        let err = TransferError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let err = TransferError::HashMismatch {
            expected: "abcd".into(),
            actual: "ef01".into(),
        };
        assert_eq!(err.to_string(), "Hash mismatch: expected abcd, got ef01");
        assert_eq!(TransferError::QueueNotReady.to_string(), "Queue not ready");
    }

    #[test]
    fn test_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(matches!(TransferError::from(io_err), TransferError::Io(_)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(
            TransferError::from(json_err),
            TransferError::Serialization(_)
        ));

        let tree_err = permafrost_files::TreeHashError::AlreadySet(3);
        assert!(matches!(
            TransferError::from(tree_err),
            TransferError::Validation(_)
        ));
    }
}
