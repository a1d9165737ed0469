//! Error types and handling for FerroLift
//!
//! Every failure a pipeline can observe falls into one [`ErrorKind`]. The kind decides what
//! happens to the task: transient errors are retried with backoff, everything else finalises
//! the task (or is swallowed for optional elements).

use crate::types::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// Main error type for FerroLift operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Path does not exist on the backend
    #[error("Not found: {path}")]
    NotFound {
        /// Path that was not found
        path: String,
    },

    /// No adapter is registered for the storage system
    #[error("Storage system not found: {system}")]
    SystemNotFound {
        /// System identifier
        system: String,
    },

    /// The storage system is registered but disabled
    #[error("Storage system disabled: {system}")]
    SystemDisabled {
        /// System identifier
        system: String,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path with permission issues
        path: String,
    },

    /// Operation not supported by a backend
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        /// Operation name
        operation: String,
        /// Backend name
        backend: String,
    },

    /// I/O operation failed in a way that may succeed on retry
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// Task store failure
    #[error("Task store error: {message}")]
    Store {
        /// Error message describing the store failure
        message: String,
    },

    /// Status change not allowed by the transition table
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Worker attempted to mutate a task it no longer owns
    #[error("Task {task} is not assigned to the calling worker")]
    NotOwner {
        /// Task identifier
        task: TaskId,
    },

    /// Task id unknown to the store
    #[error("Task not found: {id}")]
    TaskNotFound {
        /// Task identifier
        id: TaskId,
    },

    /// Malformed transfer request or URI
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Path or system missing
    NotFound,
    /// Permission denied
    Authorization,
    /// Network blip, timeout, interrupted stream
    Transient,
    /// Operation unsupported by the backend
    Unsupported,
    /// Storage system disabled
    Unavailable,
    /// Task store failure
    Store,
    /// Task state or ownership violation
    State,
    /// Cancellation
    Cancelled,
    /// Configuration errors
    Config,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::SystemNotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::Authorization,
            Self::Io { .. } | Self::Timeout { .. } => ErrorKind::Transient,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::SystemDisabled { .. } => ErrorKind::Unavailable,
            Self::Store { .. } => ErrorKind::Store,
            Self::InvalidTransition { .. }
            | Self::NotOwner { .. }
            | Self::TaskNotFound { .. }
            | Self::InvalidRequest { .. } => ErrorKind::State,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Check if this error means the source or system does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Map an I/O error observed while touching `path`
    pub fn from_io(error: &std::io::Error, path: impl Into<String>) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path: path.into() },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path: path.into() },
            std::io::ErrorKind::Unsupported => Self::Unsupported {
                operation: error.to_string(),
                backend: "io".to_string(),
            },
            std::io::ErrorKind::TimedOut => Self::Io {
                message: format!("{}: timed out: {}", path.into(), error),
            },
            _ => Self::Io {
                message: format!("{}: {}", path.into(), error),
            },
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a new unsupported-operation error
    pub fn unsupported<S: Into<String>, B: Into<String>>(operation: S, backend: B) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Create a new transient I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        let path = error.to_string();
        Self::from_io(&error, path)
    }
}
