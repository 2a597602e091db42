//! Error types for the agent core

use miette::Diagnostic;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Error type for broker, cache, and dedup operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error with optional path context
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildstash::core::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Malformed input on the protocol stream; fatal for the broker loop
    #[error("protocol error: {message}")]
    #[diagnostic(code(buildstash::core::protocol))]
    Protocol {
        /// Description of the framing problem
        message: String,
    },

    /// Failure reported by a storage backend
    #[error("{message}")]
    #[diagnostic(code(buildstash::core::backend))]
    Backend {
        /// Backend-supplied description
        message: String,
    },

    /// Sidecar metadata is missing a required field or does not parse
    #[error("metadata error: {message}")]
    #[diagnostic(code(buildstash::core::metadata))]
    Metadata {
        /// Description of the metadata problem
        message: String,
    },

    /// Cross-process lock could not be acquired within the wait ceiling
    #[error("failed to acquire lock: timeout")]
    #[diagnostic(
        code(buildstash::core::lock_timeout),
        help("Another process held the lock for longer than the wait ceiling")
    )]
    LockTimeout,

    /// Cross-process lock failed for a reason other than contention
    #[error("failed to acquire lock: {message}")]
    #[diagnostic(code(buildstash::core::lock))]
    Lock {
        /// Description of the lock failure
        message: String,
    },

    /// Request named a command the agent does not implement
    #[error("unknown command: {name}")]
    #[diagnostic(code(buildstash::core::unknown_command))]
    UnknownCommand {
        /// The command string as received
        name: String,
    },

    /// The leader of an in-flight call went away without publishing a result
    #[error("in-flight call for {key} was abandoned")]
    #[diagnostic(code(buildstash::core::flight_abandoned))]
    FlightAbandoned {
        /// Dedup key of the abandoned call
        key: String,
    },

    /// Error shared among single-flight waiters
    #[error("{0}")]
    #[diagnostic(code(buildstash::core::shared))]
    Shared(Arc<Error>),
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a protocol framing error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create a backend error
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
        }
    }

    /// Create a sidecar metadata error
    #[must_use]
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata {
            message: msg.into(),
        }
    }

    /// Create a lock error
    #[must_use]
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock {
            message: msg.into(),
        }
    }

    /// Create an unknown-command error
    #[must_use]
    pub fn unknown_command(name: impl Into<String>) -> Self {
        Self::UnknownCommand { name: name.into() }
    }

    /// Create an abandoned-flight error
    #[must_use]
    pub fn flight_abandoned(key: impl Into<String>) -> Self {
        Self::FlightAbandoned { key: key.into() }
    }
}

/// Result type for agent core operations
pub type Result<T> = std::result::Result<T, Error>;
