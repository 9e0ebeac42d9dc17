//! Error types and result handling for cdc-listener.
//!
//! Two families live here. [`Error`] is returned synchronously from lifecycle
//! calls on a [`Listener`](crate::Listener) and from configuration loading.
//! [`EventError`] describes a single change record that could not be
//! delivered; it never escapes a batch and is handed to the owning service's
//! error handler or logged instead.
//!
//! # Example
//!
//! ```rust
//! use cdc_listener::{Error, Result};
//!
//! fn start_without_services() -> Result<()> {
//!     Err(Error::OperationNotPermitted(
//!         "Cannot start the listener without at least one attached service.".to_string(),
//!     ))
//! }
//!
//! match start_without_services() {
//!     Ok(()) => println!("Started"),
//!     Err(Error::OperationNotPermitted(msg)) => eprintln!("Refused: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use serde_json::Value;
use thiserror::Error;

use crate::service::ServiceError;

/// The main error type for listener operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Lifecycle misuse: attaching while running, conflicting table claims,
    /// starting with no services and so on. Never retried.
    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    /// The service declaration is unusable (no operation methods, duplicate
    /// declarations, bad table list).
    #[error("Invalid service '{service}': {message}")]
    InvalidService {
        /// Name reported by the service
        service: String,
        /// What was wrong with the declaration
        message: String,
    },

    /// The capture engine could not be started.
    #[error("Failed to start the capture engine: {0}")]
    Startup(String),

    /// The capture engine could not be stopped cleanly.
    #[error("Failed to stop the capture engine: {0}")]
    Shutdown(String),

    /// Error raised by a capture engine implementation.
    #[error("Capture engine error: {0}")]
    Engine(String),

    /// Configuration error, typically from a malformed file or environment.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error, typically from file-backed engines.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A convenient Result type alias for cdc-listener operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to process one change record.
///
/// Each variant carries the event payload (the decoded `payload` member, or
/// the raw record text when it could not be decoded) so that error handlers
/// can inspect or dead-letter it.
#[derive(Error, Debug)]
pub enum EventError {
    /// Malformed record, unrecognized operation or unexpected fault.
    #[error("Event Processing failed. {message}")]
    Processing { message: String, payload: Value },

    /// No service is registered for the record's table.
    #[error("Service for table '{key}' is not available.")]
    ServiceNotFound { key: String, payload: Value },

    /// The resolved service does not implement the operation's method.
    #[error("Function '{method}' is not available.")]
    MethodNotAvailable { method: String, payload: Value },

    /// A before/after fragment could not be bound to the declared type.
    #[error("Payload binding failed. {message}")]
    PayloadBinding { message: String, payload: Value },

    /// The handler returned an error or panicked.
    #[error("Service '{service}' failed in '{method}': {source}")]
    Invocation {
        service: String,
        method: String,
        payload: Value,
        #[source]
        source: ServiceError,
    },
}

impl EventError {
    /// The payload this failure relates to.
    pub fn payload(&self) -> &Value {
        match self {
            EventError::Processing { payload, .. }
            | EventError::ServiceNotFound { payload, .. }
            | EventError::MethodNotAvailable { payload, .. }
            | EventError::PayloadBinding { payload, .. }
            | EventError::Invocation { payload, .. } => payload,
        }
    }

    /// Short, stable name of the failure kind for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EventError::Processing { .. } => "EventProcessingError",
            EventError::ServiceNotFound { .. } => "ServiceNotFound",
            EventError::MethodNotAvailable { .. } => "MethodNotAvailable",
            EventError::PayloadBinding { .. } => "PayloadBindingError",
            EventError::Invocation { .. } => "InvocationError",
        }
    }
}
