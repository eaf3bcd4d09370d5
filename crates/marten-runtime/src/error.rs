//! Error types for the runtime core

use std::fmt;
use thiserror::Error;

/// Errors raised by the host side of the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Cannot find module '{name}' from '{from}'")]
    ModuleNotFound { name: String, from: String },

    #[error("Failed to parse module {path}: {message}")]
    ModuleParse { path: String, message: String },

    #[error("Built-in module '{0}' is not installed")]
    MissingBuiltin(String),

    #[error("Type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream has been destroyed")]
    StreamDestroyed,

    #[error("Uncaught exception: {0}")]
    Uncaught(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Create a type error
    pub fn type_error(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a module-not-found error
    pub fn not_found(name: impl Into<String>, from: impl fmt::Display) -> Self {
        Self::ModuleNotFound {
            name: name.into(),
            from: from.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Node-style error code, used for the `code` property of guest errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::ModuleNotFound { .. } => Some("MODULE_NOT_FOUND"),
            Self::TypeError { .. } => Some("ERR_INVALID_ARG_TYPE"),
            Self::StreamDestroyed => Some("ERR_STREAM_DESTROYED"),
            Self::Io(err) => io_error_code(err.kind()),
            _ => None,
        }
    }
}

fn io_error_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound => Some("ENOENT"),
        ErrorKind::PermissionDenied => Some("EACCES"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::AddrInUse => Some("EADDRINUSE"),
        ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        _ => None,
    }
}

/// Result type for host-side runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Error crossing the guest boundary: either a host failure or a value
/// thrown by guest code.
#[derive(Debug, Error)]
pub enum GuestError<V: fmt::Debug> {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Guest exception: {0:?}")]
    Thrown(V),
}

impl<V: fmt::Debug> GuestError<V> {
    /// The host error, if this is not a guest exception.
    pub fn as_runtime(&self) -> Option<&RuntimeError> {
        match self {
            Self::Runtime(err) => Some(err),
            Self::Thrown(_) => None,
        }
    }
}

impl<V: fmt::Debug> From<std::io::Error> for GuestError<V> {
    fn from(err: std::io::Error) -> Self {
        Self::Runtime(RuntimeError::Io(err))
    }
}

/// Result type for calls that run guest code
pub type GuestResult<T, V> = Result<T, GuestError<V>>;
