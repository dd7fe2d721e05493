//! Unified error handling for the proxy engine.
//!
//! Mirrors the taxonomy the request pipeline and config compiler surface
//! to callers: validation/authorization/not-found/conflict errors
//! propagate unwrapped, IO errors are wrapped with context, and fatal
//! internal-consistency errors are logged at error severity.

use std::fmt;

/// Unified error type for the proxy core.
#[derive(Debug)]
pub enum ProxyError {
    /// Bad YAML, bad regex, field-constraint violation, unknown enum value.
    Validation { field: String, message: String },

    /// Request lacks the required permission.
    Authorization(String),

    /// Lookup miss; never logged as an error.
    NotFound(String),

    /// Uniqueness/ownership collision, surfaced with the colliding identifier.
    Conflict(String),

    /// Upstream dial failure, storage unavailable.
    TransientIO(String),

    /// Inconsistent internal state; logged at error severity, never retried.
    Fatal(String),
}

impl ProxyError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Validation { field, message } => {
                write!(f, "validation failed on field '{field}': {message}")
            }
            ProxyError::Authorization(msg) => write!(f, "authorization denied: {msg}"),
            ProxyError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProxyError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ProxyError::TransientIO(msg) => write!(f, "transient io error: {msg}"),
            ProxyError::Fatal(msg) => write!(f, "fatal internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ProxyError> for Box<pingora_error::Error> {
    fn from(err: ProxyError) -> Self {
        use pingora_error::ErrorType::*;
        let etype = match &err {
            ProxyError::Validation { .. } => InvalidHTTPHeader,
            ProxyError::Authorization(_) => HTTPStatus(403),
            ProxyError::NotFound(_) => HTTPStatus(404),
            ProxyError::Conflict(_) => HTTPStatus(409),
            ProxyError::TransientIO(_) => ConnectError,
            ProxyError::Fatal(_) => InternalError,
        };
        pingora_error::Error::explain(etype, err.to_string())
    }
}

/// Result alias for proxy core operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Adds context to a lower-level error while preserving the original as source-like text.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ProxyResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::TransientIO(format!("{context}: {e}")))
    }
}
