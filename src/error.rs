//! Error types shared across the crate.
//!
//! Registration-time problems surface as [`ConfigError`] from the routing
//! APIs. Everything that can go wrong while an exchange is in flight travels
//! through the middleware chain as a [`HandlerError`]. Transport aborts are
//! lifecycle events, not errors, and never appear here.

use std::fmt;

/// Rejected route or middleware registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A route with the same method and pattern already exists.
    DuplicateRoute { method: String, pattern: String },
    /// The pattern cannot be parsed or is not legal in this position.
    InvalidPattern { pattern: String, reason: String },
    /// The server is already listening; the routing table is immutable.
    RoutesLocked,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRoute { method, pattern } => {
                write!(f, "duplicate route registration: {method} {pattern}")
            }
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern {pattern:?}: {reason}")
            }
            Self::RoutesLocked => {
                write!(f, "routes are locked once the server is listening")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Violation of the exchange state machine. Always fatal for the exchange
/// and never downgraded to a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The chain cursor moved backwards or repeated a position, meaning a
    /// middleware both invoked its continuation and settled its deferred.
    DoubleDispatch { cursor: usize },
    /// Status, header or cookie mutation after the response was committed.
    HeadersCommitted { op: &'static str },
    /// A write primitive was invoked through an already-completed response
    /// in a context where silence would hide a bug.
    WriteAfterComplete { op: &'static str },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleDispatch { cursor } => write!(
                f,
                "double middleware execution detected at chain position {cursor}: \
                 a middleware invoked its continuation and also settled asynchronously"
            ),
            Self::HeadersCommitted { op } => {
                write!(f, "{op} rejected: response headers already committed")
            }
            Self::WriteAfterComplete { op } => {
                write!(f, "{op} rejected: response already completed")
            }
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// The uniform error value carried by the middleware chain.
///
/// Handlers and middlewares surface failures either by returning `Err` or by
/// rejecting a deferred outcome; both paths deliver the value to the
/// server's error handler exactly once per exchange.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Failure with an intended HTTP status and body.
    Status { code: u16, message: String },
    /// Exchange state machine violation.
    Protocol(ProtocolViolation),
    /// Anything else; rendered as a 500 by the default error handler.
    Message(String),
}

impl HandlerError {
    /// Shorthand for a status-carrying failure.
    #[must_use]
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// The HTTP status the default error handler responds with.
    #[must_use]
    pub fn response_status(&self) -> u16 {
        match self {
            Self::Status { code, .. } => *code,
            Self::Protocol(_) | Self::Message(_) => 500,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code, message } => write!(f, "handler failed ({code}): {message}"),
            Self::Protocol(v) => write!(f, "protocol violation: {v}"),
            Self::Message(msg) => write!(f, "handler failed: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ProtocolViolation> for HandlerError {
    fn from(v: ProtocolViolation) -> Self {
        Self::Protocol(v)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Message(format!("json error: {e}"))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::Message(format!("io error: {e}"))
    }
}

/// Failure while decoding a `multipart/form-data` body.
///
/// Each configured limit has its own variant so callers can distinguish
/// which bound was exceeded.
#[derive(Debug)]
pub enum MultipartError {
    /// Total part count exceeded `MultipartLimits::max_parts`.
    PartsLimit,
    /// File part count exceeded `MultipartLimits::max_files`.
    FilesLimit,
    /// Non-file field count exceeded `MultipartLimits::max_fields`.
    FieldsLimit,
    /// The payload is not well-formed multipart.
    Malformed(String),
    /// The field handler itself failed; decoding stopped.
    Handler(Box<HandlerError>),
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartsLimit => write!(f, "multipart part limit reached"),
            Self::FilesLimit => write!(f, "multipart file limit reached"),
            Self::FieldsLimit => write!(f, "multipart field limit reached"),
            Self::Malformed(reason) => write!(f, "malformed multipart body: {reason}"),
            Self::Handler(e) => write!(f, "multipart field handler failed: {e}"),
        }
    }
}

impl std::error::Error for MultipartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handler(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<MultipartError> for HandlerError {
    fn from(e: MultipartError) -> Self {
        match e {
            MultipartError::Handler(inner) => *inner,
            other => Self::Status {
                code: 413,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_keeps_its_code() {
        let err = HandlerError::status(404, "missing");
        assert_eq!(err.response_status(), 404);
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn protocol_violations_map_to_500() {
        let err: HandlerError = ProtocolViolation::DoubleDispatch { cursor: 2 }.into();
        assert_eq!(err.response_status(), 500);
        assert!(err.to_string().contains("double middleware execution"));
    }

    #[test]
    fn multipart_limit_variants_are_distinct() {
        assert_ne!(
            MultipartError::PartsLimit.to_string(),
            MultipartError::FilesLimit.to_string()
        );
        assert_ne!(
            MultipartError::FilesLimit.to_string(),
            MultipartError::FieldsLimit.to_string()
        );
    }
}
