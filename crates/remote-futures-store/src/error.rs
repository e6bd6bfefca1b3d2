//! Errors raised by state store and task stream backends.

use std::fmt;

/// Errors that can occur during raw store or stream operations.
///
/// These are transport-level failures of the coordination substrate. The
/// `remote-futures` crate surfaces all of them as infrastructure errors, so
/// callers can tell "the task failed" apart from "the store is unreachable".
///
/// # Examples
///
/// ```
/// use remote_futures_store::StoreError;
///
/// let err = StoreError::NotFound { key: "app:tasks".to_string() };
/// assert!(err.to_string().contains("app:tasks"));
///
/// let err = StoreError::Protocol { message: "bad reply".to_string() };
/// assert_eq!(err.to_string(), "protocol error: bad reply");
/// ```
#[derive(Debug)]
pub enum StoreError {
    /// A stream or consumer group the operation requires does not exist.
    NotFound {
        /// The stream or group that was not found.
        key: String,
    },

    /// The backend answered with data the client could not interpret.
    Protocol {
        /// Human-readable description of the malformed reply.
        message: String,
    },

    /// An I/O or backend-specific error occurred (connection refused,
    /// timeout, server error).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available. Accessible via
        /// [`std::error::Error::source()`].
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Shorthand for a [`StoreError::Backend`] without an underlying source.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "not found: {key}"),
            Self::Protocol { message } => write!(f, "protocol error: {message}"),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_not_found() {
        let err = StoreError::NotFound {
            key: "app:workers".to_string(),
        };
        assert_eq!(err.to_string(), "not found: app:workers");
    }

    #[test]
    fn display_backend() {
        let err = StoreError::backend("connection refused");
        assert_eq!(err.to_string(), "backend error: connection refused");
    }

    #[test]
    fn source_backend_with_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StoreError::Backend {
            message: "read failed".to_string(),
            source: Some(Box::new(inner)),
        };
        let source = std::error::Error::source(&err);
        assert!(source.is_some_and(|s| s.to_string().contains("timed out")));
    }

    #[test]
    fn source_is_none_for_other_variants() {
        let err = StoreError::Protocol {
            message: "x".to_string(),
        };
        assert!(std::error::Error::source(&err).is_none());
        assert!(std::error::Error::source(&StoreError::backend("y")).is_none());
    }
}
