//! Error types for the qfarm analysis pipeline.

use std::{error::Error, fmt, io};

/// Error type for qfarm core operations.
#[derive(Debug)]
pub enum QfarmError {
    /// An underlying I/O error.
    Io(io::Error),
    /// A record could not be encoded or decoded.
    Serialization(serde_json::Error),
    /// Caller supplied input that cannot be processed.
    Validation(String),
    /// An expected entry (queue item, prior build) does not exist.
    NotFound(String),
    /// An external tool could not be executed.
    Execution(String),
    /// Tool output or a data file could not be parsed.
    Parse(String),
    /// The shared store rejected or failed an operation.
    Storage(String),
    /// A catch-all error with a message.
    Other(String),
}

impl QfarmError {
    /// Whether the error is an expected absence rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl fmt::Display for QfarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::Validation(message) => write!(f, "invalid input: {message}"),
            Self::NotFound(message) => write!(f, "not found: {message}"),
            Self::Execution(message) => write!(f, "execution failed: {message}"),
            Self::Parse(message) => write!(f, "parse error: {message}"),
            Self::Storage(message) => write!(f, "storage error: {message}"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

impl Error for QfarmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for QfarmError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for QfarmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Convenience result type for qfarm core.
pub type Result<T> = std::result::Result<T, QfarmError>;

#[cfg(test)]
mod tests {
    use super::QfarmError;
    use std::io;

    #[test]
    fn io_error_formats_message() {
        let error = QfarmError::Io(io::Error::other("boom"));
        assert_eq!(format!("{error}"), "io error: boom");
    }

    #[test]
    fn categorized_errors_format_with_prefix() {
        let error = QfarmError::Execution("golint: not on PATH".to_string());
        assert_eq!(format!("{error}"), "execution failed: golint: not on PATH");

        let error = QfarmError::Parse("line 3: bad cursor".to_string());
        assert_eq!(format!("{error}"), "parse error: line 3: bad cursor");
    }

    #[test]
    fn from_io_error_maps_variant() {
        let error: QfarmError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        match error {
            QfarmError::Io(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected Io variant, got {other:?}"),
        }
    }

    #[test]
    fn not_found_is_distinguished() {
        assert!(QfarmError::NotFound("queue empty".to_string()).is_not_found());
        assert!(!QfarmError::Storage("down".to_string()).is_not_found());
    }
}
