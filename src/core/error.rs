//! Error types for linkferry
//!
//! Every fault raised by the resolver, the transfer engine and the destination
//! collaborators is expressed as one [`Error`]. The queue worker is the single
//! place that turns an error into a failed job.

use std::fmt;

/// Hint appended to resolution failures so the user knows how to recover.
pub const DIRECT_LINK_HINT: &str =
    "Open it in a browser and copy the final download link (it should end with the file)";

/// Main error type for linkferry operations
#[derive(Debug)]
pub enum Error {
    /// The URL leads to a web page and no direct file could be located
    NotAFile(String),

    /// Connection reset, timeout or broken payload stream (retryable)
    NetworkError(String),

    /// HTTP error status or other non-retryable transport failure
    HttpError(String),

    /// The server answered with headers we cannot make sense of
    InvalidResponse(String),

    /// File I/O error
    IoError(std::io::Error),

    /// Invalid configuration or parameters
    InvalidInput(String),

    /// The destination storage refused or failed the upload
    DestinationError(String),

    /// The transfer was aborted by its caller
    Cancelled,
}

impl Error {
    /// Whether the transfer engine may retry after this error.
    ///
    /// Only transient network faults qualify; HTTP status errors, bad headers,
    /// local I/O problems and destination faults surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkError(_))
    }

    pub(crate) fn not_a_file(reason: impl Into<String>) -> Self {
        Error::NotAFile(reason.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotAFile(reason) => {
                write!(f, "{reason}. {DIRECT_LINK_HINT}.")
            }
            Error::NetworkError(msg) => {
                write!(f, "Network error: {msg}")
            }
            Error::HttpError(msg) => {
                write!(f, "HTTP error: {msg}")
            }
            Error::InvalidResponse(msg) => {
                write!(f, "Invalid server response: {msg}")
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {err}")
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
            Error::DestinationError(msg) => {
                write!(f, "Destination error: {msg}")
            }
            Error::Cancelled => {
                write!(f, "Transfer cancelled")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_status() || err.is_redirect() {
            Error::HttpError(err.to_string())
        } else if err.is_builder() {
            Error::InvalidInput(err.to_string())
        } else {
            // connect, timeout, request, body and decode failures are all
            // symptoms of a flaky connection
            Error::NetworkError(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidInput(format!("invalid URL: {err}"))
    }
}

/// Convenience result type for linkferry operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(Error::NetworkError("reset".into()).is_transient());
        assert!(!Error::HttpError("404 Not Found".into()).is_transient());
        assert!(!Error::not_a_file("no link").is_transient());
        assert!(!Error::DestinationError("quota".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::IoError(std::io::Error::other("disk")).is_transient());
    }

    #[test]
    fn test_not_a_file_carries_the_manual_link_hint() {
        let msg = Error::not_a_file("This URL opens a web page, not a direct file").to_string();
        assert!(msg.starts_with("This URL opens a web page"));
        assert!(msg.contains("copy the final download link"));
    }

    #[test]
    fn test_io_error_exposes_its_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
        assert!(Error::Cancelled.source().is_none());
    }
}
