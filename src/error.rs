use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error types for the exporter.
///
/// Every failure maps onto one of a small set of categories (see
/// [`ErrorKind`]) so callers can decide whether a retry makes sense
/// without matching on messages.

/// Represents all possible errors that can occur in the application.
///
/// # Error Categories
///
/// - Auth: missing, invalid or expired credentials
/// - NotFound: the spreadsheet id does not resolve or is not permitted
/// - Transport: network and HTTP failures
/// - Io: local file system failures, including workbook writes
/// - InvalidArgument: empty batches, unusable paths, unparseable ids
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Spreadsheet not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("{failed} of {total} exports failed; first error: {first_error}")]
    BatchFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },
}

/// High-level classification of an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    NotFound,
    Transport,
    Io,
    InvalidArgument,
    Deadline,
    Batch,
}

impl ErrorKind {
    /// Returns true if re-invoking the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Deadline)
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Auth(_) => ErrorKind::Auth,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Transport(_) => ErrorKind::Transport,
            AppError::Io(_) => ErrorKind::Io,
            AppError::InvalidArgument(_) | AppError::UrlParse(_) => ErrorKind::InvalidArgument,
            // Malformed payloads come from the API side of the wire
            AppError::Json(_) => ErrorKind::Transport,
            AppError::DeadlineExceeded(_) => ErrorKind::Deadline,
            AppError::BatchFailed { .. } => ErrorKind::Batch,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Transport(error.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for AppError {
    fn from(error: rust_xlsxwriter::XlsxError) -> Self {
        AppError::Io(io::Error::other(error.to_string()))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(error: tokio::task::JoinError) -> Self {
        AppError::Io(io::Error::other(format!("writer task failed: {}", error)))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(AppError::Auth("expired".into()).kind(), ErrorKind::Auth);
        assert_eq!(AppError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            AppError::Io(io::Error::other("disk full")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            AppError::InvalidArgument("empty".into()).kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::Deadline.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Io.is_retryable());
    }

    #[test]
    fn xlsx_errors_become_io() {
        let err: AppError = rust_xlsxwriter::XlsxError::ParameterError("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn batch_failure_message_names_first_error() {
        let err = AppError::BatchFailed {
            failed: 1,
            total: 2,
            first_error: "Spreadsheet not found: B".into(),
        };
        let text = err.to_string();
        assert!(text.contains("1 of 2"));
        assert!(text.contains("Spreadsheet not found: B"));
    }
}
