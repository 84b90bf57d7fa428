//! Error taxonomy for the delivery pipeline
//!
//! Kinds map one-to-one to handling policy: feed errors reconnect, cursor
//! errors retry on the next flush, delivery errors split into retryable and
//! terminal, and store errors around history/DLQ are logged but never fail
//! the delivery that triggered them.

use thiserror::Error;

/// Errors from the upstream change feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("feed connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("feed rejected resume token: {message}")]
    InvalidResumeToken { message: String },

    #[error("feed closed")]
    Closed,
}

/// Errors persisting or loading the resume cursor.
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("cursor token failed validation")]
    InvalidToken,
}

/// Transport-level delivery failures, before HTTP status classification.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {message}")]
    Connect { message: String },

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("response body exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("invalid target url: {message}")]
    InvalidUrl { message: String },

    #[error("request failed: {message}")]
    Other { message: String },
}

impl TransportError {
    /// Oversized responses and malformed URLs are terminal; everything else
    /// at the transport level is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::ResponseTooLarge { .. } | TransportError::InvalidUrl { .. }
        )
    }
}

/// Errors from the DLQ surface (store failures are swallowed internally).
#[derive(Error, Debug)]
pub enum DlqError {
    #[error("no dead-letter entry with id {id}")]
    NotFound { id: String },

    #[error("entry {id} is already being retried")]
    AlreadyRetrying { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryability() {
        assert!(TransportError::Connect {
            message: "refused".into()
        }
        .is_retryable());
        assert!(TransportError::Timeout { timeout_ms: 30_000 }.is_retryable());
        assert!(!TransportError::ResponseTooLarge { limit: 1024 }.is_retryable());
        assert!(!TransportError::InvalidUrl {
            message: "no scheme".into()
        }
        .is_retryable());
    }
}
