//! Error types shared across the client.
//!
//! Transport failures are classified once, here, so that the health monitor
//! and the chat pipeline agree on what a timeout or a gateway error is.

use thiserror::Error;

use crate::ids::TurnId;

/// A result type using `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures surfaced by a transport while opening or reading a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not produce a response within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection refused, DNS failure, reset, or any other network-level failure.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The server answered with a non-success HTTP status.
    #[error("service error: {0}")]
    HttpStatus(u16),

    /// The caller cancelled the stream. Not a failure.
    #[error("cancelled")]
    Cancelled,

    /// The request could not be built or the peer spoke an unexpected protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether this error is a user-initiated cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short message suitable for showing in place of a failed assistant turn.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::HttpStatus(502 | 503) => {
                "AI service temporarily unavailable. Please try again in a moment.".to_string()
            }
            Self::HttpStatus(403) => {
                "Access denied. Please check the tunnel configuration.".to_string()
            }
            Self::HttpStatus(code) => format!("Service error ({code}). Please try again."),
            Self::NetworkFailure(_) => {
                "Network connection failed. Please check the tunnel URL and try again.".to_string()
            }
            Self::Timeout => "The request timed out. Please try again.".to_string(),
            Self::Cancelled => "Generation stopped.".to_string(),
            Self::Protocol(_) => "Failed to get response. Please try again.".to_string(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::HttpStatus(status.as_u16())
        } else if err.is_builder() {
            Self::Protocol(err.to_string())
        } else {
            Self::NetworkFailure(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => Self::HttpStatus(response.status().as_u16()),
            WsError::Url(e) => Self::Protocol(e.to_string()),
            WsError::Io(e) => Self::NetworkFailure(e.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::NetworkFailure("connection closed".to_string())
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Failures reading or writing the persisted conversation.
///
/// These are logged and swallowed by the pipeline; the in-memory
/// conversation stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data is not valid JSON for a session.
    #[error("stored session is malformed: {0}")]
    Json(#[from] serde_json::Error),

    /// No platform data directory could be determined.
    #[error("could not determine a storage directory")]
    NoStorageDir,
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON.
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reasons the pipeline refused to start a turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejected {
    /// A generation is already in progress.
    #[error("a response is already being generated")]
    Busy,

    /// The message is empty or whitespace.
    #[error("message is empty")]
    EmptyInput,

    /// The backend is not known to be reachable.
    #[error("Unable to connect to AI service: {0}")]
    NotConnected(String),

    /// The referenced turn is not in the conversation.
    #[error("turn {0} not found")]
    UnknownTurn(TurnId),

    /// There is no user turn to regenerate from.
    #[error("nothing to regenerate")]
    NothingToRegenerate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_share_a_message() {
        assert_eq!(
            TransportError::HttpStatus(502).user_message(),
            TransportError::HttpStatus(503).user_message()
        );
        assert!(TransportError::HttpStatus(503)
            .user_message()
            .contains("temporarily unavailable"));
    }

    #[test]
    fn forbidden_mentions_access() {
        assert!(TransportError::HttpStatus(403)
            .user_message()
            .starts_with("Access denied"));
    }

    #[test]
    fn other_status_includes_code() {
        assert!(TransportError::HttpStatus(500).user_message().contains("500"));
    }

    #[test]
    fn network_failure_message() {
        let err = TransportError::NetworkFailure("connection refused".into());
        assert!(err.user_message().starts_with("Network connection failed"));
    }

    #[test]
    fn only_cancelled_is_cancelled() {
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(!TransportError::Timeout.is_cancelled());
    }
}
