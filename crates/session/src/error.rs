//! Session error types.

use std::time::Duration;

use crate::types::AuthState;

/// A failed remote call, as reported by a backend connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote call timed out")]
    Timeout,

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("checksum mismatch for part {remote_id}")]
    ChecksumMismatch { remote_id: String },

    #[error("connection closed")]
    Closed,

    #[error("destination channel missing")]
    MissingDestination,

    #[error("credentials revoked")]
    CredentialRevoked,

    #[error("part not found: {0}")]
    NotFound(String),

    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    #[error("request rejected {code}: {message}")]
    Rejected { code: u16, message: String },
}

impl BackendError {
    /// Returns `true` if the same call may succeed when repeated.
    ///
    /// Everything else is structural: retrying cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::RateLimited { .. }
                | Self::Timeout
                | Self::Server { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Closed
        )
    }

    /// Server-mandated wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not ready (state: {0})")]
    NotReady(AuthState),

    #[error("operation not valid in state {0}")]
    WrongState(AuthState),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("timed out waiting for authorization (state: {0})")]
    AuthTimeout(AuthState),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(BackendError::RateLimited { retry_after: None }.is_transient());
        assert!(BackendError::Timeout.is_transient());
        assert!(
            BackendError::Server {
                code: 502,
                message: "bad gateway".into()
            }
            .is_transient()
        );
        assert!(BackendError::Closed.is_transient());

        assert!(!BackendError::MissingDestination.is_transient());
        assert!(!BackendError::CredentialRevoked.is_transient());
        assert!(!BackendError::NotFound("x".into()).is_transient());
        assert!(!BackendError::Unsupported("qr".into()).is_transient());
    }

    #[test]
    fn retry_after_only_for_rate_limit() {
        let limited = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(BackendError::Timeout.retry_after(), None);
    }

    #[test]
    fn not_ready_message_names_state() {
        let err = SessionError::NotReady(AuthState::AwaitingSecondFactor);
        assert_eq!(
            err.to_string(),
            "session not ready (state: awaiting-second-factor)"
        );
    }
}
