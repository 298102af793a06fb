//! Remote store errors
//!
//! Typed errors for backend operations, classified into transient
//! failures (retried by the sync engine) and terminal ones.

use std::time::Duration;

use thiserror::Error;

/// Why the backend is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkReason {
    /// No connectivity
    NoInternet,
    /// No account signed in on this device
    NotSignedIn,
    /// Sync disabled for this app/account
    Disabled,
    /// Account storage quota exhausted
    QuotaExceeded,
}

impl std::fmt::Display for NetworkReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkReason::NoInternet => "no internet connection",
            NetworkReason::NotSignedIn => "not signed in",
            NetworkReason::Disabled => "sync disabled",
            NetworkReason::QuotaExceeded => "storage quota exceeded",
        };
        f.write_str(s)
    }
}

/// Errors returned by remote store operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(NetworkReason),

    /// Backend asked us to slow down, optionally with a hint
    #[error("Rate limited by remote store")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Remote zone not found")]
    ZoneNotFound,

    #[error("Remote record not found")]
    RecordNotFound,

    /// Backend rejected a create because the item already exists
    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// Whether the sync engine should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkUnavailable(NetworkReason::NoInternet)
                | RemoteError::RateLimited { .. }
        )
    }

    /// Backend-provided minimum wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn rate_limited() -> Self {
        RemoteError::RateLimited { retry_after: None }
    }

    pub fn no_internet() -> Self {
        RemoteError::NetworkUnavailable(NetworkReason::NoInternet)
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::no_internet().is_transient());
        assert!(RemoteError::rate_limited().is_transient());

        assert!(!RemoteError::NetworkUnavailable(NetworkReason::NotSignedIn).is_transient());
        assert!(!RemoteError::NetworkUnavailable(NetworkReason::Disabled).is_transient());
        assert!(!RemoteError::NetworkUnavailable(NetworkReason::QuotaExceeded).is_transient());
        assert!(!RemoteError::ZoneNotFound.is_transient());
        assert!(!RemoteError::RecordNotFound.is_transient());
        assert!(!RemoteError::Unknown("boom".into()).is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(RemoteError::ZoneNotFound.retry_after(), None);
    }

    #[test]
    fn test_error_display() {
        let msg = RemoteError::NetworkUnavailable(NetworkReason::QuotaExceeded).to_string();
        assert!(msg.contains("quota exceeded"));
    }
}
