//! The gateway's external error taxonomy.
//!
//! Every failure that leaves the dispatcher is one of these variants. Each
//! carries a stable machine-readable code and says whether retrying the
//! same request can help.

use std::fmt;
use std::time::Duration;
use thinkone_core::{AccountKey, InvalidOperation};
use thinkone_session::{CloseReason, SessionError};
use thinkone_store::{CipherError, StoreError};

/// Errors returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No account is registered under this key.
    AccountNotFound { account: AccountKey },
    /// The account's credential was revoked; it must be re-registered.
    AuthRevoked { account: AccountKey },
    /// The account must wait before retrying.
    RateLimited { retry_after: Duration },
    /// Telegram could not be reached.
    TransportTransient { reason: String },
    /// The account store could not be reached.
    StorageUnavailable { reason: String },
    /// The request is malformed or was refused as such.
    InvalidOperation { reason: String },
    /// The operation did not finish within the caller's deadline.
    Timeout { after: Duration },
}

impl GatewayError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound { .. } => "account_not_found",
            Self::AuthRevoked { .. } => "auth_revoked",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransportTransient { .. } => "transport_transient",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::InvalidOperation { .. } => "invalid_operation",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Returns true if the same request may succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::TransportTransient { .. }
                | Self::StorageUnavailable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns the suggested wait before retrying, if known.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns the suggested wait in whole seconds, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|wait| {
            let secs = wait.as_secs();
            if wait.subsec_nanos() > 0 { secs + 1 } else { secs }
        })
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountNotFound { account } => write!(f, "account '{account}' not found"),
            Self::AuthRevoked { account } => write!(
                f,
                "credential for account '{account}' was revoked; re-register the account"
            ),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited; retry after {}ms", retry_after.as_millis())
            }
            Self::TransportTransient { reason } => write!(f, "telegram unreachable: {reason}"),
            Self::StorageUnavailable { reason } => write!(f, "account storage unavailable: {reason}"),
            Self::InvalidOperation { reason } => write!(f, "invalid operation: {reason}"),
            Self::Timeout { after } => {
                write!(f, "operation timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AccountNotFound { account } => Self::AccountNotFound { account },
            SessionError::AuthRevoked { account } => Self::AuthRevoked { account },
            SessionError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            SessionError::Transport { reason } => Self::TransportTransient { reason },
            SessionError::Storage { reason } => Self::StorageUnavailable { reason },
            SessionError::Rejected { reason } => Self::InvalidOperation { reason },
            SessionError::Closed { reason } => Self::TransportTransient {
                reason: closed_reason(reason),
            },
        }
    }
}

fn closed_reason(reason: CloseReason) -> String {
    format!("session closed ({reason}) before the operation ran")
}

impl From<InvalidOperation> for GatewayError {
    fn from(err: InvalidOperation) -> Self {
        Self::InvalidOperation {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => Self::AccountNotFound { account: key },
            other => Self::StorageUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<CipherError> for GatewayError {
    fn from(err: CipherError) -> Self {
        Self::StorageUnavailable {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AccountKey {
        AccountKey::new("acct1").expect("valid key")
    }

    #[test]
    fn codes_and_retryability() {
        let cases = [
            (GatewayError::AccountNotFound { account: key() }, "account_not_found", false),
            (GatewayError::AuthRevoked { account: key() }, "auth_revoked", false),
            (
                GatewayError::RateLimited {
                    retry_after: Duration::from_secs(3),
                },
                "rate_limited",
                true,
            ),
            (
                GatewayError::TransportTransient {
                    reason: "reset".to_string(),
                },
                "transport_transient",
                true,
            ),
            (
                GatewayError::StorageUnavailable {
                    reason: "locked".to_string(),
                },
                "storage_unavailable",
                true,
            ),
            (
                GatewayError::InvalidOperation {
                    reason: "bad".to_string(),
                },
                "invalid_operation",
                false,
            ),
            (
                GatewayError::Timeout {
                    after: Duration::from_secs(30),
                },
                "timeout",
                true,
            ),
        ];
        for (err, code, retryable) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.is_retryable(), retryable, "{code}");
        }
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        let err = GatewayError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = GatewayError::RateLimited {
            retry_after: Duration::from_secs(4),
        };
        assert_eq!(err.retry_after_secs(), Some(4));

        assert_eq!(
            GatewayError::AuthRevoked { account: key() }.retry_after_secs(),
            None
        );
    }

    #[test]
    fn session_errors_translate() {
        assert_eq!(
            GatewayError::from(SessionError::Rejected {
                reason: "PEER_ID_INVALID".to_string()
            })
            .code(),
            "invalid_operation"
        );
        assert_eq!(
            GatewayError::from(SessionError::Closed {
                reason: CloseReason::Logout
            })
            .code(),
            "transport_transient"
        );
    }

    #[test]
    fn store_not_found_is_account_not_found() {
        let err = GatewayError::from(StoreError::NotFound { key: key() });
        assert_eq!(err, GatewayError::AccountNotFound { account: key() });
    }
}
