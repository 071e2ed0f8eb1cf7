//! Error types for the session crate.

use std::fmt;
use std::time::Duration;
use thinkone_core::AccountKey;
use thinkone_store::StoreError;

use crate::CloseReason;

/// Errors returned to callers of the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No account is registered under this key.
    AccountNotFound { account: AccountKey },
    /// The account's credential has been revoked.
    AuthRevoked { account: AccountKey },
    /// The account must wait before this operation can run.
    RateLimited { retry_after: Duration },
    /// Telegram could not be reached after bounded retries.
    Transport { reason: String },
    /// The account store could not be reached after bounded retries, or a
    /// stored credential could not be read.
    Storage { reason: String },
    /// Telegram refused the request.
    Rejected { reason: String },
    /// The session was torn down before the operation ran.
    Closed { reason: CloseReason },
}

impl SessionError {
    pub(crate) fn from_store(account: &AccountKey, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::AccountNotFound {
                account: account.clone(),
            },
            other => Self::Storage {
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountNotFound { account } => write!(f, "account not found: {account}"),
            Self::AuthRevoked { account } => {
                write!(f, "credential for account '{account}' has been revoked")
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}ms", retry_after.as_millis())
            }
            Self::Transport { reason } => write!(f, "telegram unreachable: {reason}"),
            Self::Storage { reason } => write!(f, "account storage failure: {reason}"),
            Self::Rejected { reason } => write!(f, "telegram rejected the request: {reason}"),
            Self::Closed { reason } => write!(f, "session closed: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}
