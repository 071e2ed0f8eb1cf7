//! The external Telegram client capability.
//!
//! A [`TelegramClient`] establishes authenticated connections; a
//! [`Connection`] is owned by exactly one session worker and carries that
//! account's operations one at a time.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use thinkone_core::{AccountKey, Operation};
use thinkone_store::Credential;

/// Establishes connections to Telegram.
#[async_trait]
pub trait TelegramClient: Send + Sync {
    /// Authenticates `account` with `credential` and returns a live
    /// connection.
    async fn connect(
        &self,
        account: &AccountKey,
        credential: &Credential,
    ) -> Result<Box<dyn Connection>, ConnectError>;
}

/// A live, authenticated connection for one account.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Performs one operation.
    async fn send(&mut self, operation: &Operation) -> Result<JsonValue, SendError>;

    /// Closes the connection. Called at most once, before the value is dropped.
    async fn close(&mut self);
}

/// Errors establishing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Telegram rejected the credential.
    AuthRejected { reason: String },
    /// The connection could not be established. Transient.
    Transport { reason: String },
}

impl ConnectError {
    /// Returns true if a later attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRejected { reason } => write!(f, "credential rejected: {reason}"),
            Self::Transport { reason } => write!(f, "connection failed: {reason}"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Errors performing an operation on a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Telegram asked the account to pause for this many seconds.
    FloodWait { seconds: u64 },
    /// The connection dropped or the remote side failed. Transient.
    Transport { reason: String },
    /// The credential is no longer accepted.
    AuthRejected { reason: String },
    /// Telegram refused this particular request.
    Rejected { reason: String },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FloodWait { seconds } => write!(f, "flood wait of {seconds}s"),
            Self::Transport { reason } => write!(f, "transport failure: {reason}"),
            Self::AuthRejected { reason } => write!(f, "credential rejected: {reason}"),
            Self::Rejected { reason } => write!(f, "request rejected: {reason}"),
        }
    }
}

impl std::error::Error for SendError {}
