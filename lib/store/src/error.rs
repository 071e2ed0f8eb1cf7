//! Error types for the store crate.
//!
//! - `StoreError`: failures reading or writing account records
//! - `CipherError`: failures sealing or opening credential blobs

use std::fmt;
use thinkone_core::AccountKey;

/// Errors from account store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No account is registered under this key.
    NotFound { key: AccountKey },
    /// The backing storage could not be reached. Transient.
    Unavailable { reason: String },
    /// A stored record could not be decoded.
    Corrupted { key: Option<AccountKey>, reason: String },
    /// The store URI is not understood.
    InvalidUri { uri: String },
}

impl StoreError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "account not found: {key}"),
            Self::Unavailable { reason } => write!(f, "account store unavailable: {reason}"),
            Self::Corrupted {
                key: Some(key),
                reason,
            } => write!(f, "stored account '{key}' is corrupted: {reason}"),
            Self::Corrupted { key: None, reason } => {
                write!(f, "stored account is corrupted: {reason}")
            }
            Self::InvalidUri { uri } => write!(f, "unsupported store uri: {uri}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => Self::Corrupted {
                key: None,
                reason: e.to_string(),
            },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from credential encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// The key reference is malformed or its source is missing.
    KeySource { reason: String },
    /// Key material has the wrong length or encoding.
    InvalidKey { reason: String },
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// Decryption failed: wrong key, wrong account, or tampered blob.
    DecryptionFailed { reason: String },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeySource { reason } => write!(f, "encryption key source error: {reason}"),
            Self::InvalidKey { reason } => write!(f, "invalid encryption key: {reason}"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
        }
    }
}

impl std::error::Error for CipherError {}
