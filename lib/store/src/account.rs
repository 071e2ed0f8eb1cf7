//! Account records and credential material.
//!
//! Plaintext credentials only exist as [`Credential`] values, which redact
//! themselves in `Debug` output. What the store persists is the
//! [`SealedCredential`] produced by [`CredentialCipher`](crate::CredentialCipher).

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use thinkone_core::AccountKey;

/// Connection status of a managed account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// No live connection; credentials retained.
    Unauthenticated,
    /// A connection attempt is in progress.
    Authenticating,
    /// Connected and serving operations.
    Connected,
    /// Reconnection attempts were exhausted; the next operation retries.
    Degraded,
    /// The credential was rejected. Terminal until re-registration.
    Revoked,
}

impl AccountStatus {
    /// Returns the persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Revoked => "revoked",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unauthenticated" => Some(Self::Unauthenticated),
            "authenticating" => Some(Self::Authenticating),
            "connected" => Some(Self::Connected),
            "degraded" => Some(Self::Degraded),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of authentication material an account uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// A Bot API token issued by @BotFather.
    BotToken,
    /// An exported user-client session string.
    SessionString,
}

/// Plaintext authentication material for one account.
pub struct Credential {
    kind: CredentialKind,
    secret: SecretString,
}

impl Credential {
    /// Wraps plaintext credential material.
    #[must_use]
    pub fn new(kind: CredentialKind, secret: impl Into<String>) -> Self {
        Self {
            kind,
            secret: SecretString::new(secret.into()),
        }
    }

    /// Creates a bot token credential.
    #[must_use]
    pub fn bot_token(token: impl Into<String>) -> Self {
        Self::new(CredentialKind::BotToken, token)
    }

    /// Returns the credential kind.
    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// Returns the secret.
    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub(crate) fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// An encrypted credential blob.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredential(Vec<u8>);

impl SealedCredential {
    /// Wraps ciphertext loaded from storage.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the ciphertext.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedCredential({} bytes)", self.0.len())
    }
}

/// A persisted account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Stable account key.
    pub key: AccountKey,
    /// Encrypted credential.
    pub credential: SealedCredential,
    /// Last known connection status.
    pub status: AccountStatus,
    /// When the account last changed status.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// When the account was first registered.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Creates a freshly registered account.
    #[must_use]
    pub fn new(key: AccountKey, credential: SealedCredential) -> Self {
        let now = Utc::now();
        Self {
            key,
            credential,
            status: AccountStatus::Unauthenticated,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the credential has been rejected by Telegram.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.status == AccountStatus::Revoked
    }

    /// Updates the status and last-seen timestamp.
    pub fn mark_status(&mut self, status: AccountStatus) {
        let now = Utc::now();
        self.status = status;
        self.last_seen_at = Some(now);
        self.updated_at = now;
    }
}
