//! Strongly-typed identifiers.
//!
//! Generated identifiers use ULID (Universally Unique Lexicographically
//! Sortable Identifier) format, providing both uniqueness and temporal
//! ordering. Caller-chosen identifiers (account keys, idempotency tokens) are
//! validated string newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let ulid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Unique identifier for a dispatched operation request.
    RequestId,
    "req"
);

define_id!(
    /// Unique identifier for one live session of an account.
    ///
    /// A new id is minted every time a session is created, so a reconnect
    /// after idle release is distinguishable from the session it replaced.
    SessionId,
    "sess"
);

/// Maximum length of an account key.
const ACCOUNT_KEY_MAX_LEN: usize = 64;

/// Maximum length of an idempotency token.
const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;

/// Stable key identifying a managed Telegram account.
///
/// Keys are chosen by the operator at registration time and are limited to
/// ASCII letters, digits, `_`, `-` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountKey(String);

impl AccountKey {
    /// Creates an account key, validating its format.
    pub fn new(key: impl Into<String>) -> Result<Self, ParseIdError> {
        let key = key.into();
        if key.is_empty() || key.len() > ACCOUNT_KEY_MAX_LEN {
            return Err(ParseIdError {
                id_type: "AccountKey",
                reason: format!("length must be between 1 and {ACCOUNT_KEY_MAX_LEN}"),
            });
        }
        if let Some(bad) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(ParseIdError {
                id_type: "AccountKey",
                reason: format!("invalid character '{bad}'"),
            });
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountKey {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountKey {
    type Error = ParseIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<AccountKey> for String {
    fn from(key: AccountKey) -> Self {
        key.0
    }
}

/// Caller-supplied token used to deduplicate retried requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Creates an idempotency key, validating its length and charset.
    pub fn new(token: impl Into<String>) -> Result<Self, ParseIdError> {
        let token = token.into();
        if token.is_empty() || token.len() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(ParseIdError {
                id_type: "IdempotencyKey",
                reason: format!("length must be between 1 and {IDEMPOTENCY_KEY_MAX_LEN}"),
            });
        }
        if !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ParseIdError {
                id_type: "IdempotencyKey",
                reason: "must be printable ASCII without spaces".to_string(),
            });
        }
        Ok(Self(token))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = ParseIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_display_format() {
        let id = RequestId::new();
        assert!(id.to_string().starts_with("req_"));
    }

    #[test]
    fn session_id_parse_with_and_without_prefix() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);

        let raw: SessionId = id.as_ulid().to_string().parse().expect("should parse");
        assert_eq!(id, raw);
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "not_a_ulid".parse::<RequestId>().unwrap_err();
        assert_eq!(err.id_type, "RequestId");
    }

    #[test]
    fn account_key_accepts_simple_names() {
        for key in ["acct1", "news-bot", "team.alpha_2"] {
            assert!(AccountKey::new(key).is_ok(), "{key} should be valid");
        }
    }

    #[test]
    fn account_key_rejects_bad_input() {
        assert!(AccountKey::new("").is_err());
        assert!(AccountKey::new("has space").is_err());
        assert!(AccountKey::new("slash/key").is_err());
        assert!(AccountKey::new("a".repeat(65)).is_err());
    }

    #[test]
    fn account_key_serde_validates() {
        let key: AccountKey = serde_json::from_str("\"acct1\"").expect("deserialize");
        assert_eq!(key.as_str(), "acct1");
        assert!(serde_json::from_str::<AccountKey>("\"bad key\"").is_err());
    }

    #[test]
    fn idempotency_key_validation() {
        assert!(IdempotencyKey::new("retry-7f3a").is_ok());
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("with space").is_err());
        assert!(IdempotencyKey::new("x".repeat(129)).is_err());
    }
}
