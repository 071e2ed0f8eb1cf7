//! Operation model shared by every layer of the gateway.
//!
//! An [`Operation`] is the description of one remote action against a
//! Telegram account. It is validated once at the dispatcher boundary and then
//! travels unchanged through the session queue to the client capability.

use crate::id::{AccountKey, IdempotencyKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// Default number of messages returned by `fetch-history`.
pub const DEFAULT_HISTORY_LIMIT: u64 = 30;

/// Maximum number of messages a single `fetch-history` may request.
pub const MAX_HISTORY_LIMIT: u64 = 200;

/// Maximum length of an outgoing message text.
const MAX_MESSAGE_LEN: usize = 4096;

/// The kinds of remote action the gateway can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Send a text message to a peer.
    SendMessage,
    /// Fetch recent messages from a peer.
    FetchHistory,
    /// Join a channel or group.
    JoinEntity,
    /// Resolve a peer reference into entity details.
    ResolveEntity,
    /// Download a media file.
    DownloadMedia,
    /// Describe the authenticated account itself.
    GetMe,
}

impl OperationKind {
    /// All operation kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::SendMessage,
        Self::FetchHistory,
        Self::JoinEntity,
        Self::ResolveEntity,
        Self::DownloadMedia,
        Self::GetMe,
    ];

    /// Returns the kebab-case wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send-message",
            Self::FetchHistory => "fetch-history",
            Self::JoinEntity => "join-entity",
            Self::ResolveEntity => "resolve-entity",
            Self::DownloadMedia => "download-media",
            Self::GetMe => "get-me",
        }
    }

    /// Default token cost of this kind in the rate governor.
    ///
    /// Bulk reads cost more than single writes, mirroring the remote
    /// service's differentiated limits.
    #[must_use]
    pub fn default_weight(&self) -> u32 {
        match self {
            Self::SendMessage | Self::ResolveEntity | Self::GetMe => 1,
            Self::JoinEntity => 2,
            Self::DownloadMedia => 3,
            Self::FetchHistory => 5,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = InvalidOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| InvalidOperation::UnknownKind {
                kind: s.to_string(),
            })
    }
}

/// Reasons an operation is rejected before it reaches a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidOperation {
    /// The operation kind is not recognized.
    UnknownKind { kind: String },
    /// The payload is not a JSON object.
    PayloadNotObject,
    /// A required field is missing.
    MissingField { field: &'static str },
    /// A field has the wrong type or an out-of-range value.
    InvalidField { field: &'static str, reason: String },
}

impl fmt::Display for InvalidOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind { kind } => write!(f, "unknown operation kind '{kind}'"),
            Self::PayloadNotObject => write!(f, "payload must be a JSON object"),
            Self::MissingField { field } => write!(f, "missing required field '{field}'"),
            Self::InvalidField { field, reason } => {
                write!(f, "invalid field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for InvalidOperation {}

/// One remote action: a kind plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The operation kind.
    pub kind: OperationKind,
    /// Kind-specific parameters.
    pub payload: JsonValue,
}

impl Operation {
    /// Creates an operation with an empty payload.
    #[must_use]
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            payload: JsonValue::Object(Map::new()),
        }
    }

    /// Adds a payload parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        if let JsonValue::Object(ref mut map) = self.payload {
            map.insert(key.into(), value);
        }
        self
    }

    /// Sets the whole payload at once.
    #[must_use]
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Validates the payload shape and normalizes it in place.
    ///
    /// Peer references are reduced to a bare username or numeric id, and
    /// `fetch-history` gets its default `limit` and `offset_id` filled in.
    pub fn validate(mut self) -> Result<Self, InvalidOperation> {
        let JsonValue::Object(ref mut map) = self.payload else {
            return Err(InvalidOperation::PayloadNotObject);
        };

        match self.kind {
            OperationKind::SendMessage => {
                normalize_peer_field(map)?;
                let text = required_str(map, "text")?;
                if text.trim().is_empty() {
                    return Err(InvalidOperation::InvalidField {
                        field: "text",
                        reason: "must not be empty".to_string(),
                    });
                }
                if text.chars().count() > MAX_MESSAGE_LEN {
                    return Err(InvalidOperation::InvalidField {
                        field: "text",
                        reason: format!("must be at most {MAX_MESSAGE_LEN} characters"),
                    });
                }
            }
            OperationKind::FetchHistory => {
                normalize_peer_field(map)?;
                let limit = optional_u64(map, "limit")?.unwrap_or(DEFAULT_HISTORY_LIMIT);
                if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
                    return Err(InvalidOperation::InvalidField {
                        field: "limit",
                        reason: format!("must be between 1 and {MAX_HISTORY_LIMIT}"),
                    });
                }
                let offset_id = optional_u64(map, "offset_id")?.unwrap_or(0);
                map.insert("limit".to_string(), JsonValue::from(limit));
                map.insert("offset_id".to_string(), JsonValue::from(offset_id));
            }
            OperationKind::JoinEntity | OperationKind::ResolveEntity => {
                normalize_peer_field(map)?;
            }
            OperationKind::DownloadMedia => {
                let file_id = required_str(map, "file_id")?;
                if file_id.trim().is_empty() {
                    return Err(InvalidOperation::InvalidField {
                        field: "file_id",
                        reason: "must not be empty".to_string(),
                    });
                }
            }
            OperationKind::GetMe => {}
        }

        Ok(self)
    }
}

/// Reduces a peer reference to the form the client capability expects.
///
/// Accepts `@username`, `username`, `https://t.me/username` or a numeric id.
#[must_use]
pub fn normalize_peer(peer: &str) -> String {
    let trimmed = peer.trim();
    let without_url = ["https://t.me/", "http://t.me/", "t.me/"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);
    without_url
        .trim_start_matches('@')
        .trim_end_matches('/')
        .to_string()
}

fn normalize_peer_field(map: &mut Map<String, JsonValue>) -> Result<(), InvalidOperation> {
    let peer = match map.get("peer") {
        Some(JsonValue::String(s)) => normalize_peer(s),
        Some(JsonValue::Number(n)) if n.is_i64() => n.to_string(),
        Some(_) => {
            return Err(InvalidOperation::InvalidField {
                field: "peer",
                reason: "must be a username, t.me link or numeric id".to_string(),
            });
        }
        None => return Err(InvalidOperation::MissingField { field: "peer" }),
    };
    if peer.is_empty() {
        return Err(InvalidOperation::InvalidField {
            field: "peer",
            reason: "must not be empty".to_string(),
        });
    }
    map.insert("peer".to_string(), JsonValue::String(peer));
    Ok(())
}

fn required_str<'a>(
    map: &'a Map<String, JsonValue>,
    field: &'static str,
) -> Result<&'a str, InvalidOperation> {
    match map.get(field) {
        Some(JsonValue::String(s)) => Ok(s),
        Some(_) => Err(InvalidOperation::InvalidField {
            field,
            reason: "must be a string".to_string(),
        }),
        None => Err(InvalidOperation::MissingField { field }),
    }
}

fn optional_u64(
    map: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<Option<u64>, InvalidOperation> {
    match map.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| InvalidOperation::InvalidField {
                field,
                reason: "must be a non-negative integer".to_string(),
            }),
    }
}

/// A request to perform an operation on behalf of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// The account the operation runs as.
    pub account: AccountKey,
    /// What to do.
    pub operation: Operation,
    /// Optional caller-supplied deduplication token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl OperationRequest {
    /// Creates a request without an idempotency token.
    #[must_use]
    pub fn new(account: AccountKey, operation: Operation) -> Self {
        Self {
            account,
            operation,
            idempotency_key: None,
        }
    }

    /// Attaches an idempotency token.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in OperationKind::ALL {
            let parsed: OperationKind = kind.as_str().parse().expect("known kind");
            assert_eq!(parsed, kind);
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "delete-everything".parse::<OperationKind>().unwrap_err();
        assert!(err.to_string().contains("delete-everything"));
    }

    #[test]
    fn bulk_reads_weigh_more_than_sends() {
        assert!(
            OperationKind::FetchHistory.default_weight()
                > OperationKind::SendMessage.default_weight()
        );
    }

    #[test]
    fn normalize_peer_strips_links_and_at() {
        assert_eq!(normalize_peer("@durov"), "durov");
        assert_eq!(normalize_peer("https://t.me/durov"), "durov");
        assert_eq!(normalize_peer(" t.me/durov/ "), "durov");
        assert_eq!(normalize_peer("-1001234567890"), "-1001234567890");
    }

    #[test]
    fn send_message_requires_peer_and_text() {
        let missing = Operation::new(OperationKind::SendMessage)
            .with_param("text", json!("hi"))
            .validate()
            .unwrap_err();
        assert_eq!(missing, InvalidOperation::MissingField { field: "peer" });

        let empty = Operation::new(OperationKind::SendMessage)
            .with_param("peer", json!("@news"))
            .with_param("text", json!("   "))
            .validate()
            .unwrap_err();
        assert!(matches!(empty, InvalidOperation::InvalidField { field: "text", .. }));

        let ok = Operation::new(OperationKind::SendMessage)
            .with_param("peer", json!("https://t.me/news"))
            .with_param("text", json!("hello"))
            .validate()
            .expect("valid");
        assert_eq!(ok.payload["peer"], "news");
    }

    #[test]
    fn fetch_history_fills_defaults_and_bounds_limit() {
        let op = Operation::new(OperationKind::FetchHistory)
            .with_param("peer", json!("news"))
            .validate()
            .expect("valid");
        assert_eq!(op.payload["limit"], DEFAULT_HISTORY_LIMIT);
        assert_eq!(op.payload["offset_id"], 0);

        let too_many = Operation::new(OperationKind::FetchHistory)
            .with_param("peer", json!("news"))
            .with_param("limit", json!(201))
            .validate()
            .unwrap_err();
        assert!(matches!(too_many, InvalidOperation::InvalidField { field: "limit", .. }));

        let negative = Operation::new(OperationKind::FetchHistory)
            .with_param("peer", json!("news"))
            .with_param("offset_id", json!(-4))
            .validate()
            .unwrap_err();
        assert!(matches!(negative, InvalidOperation::InvalidField { field: "offset_id", .. }));
    }

    #[test]
    fn numeric_peer_is_accepted() {
        let op = Operation::new(OperationKind::ResolveEntity)
            .with_param("peer", json!(-1001234))
            .validate()
            .expect("valid");
        assert_eq!(op.payload["peer"], "-1001234");
    }

    #[test]
    fn payload_must_be_object() {
        let err = Operation::new(OperationKind::GetMe)
            .with_payload(json!([1, 2]))
            .validate()
            .unwrap_err();
        assert_eq!(err, InvalidOperation::PayloadNotObject);
    }

    #[test]
    fn download_media_requires_file_id() {
        let err = Operation::new(OperationKind::DownloadMedia)
            .validate()
            .unwrap_err();
        assert_eq!(err, InvalidOperation::MissingField { field: "file_id" });
    }
}
