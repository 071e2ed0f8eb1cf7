//! Bot API request building and response classification.
//!
//! Everything here is pure: the HTTP round trip lives in
//! [`client`](crate::client).

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use thinkone_core::{Operation, OperationKind};
use thinkone_session::SendError;

/// Flood wait assumed when Telegram answers 429 without `retry_after`.
const DEFAULT_FLOOD_WAIT_SECS: u64 = 1;

/// The Bot API response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: JsonValue,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// One Bot API method call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: &'static str,
    pub params: JsonValue,
}

impl ApiCall {
    fn new(method: &'static str, params: JsonValue) -> Self {
        Self { method, params }
    }
}

/// Classifies a Bot API response by HTTP status and envelope.
///
/// # Errors
///
/// - 429 becomes `FloodWait` with the server's `retry_after`
/// - 401 becomes `AuthRejected`
/// - other 4xx become `Rejected`
/// - 5xx and unparseable bodies become `Transport`
pub fn classify_response(status: u16, body: &[u8]) -> Result<JsonValue, SendError> {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Err(SendError::Transport {
                reason: format!("unreadable response (HTTP {status}): {e}"),
            });
        }
    };
    if envelope.ok && (200..300).contains(&status) {
        return Ok(envelope.result);
    }

    let code = envelope.error_code.unwrap_or(status);
    let description = envelope
        .description
        .unwrap_or_else(|| format!("HTTP {code}"));
    match code {
        429 => Err(SendError::FloodWait {
            seconds: envelope
                .parameters
                .and_then(|p| p.retry_after)
                .unwrap_or(DEFAULT_FLOOD_WAIT_SECS),
        }),
        401 => Err(SendError::AuthRejected {
            reason: description,
        }),
        400..=499 => Err(SendError::Rejected {
            reason: description,
        }),
        _ => Err(SendError::Transport {
            reason: description,
        }),
    }
}

/// Converts a normalized peer into a Bot API `chat_id`.
///
/// Numeric ids stay numbers; usernames get their `@` back.
#[must_use]
pub fn chat_id(peer: &str) -> JsonValue {
    match peer.parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(format!("@{peer}")),
    }
}

fn peer(operation: &Operation) -> Result<&str, SendError> {
    operation
        .payload
        .get("peer")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SendError::Rejected {
            reason: "missing peer".to_string(),
        })
}

fn str_field<'a>(operation: &'a Operation, field: &str) -> Result<&'a str, SendError> {
    operation
        .payload
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SendError::Rejected {
            reason: format!("missing {field}"),
        })
}

/// Returns the first Bot API call an operation needs.
///
/// `fetch-history` and `download-media` take a second step that depends on
/// the first call's result.
///
/// # Errors
///
/// Returns `Rejected` for operations a bot cannot perform.
pub fn first_call(operation: &Operation) -> Result<ApiCall, SendError> {
    match operation.kind {
        OperationKind::SendMessage => Ok(ApiCall::new(
            "sendMessage",
            json!({
                "chat_id": chat_id(peer(operation)?),
                "text": str_field(operation, "text")?,
            }),
        )),
        OperationKind::ResolveEntity | OperationKind::FetchHistory => Ok(ApiCall::new(
            "getChat",
            json!({ "chat_id": chat_id(peer(operation)?) }),
        )),
        OperationKind::GetMe => Ok(ApiCall::new("getMe", json!({}))),
        OperationKind::DownloadMedia => Ok(ApiCall::new(
            "getFile",
            json!({ "file_id": str_field(operation, "file_id")? }),
        )),
        OperationKind::JoinEntity => Err(SendError::Rejected {
            reason: "bots cannot join chats; add the bot to the chat instead".to_string(),
        }),
    }
}

/// The `getUpdates` call used to read retained posts.
///
/// No `offset` is sent, so nothing is acknowledged and other readers still
/// see the same updates.
#[must_use]
pub fn updates_call() -> ApiCall {
    ApiCall::new(
        "getUpdates",
        json!({
            "timeout": 0,
            "allowed_updates": ["message", "channel_post", "edited_channel_post"],
        }),
    )
}

/// Builds the `fetch-history` result from a `getChat` result and the raw
/// updates.
///
/// Messages are newest first, limited to ids below `offset_id` when it is
/// non-zero, and capped at `limit`.
#[must_use]
pub fn history(chat: &JsonValue, updates: &JsonValue, offset_id: u64, limit: usize) -> JsonValue {
    let chat_id = chat.get("id").and_then(JsonValue::as_i64);
    let mut messages: Vec<JsonValue> = updates
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|update| {
            ["channel_post", "edited_channel_post", "message"]
                .iter()
                .find_map(|field| update.get(*field))
        })
        .filter(|message| {
            message
                .get("chat")
                .and_then(|c| c.get("id"))
                .and_then(JsonValue::as_i64)
                == chat_id
        })
        .filter_map(message_view)
        .filter(|message| {
            offset_id == 0
                || message
                    .get("id")
                    .and_then(JsonValue::as_u64)
                    .is_some_and(|id| id < offset_id)
        })
        .collect();

    messages.sort_by_key(|m| std::cmp::Reverse(m.get("id").and_then(JsonValue::as_u64)));
    messages.dedup_by_key(|m| m.get("id").and_then(JsonValue::as_u64));
    messages.truncate(limit);

    json!({
        "chat": {
            "id": chat.get("id"),
            "title": chat.get("title").or_else(|| chat.get("first_name")),
            "username": chat.get("username"),
        },
        "messages": messages,
    })
}

fn message_view(message: &JsonValue) -> Option<JsonValue> {
    let id = message.get("message_id")?.as_u64()?;
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    Some(json!({
        "id": id,
        "date": message.get("date"),
        "text": text,
        "media": media_view(message),
    }))
}

fn media_view(message: &JsonValue) -> JsonValue {
    if let Some(largest) = message
        .get("photo")
        .and_then(JsonValue::as_array)
        .and_then(|sizes| sizes.last())
    {
        return json!({
            "kind": "photo",
            "file_id": largest.get("file_id"),
            "mime": "image/jpeg",
            "size": largest.get("file_size"),
        });
    }
    for kind in ["video", "document"] {
        if let Some(file) = message.get(kind) {
            return json!({
                "kind": kind,
                "file_id": file.get("file_id"),
                "mime": file.get("mime_type"),
                "size": file.get("file_size"),
            });
        }
    }
    JsonValue::Null
}

/// Guesses a MIME type from a Bot API `file_path`.
#[must_use]
pub fn mime_for_path(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
