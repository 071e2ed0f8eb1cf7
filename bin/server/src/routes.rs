//! HTTP routes.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use thinkone_core::operation::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use thinkone_core::{AccountKey, IdempotencyKey, Operation, OperationKind, OperationRequest};
use thinkone_dispatch::{AccountView, Dispatcher, GatewayError, OperationResult};
use thinkone_store::{Credential, CredentialKind};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::news::{self, NewsList, SortOrder};

/// Header listing per-channel failures of a news request.
pub const TG_ERRORS_HEADER: &str = "x-tg-errors";

/// Header carrying the caller's deduplication token.
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared handler state.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Account the news routes use when the request names none.
    pub default_account: Option<AccountKey>,
    pub default_channels: Vec<String>,
}

impl AppState {
    fn account_or_default(&self, requested: Option<&str>) -> Result<AccountKey, ApiError> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(key) => Ok(AccountKey::new(key)?),
            None => self.default_account.clone().ok_or_else(|| {
                ApiError::bad_request("no account given and no default account configured")
            }),
        }
    }
}

/// The API routes, without middleware.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tg/channels", get(channels))
        .route("/api/tg/news", get(news_feed))
        .route("/api/tg/media/{file_id}", get(media))
        .route("/api/accounts", get(list_accounts))
        .route(
            "/api/accounts/{key}",
            get(get_account).put(put_account).delete(delete_account),
        )
        .route("/api/accounts/{key}/logout", post(logout))
        .route("/api/accounts/{key}/operations/{kind}", post(run_operation))
        .with_state(state)
}

/// The API routes with request tracing and CORS.
pub fn app(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    api_routes(state)
        .layer(cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// CORS policy for the configured origins. `*` allows any origin.
#[must_use]
pub fn cors(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|e| warn!(origin = %origin, error = %e, "ignoring invalid CORS origin"))
                .ok()
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(TG_ERRORS_HEADER)])
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "ok": true }))
}

async fn channels(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    Json(json!({ "channels": state.default_channels }))
}

#[derive(Debug, Deserialize)]
struct NewsQuery {
    account: Option<String>,
    channels: Option<String>,
    limit: Option<u64>,
    offset_id: Option<u64>,
    sort: Option<String>,
}

/// Reads recent posts from several channels through one account.
///
/// A channel that fails is reported in `X-TG-Errors` instead of failing the
/// whole feed.
async fn news_feed(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NewsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let channels: Vec<String> = match &query.channels {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => state.default_channels.clone(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    let offset_id = query.offset_id.unwrap_or(0);
    let sort = query
        .sort
        .as_deref()
        .map(str::parse::<SortOrder>)
        .transpose()
        .map_err(ApiError::bad_request)?
        .unwrap_or_default();
    if channels.is_empty() {
        return Ok(Json(news::assemble(Vec::new(), sort, 0)).into_response());
    }
    let account = state.account_or_default(query.account.as_deref())?;

    let fetches = channels.iter().map(|channel| {
        let operation = Operation::new(OperationKind::FetchHistory)
            .with_param("peer", json!(channel))
            .with_param("limit", json!(limit))
            .with_param("offset_id", json!(offset_id));
        state
            .dispatcher
            .dispatch(OperationRequest::new(account.clone(), operation))
    });
    let results = join_all(fetches).await;

    let mut items = Vec::new();
    let mut errors = Vec::new();
    for (channel, result) in channels.iter().zip(results) {
        match result {
            Ok(history) => items.extend(news::items_from_history(&history.data, &account)),
            Err(e) => {
                warn!(channel = %channel, error = %e, "channel fetch failed");
                errors.push((channel.clone(), e.to_string()));
            }
        }
    }

    let list: NewsList = news::assemble(items, sort, usize::try_from(limit).unwrap_or(usize::MAX));
    debug!(channels = channels.len(), items = list.total, failed = errors.len(), "news assembled");
    let mut response = Json(list).into_response();
    if !errors.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&news::errors_header(&errors)) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(TG_ERRORS_HEADER), value);
        }
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct AccountQuery {
    account: Option<String>,
}

/// Streams a media file through the gateway with its MIME type.
async fn media(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    query: Result<Query<AccountQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let account = state.account_or_default(query.account.as_deref())?;
    let operation =
        Operation::new(OperationKind::DownloadMedia).with_param("file_id", json!(file_id));
    let result = state
        .dispatcher
        .dispatch(OperationRequest::new(account, operation))
        .await?;

    let bytes = result.data["data"]
        .as_str()
        .and_then(|data| STANDARD.decode(data).ok())
        .ok_or_else(|| GatewayError::TransportTransient {
            reason: "media response carried no data".to_string(),
        })?;
    let mime = result.data["mime"]
        .as_str()
        .and_then(|mime| HeaderValue::from_str(mime).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Result<Json<JsonValue>, ApiError> {
    let accounts = state.dispatcher.list_accounts().await?;
    Ok(Json(json!({ "accounts": accounts })))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<AccountView>, ApiError> {
    let key = AccountKey::new(key)?;
    Ok(Json(state.dispatcher.account(&key).await?))
}

/// Registration body. The secret is never echoed back.
#[derive(Deserialize)]
struct RegisterAccount {
    #[serde(default = "default_credential_kind")]
    kind: CredentialKind,
    secret: String,
}

fn default_credential_kind() -> CredentialKind {
    CredentialKind::BotToken
}

async fn put_account(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Result<Json<RegisterAccount>, JsonRejection>,
) -> Result<Json<AccountView>, ApiError> {
    let key = AccountKey::new(key)?;
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if body.secret.trim().is_empty() {
        return Err(ApiError::bad_request("secret must not be empty"));
    }
    let credential = Credential::new(body.kind, body.secret);
    Ok(Json(state.dispatcher.register_account(key, credential).await?))
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = AccountKey::new(key)?;
    state.dispatcher.remove_account(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<AccountView>, ApiError> {
    let key = AccountKey::new(key)?;
    Ok(Json(state.dispatcher.logout(&key).await?))
}

/// Runs any operation. The JSON body is the payload; an empty body means
/// `{}`.
async fn run_operation(
    State(state): State<Arc<AppState>>,
    Path((key, kind)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OperationResult>, ApiError> {
    let account = AccountKey::new(key)?;
    let kind: OperationKind = kind.parse()?;
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("body is not valid JSON: {e}")))?
    };

    let mut request = OperationRequest::new(account, Operation::new(kind).with_payload(payload));
    if let Some(token) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        let token = token
            .to_str()
            .map_err(|_| ApiError::bad_request("Idempotency-Key must be ASCII"))?;
        request = request.with_idempotency_key(IdempotencyKey::new(token)?);
    }

    Ok(Json(state.dispatcher.dispatch(request).await?))
}
