//! [`TelegramClient`] over the Bot HTTP API.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use thinkone_core::operation::DEFAULT_HISTORY_LIMIT;
use thinkone_core::{AccountKey, Operation, OperationKind};
use thinkone_session::{ConnectError, Connection, SendError, TelegramClient};
use thinkone_store::{Credential, CredentialKind};
use tracing::{debug, instrument};

use crate::api::{self, ApiCall};

/// Default public Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API requests time out after this long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects bot-token accounts to the Bot HTTP API.
#[derive(Debug, Clone)]
pub struct BotApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl BotApiClient {
    /// Creates a client against `base_url`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http(http, base_url))
    }

    /// Creates a client from an existing HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TelegramClient for BotApiClient {
    #[instrument(skip_all, fields(account = %account))]
    async fn connect(
        &self,
        account: &AccountKey,
        credential: &Credential,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        if credential.kind() != CredentialKind::BotToken {
            return Err(ConnectError::AuthRejected {
                reason: "only bot tokens can be used with the Bot API".to_string(),
            });
        }

        let mut connection = BotConnection {
            account: account.clone(),
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: SecretString::new(credential.secret().expose_secret().clone()),
            me: None,
        };
        let me = connection
            .call(&api::ApiCall {
                method: "getMe",
                params: json!({}),
            })
            .await
            .map_err(|e| match e {
                // A malformed token is answered with 404 rather than 401.
                SendError::AuthRejected { reason } | SendError::Rejected { reason } => {
                    ConnectError::AuthRejected { reason }
                }
                SendError::FloodWait { seconds } => ConnectError::Transport {
                    reason: format!("flood wait of {seconds}s while connecting"),
                },
                SendError::Transport { reason } => ConnectError::Transport { reason },
            })?;
        debug!(
            account = %connection.account,
            bot = me.get("username").and_then(JsonValue::as_str).unwrap_or_default(),
            "bot authenticated"
        );
        connection.me = Some(me);
        Ok(Box::new(connection))
    }
}

struct BotConnection {
    account: AccountKey,
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    me: Option<JsonValue>,
}

impl BotConnection {
    async fn call(&self, call: &ApiCall) -> Result<JsonValue, SendError> {
        let url = format!(
            "{}/bot{}/{}",
            self.base_url,
            self.token.expose_secret(),
            call.method
        );
        let response = self
            .http
            .post(url)
            .json(&call.params)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport)?;
        api::classify_response(status, &body)
    }

    async fn download(&self, file: &JsonValue) -> Result<JsonValue, SendError> {
        let path = file
            .get("file_path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SendError::Rejected {
                reason: "file is not available for download".to_string(),
            })?;
        let url = format!(
            "{}/file/bot{}/{}",
            self.base_url,
            self.token.expose_secret(),
            path
        );
        let response = self.http.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map_err(transport)?;
            return api::classify_response(status.as_u16(), &body);
        }
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(json!({
            "file_id": file.get("file_id"),
            "mime": api::mime_for_path(path),
            "size": bytes.len(),
            "data": STANDARD.encode(&bytes),
        }))
    }
}

/// Strips the request URL, which carries the bot token, from the error.
fn transport(err: reqwest::Error) -> SendError {
    SendError::Transport {
        reason: err.without_url().to_string(),
    }
}

#[async_trait]
impl Connection for BotConnection {
    #[instrument(skip_all, fields(account = %self.account, kind = %operation.kind))]
    async fn send(&mut self, operation: &Operation) -> Result<JsonValue, SendError> {
        let first = api::first_call(operation)?;
        if let (OperationKind::GetMe, Some(me)) = (operation.kind, &self.me) {
            return Ok(me.clone());
        }
        let result = self.call(&first).await?;

        match operation.kind {
            OperationKind::FetchHistory => {
                let updates = self.call(&api::updates_call()).await?;
                let offset_id = operation
                    .payload
                    .get("offset_id")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0);
                let limit = operation
                    .payload
                    .get("limit")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(DEFAULT_HISTORY_LIMIT);
                Ok(api::history(
                    &result,
                    &updates,
                    offset_id,
                    usize::try_from(limit).unwrap_or(usize::MAX),
                ))
            }
            OperationKind::DownloadMedia => self.download(&result).await,
            _ => Ok(result),
        }
    }

    async fn close(&mut self) {
        self.me = None;
        debug!(account = %self.account, "bot connection closed");
    }
}
