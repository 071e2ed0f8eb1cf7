//! The request dispatcher.

use chrono::Utc;
use futures::future::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use thinkone_core::{AccountKey, Backoff, Operation, OperationRequest, RequestId};
use thinkone_governor::RateGovernor;
use thinkone_session::{CloseReason, SessionManager};
use thinkone_store::{
    Account, AccountStatus, AccountStore, Credential, CredentialCipher, StoreError,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::GatewayError;
use crate::idempotency::{Fingerprint, IdempotencyCache};
use crate::view::{AccountView, OperationResult};

/// Dispatcher tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a caller waits for an operation before giving up.
    pub operation_timeout: Duration,
    /// How long an idempotency token is remembered.
    pub idempotency_ttl: Duration,
    /// Most idempotency tokens remembered at once.
    pub idempotency_capacity: usize,
    /// Policy for retrying account store access.
    pub store_retry: Backoff,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(600),
            idempotency_capacity: 10_000,
            store_retry: Backoff::default(),
        }
    }
}

impl DispatcherConfig {
    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// The public entry point for operations and account administration.
pub struct Dispatcher {
    store: Arc<dyn AccountStore>,
    governor: Arc<RateGovernor>,
    cipher: Arc<CredentialCipher>,
    sessions: Arc<SessionManager>,
    config: DispatcherConfig,
    idempotency: IdempotencyCache,
}

impl Dispatcher {
    /// Creates a dispatcher over an existing session manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn AccountStore>,
        governor: Arc<RateGovernor>,
        cipher: Arc<CredentialCipher>,
        sessions: Arc<SessionManager>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            governor,
            cipher,
            sessions,
            idempotency: IdempotencyCache::new(
                config.idempotency_ttl,
                config.idempotency_capacity,
            ),
            config,
        }
    }

    /// Returns the session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Validates and runs an operation.
    ///
    /// With an idempotency token, the operation runs in its own task so it
    /// completes even if every caller gives up, and duplicates of the same
    /// request share its result.
    ///
    /// # Errors
    ///
    /// Returns the [`GatewayError`] describing why the operation failed.
    #[instrument(skip(self, request), fields(account = %request.account, kind = %request.operation.kind))]
    pub async fn dispatch(
        &self,
        request: OperationRequest,
    ) -> Result<OperationResult, GatewayError> {
        let OperationRequest {
            account,
            operation,
            idempotency_key,
        } = request;
        let operation = operation.validate()?;
        let started = Instant::now();
        let timeout = self.config.operation_timeout;
        let sessions = Arc::clone(&self.sessions);

        let outcome = match idempotency_key {
            None => tokio::time::timeout(timeout, run(sessions, account, operation, started)).await,
            Some(token) => {
                let fingerprint = Fingerprint::new(&account, operation.kind, &operation.payload);
                let execution = self.idempotency.get_or_start(token, fingerprint, move || {
                    let task = tokio::spawn(run(sessions, account, operation, started));
                    async move {
                        task.await.unwrap_or_else(|e| {
                            Err(GatewayError::TransportTransient {
                                reason: format!("operation task failed: {e}"),
                            })
                        })
                    }
                    .boxed()
                })?;
                tokio::time::timeout(timeout, execution).await
            }
        };

        outcome.unwrap_or_else(|_| {
            warn!(timeout_ms = timeout.as_millis() as u64, "operation timed out");
            Err(GatewayError::Timeout { after: timeout })
        })
    }

    /// Registers an account or replaces its credential.
    ///
    /// Any live session is torn down so the next operation connects with
    /// the new credential. A revoked account becomes usable again.
    ///
    /// # Errors
    ///
    /// Fails if the credential cannot be sealed or the store is unreachable.
    #[instrument(skip_all, fields(account = %key))]
    pub async fn register_account(
        &self,
        key: AccountKey,
        credential: Credential,
    ) -> Result<AccountView, GatewayError> {
        let sealed = self.cipher.seal(&key, &credential)?;
        let account = Account::new(key.clone(), sealed);
        let store = &self.store;
        self.config
            .store_retry
            .retry("put_account", StoreError::is_transient, || {
                store.put(account.clone())
            })
            .await?;
        self.sessions.invalidate(&key, CloseReason::Replaced).await;
        info!(account = %key, kind = ?credential.kind(), "account registered");
        self.account(&key).await
    }

    /// Ends the account's session. The credential is kept.
    ///
    /// # Errors
    ///
    /// Fails if the account is unknown or the store is unreachable.
    #[instrument(skip_all, fields(account = %key))]
    pub async fn logout(&self, key: &AccountKey) -> Result<AccountView, GatewayError> {
        let account = self.load(key).await?;
        self.sessions.invalidate(key, CloseReason::Logout).await;
        if !account.is_revoked() {
            let store = &self.store;
            self.config
                .store_retry
                .retry("mark_status", StoreError::is_transient, || {
                    store.mark_status(key, AccountStatus::Unauthenticated)
                })
                .await?;
        }
        info!(account = %key, "account logged out");
        self.account(key).await
    }

    /// Ends the account's session and deletes it from the store.
    ///
    /// # Errors
    ///
    /// Fails if the account is unknown or the store is unreachable.
    #[instrument(skip_all, fields(account = %key))]
    pub async fn remove_account(&self, key: &AccountKey) -> Result<(), GatewayError> {
        self.load(key).await?;
        self.sessions.invalidate(key, CloseReason::Removed).await;
        let store = &self.store;
        self.config
            .store_retry
            .retry("delete_account", StoreError::is_transient, || store.delete(key))
            .await?;
        self.governor.forget(key);
        info!(account = %key, "account removed");
        Ok(())
    }

    /// Describes one account.
    ///
    /// # Errors
    ///
    /// Fails if the account is unknown or the store is unreachable.
    pub async fn account(&self, key: &AccountKey) -> Result<AccountView, GatewayError> {
        let account = self.load(key).await?;
        Ok(self.view(account))
    }

    /// Describes every account, ordered by key.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable.
    pub async fn list_accounts(&self) -> Result<Vec<AccountView>, GatewayError> {
        let store = &self.store;
        let accounts = self
            .config
            .store_retry
            .retry("list_accounts", StoreError::is_transient, || store.list())
            .await?;
        Ok(accounts.into_iter().map(|account| self.view(account)).collect())
    }

    async fn load(&self, key: &AccountKey) -> Result<Account, GatewayError> {
        let store = &self.store;
        Ok(self
            .config
            .store_retry
            .retry("load_account", StoreError::is_transient, || store.get(key))
            .await?)
    }

    fn view(&self, account: Account) -> AccountView {
        let session = self.sessions.session(&account.key);
        let rate = self.governor.snapshot(&account.key);
        AccountView::new(account, session, rate)
    }
}

/// Runs one validated operation to completion.
async fn run(
    sessions: Arc<SessionManager>,
    account: AccountKey,
    operation: Operation,
    started: Instant,
) -> Result<OperationResult, GatewayError> {
    let request_id = RequestId::new();
    let kind = operation.kind;
    let completed = sessions
        .execute(OperationRequest::new(account.clone(), operation))
        .await?;
    let latency_ms = started.elapsed().as_millis() as u64;
    debug!(
        request_id = %request_id,
        session_id = %completed.session_id,
        latency_ms,
        attempts = completed.attempts,
        "operation completed"
    );
    Ok(OperationResult {
        request_id,
        account,
        kind,
        data: completed.data,
        completed_at: Utc::now(),
        latency_ms,
        attempts: completed.attempts,
    })
}
