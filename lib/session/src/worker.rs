//! The per-account session worker.
//!
//! A worker owns its account's connection and drains the account's queue
//! strictly in order. Each job is admitted by the governor, sent, and its
//! outcome delivered on the job's oneshot before the next job is looked at.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thinkone_core::{AccountKey, Operation, OperationKind};
use thinkone_governor::{Admission, RateGovernor};
use thinkone_store::{AccountStatus, AccountStore, CredentialCipher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ConnectError, Connection, SendError, TelegramClient};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{CloseReason, Completed, Job, SessionHandle, SessionShared};

/// Dependencies shared by the manager and every worker.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn AccountStore>,
    pub(crate) governor: Arc<RateGovernor>,
    pub(crate) client: Arc<dyn TelegramClient>,
    pub(crate) cipher: Arc<CredentialCipher>,
    pub(crate) config: SessionConfig,
    pub(crate) sessions: DashMap<AccountKey, SessionHandle>,
}

impl Shared {
    /// Marks the session `shared` closing under the map's write guard.
    ///
    /// With `only_if_idle`, nothing happens while jobs are pending. Returns
    /// whether the session is now closing.
    pub(crate) fn mark_closing(
        &self,
        shared: &SessionShared,
        reason: CloseReason,
        only_if_idle: bool,
    ) -> bool {
        let guard = self.sessions.get_mut(&shared.account);
        if only_if_idle && shared.pending() > 0 {
            return false;
        }
        shared.mark_closing(reason);
        drop(guard);
        true
    }

    /// Persists a status change. Failures are logged, not returned.
    pub(crate) async fn persist_status(&self, account: &AccountKey, status: AccountStatus) {
        let result = self
            .config
            .store_retry
            .retry("mark_status", |e: &thinkone_store::StoreError| e.is_transient(), || {
                self.store.mark_status(account, status)
            })
            .await;
        if let Err(e) = result {
            warn!(account = %account, status = %status, error = %e, "failed to persist account status");
        }
    }
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    session: Arc<SessionShared>,
    rx: mpsc::UnboundedReceiver<Job>,
    connection: Option<Box<dyn Connection>>,
    connect_eagerly: bool,
}

enum Event {
    Job(Job),
    CloseRequested,
    Idle,
    Disconnected,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        session: Arc<SessionShared>,
        rx: mpsc::UnboundedReceiver<Job>,
        connect_eagerly: bool,
    ) -> Self {
        Self {
            shared,
            session,
            rx,
            connection: None,
            connect_eagerly,
        }
    }

    fn account(&self) -> &AccountKey {
        &self.session.account
    }

    pub(crate) async fn run(mut self) {
        info!(account = %self.account(), session_id = %self.session.id, "session started");

        if self.connect_eagerly {
            match self.connect().await {
                Ok(connection) => self.connection = Some(connection),
                Err(e) => warn!(account = %self.account(), error = %e, "eager connect failed"),
            }
        }

        let reason = loop {
            if let Some(reason) = self.session.closing() {
                break reason;
            }

            let event = tokio::select! {
                biased;
                () = self.session.close_requested() => Event::CloseRequested,
                job = tokio::time::timeout(self.shared.config.idle_timeout, self.rx.recv()) => {
                    match job {
                        Ok(Some(job)) => Event::Job(job),
                        Ok(None) => Event::Disconnected,
                        Err(_) => Event::Idle,
                    }
                }
            };

            match event {
                Event::Job(job) => self.handle(job).await,
                Event::CloseRequested => {}
                Event::Idle => {
                    if self.shared.mark_closing(&self.session, CloseReason::Idle, true) {
                        debug!(account = %self.account(), "session idle");
                    }
                }
                Event::Disconnected => {
                    self.shared
                        .mark_closing(&self.session, CloseReason::Shutdown, false);
                }
            }
        };

        self.finish(reason).await;
    }

    async fn handle(&mut self, job: Job) {
        let kind = job.operation.kind;
        let result = self.execute(&job.operation).await;
        self.session.touch();

        match &result {
            Ok(completed) => {
                debug!(account = %self.account(), kind = %kind, attempts = completed.attempts, "operation completed")
            }
            Err(e) => debug!(account = %self.account(), kind = %kind, error = %e, "operation failed"),
        }

        // The caller may have stopped waiting; the work is done either way.
        let _ = job.reply.send(result);
        self.session.job_finished();
    }

    async fn execute(&mut self, operation: &Operation) -> Result<Completed, SessionError> {
        let mut attempts = 0;
        let mut flood_waits = 0;
        let mut transport_failures = 0;

        loop {
            self.await_admission(operation.kind).await?;

            let mut connection = match self.connection.take() {
                Some(connection) => connection,
                None => self.connect().await?,
            };

            attempts += 1;
            match connection.send(operation).await {
                Ok(data) => {
                    self.connection = Some(connection);
                    if self.session.status() != AccountStatus::Connected {
                        self.set_status(AccountStatus::Connected).await;
                    }
                    return Ok(Completed {
                        session_id: self.session.id,
                        data,
                        attempts,
                    });
                }
                Err(SendError::FloodWait { seconds }) => {
                    self.connection = Some(connection);
                    let wait = Duration::from_secs(seconds);
                    self.shared.governor.record_flood_wait(self.account(), wait);
                    flood_waits += 1;
                    warn!(
                        account = %self.account(),
                        kind = %operation.kind,
                        retry_after_ms = wait.as_millis() as u64,
                        "flood wait received"
                    );
                    if flood_waits > self.shared.config.max_flood_waits {
                        return Err(SessionError::RateLimited { retry_after: wait });
                    }
                }
                Err(SendError::Transport { reason }) => {
                    connection.close().await;
                    transport_failures += 1;
                    warn!(
                        account = %self.account(),
                        attempt = transport_failures,
                        error = %reason,
                        "connection dropped"
                    );
                    let reconnect = self.shared.config.reconnect;
                    if transport_failures >= reconnect.max_attempts {
                        self.set_status(AccountStatus::Degraded).await;
                        return Err(SessionError::Transport { reason });
                    }
                    tokio::time::sleep(reconnect.delay_after(transport_failures)).await;
                }
                Err(SendError::AuthRejected { reason }) => {
                    connection.close().await;
                    self.revoke(&reason).await;
                    return Err(SessionError::AuthRevoked {
                        account: self.account().clone(),
                    });
                }
                Err(SendError::Rejected { reason }) => {
                    self.connection = Some(connection);
                    return Err(SessionError::Rejected { reason });
                }
            }
        }
    }

    /// Waits for the governor to admit `kind`, within the queue wait budget.
    async fn await_admission(&self, kind: OperationKind) -> Result<(), SessionError> {
        loop {
            match self.shared.governor.admit(self.account(), kind) {
                Admission::Admitted { .. } => return Ok(()),
                Admission::Rejected { retry_after }
                    if retry_after <= self.shared.config.max_queue_wait =>
                {
                    debug!(
                        account = %self.account(),
                        kind = %kind,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "waiting for rate budget"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Admission::Rejected { retry_after } => {
                    return Err(SessionError::RateLimited { retry_after });
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<Box<dyn Connection>, SessionError> {
        let account = self
            .shared
            .config
            .store_retry
            .retry("load_account", |e: &thinkone_store::StoreError| e.is_transient(), || {
                self.shared.store.get(&self.session.account)
            })
            .await
            .map_err(|e| SessionError::from_store(&self.session.account, e))?;
        if account.is_revoked() {
            self.shared
                .mark_closing(&self.session, CloseReason::Revoked, false);
            return Err(SessionError::AuthRevoked {
                account: account.key,
            });
        }

        let credential = self
            .shared
            .cipher
            .open(&account.key, &account.credential)
            .map_err(|e| SessionError::Storage {
                reason: format!("stored credential unreadable: {e}"),
            })?;

        self.set_status(AccountStatus::Authenticating).await;

        let client = &self.shared.client;
        let result = self
            .shared
            .config
            .reconnect
            .retry("connect", ConnectError::is_transient, || {
                client.connect(&account.key, &credential)
            })
            .await;

        match result {
            Ok(connection) => {
                info!(account = %self.account(), session_id = %self.session.id, "connected");
                self.set_status(AccountStatus::Connected).await;
                Ok(connection)
            }
            Err(ConnectError::AuthRejected { reason }) => {
                self.revoke(&reason).await;
                Err(SessionError::AuthRevoked {
                    account: account.key,
                })
            }
            Err(ConnectError::Transport { reason }) => {
                warn!(account = %self.account(), error = %reason, "reconnection attempts exhausted");
                self.set_status(AccountStatus::Degraded).await;
                Err(SessionError::Transport { reason })
            }
        }
    }

    async fn revoke(&mut self, reason: &str) {
        warn!(account = %self.account(), reason, "credential revoked");
        self.set_status(AccountStatus::Revoked).await;
        self.shared
            .mark_closing(&self.session, CloseReason::Revoked, false);
    }

    async fn set_status(&self, status: AccountStatus) {
        self.session.set_status(status);
        self.shared.persist_status(self.account(), status).await;
    }

    async fn finish(mut self, reason: CloseReason) {
        // Nothing can be queued once closing is marked; fail what is left.
        self.rx.close();
        let mut drained = 0;
        while let Ok(job) = self.rx.try_recv() {
            let err = match reason {
                CloseReason::Revoked => SessionError::AuthRevoked {
                    account: self.account().clone(),
                },
                other => SessionError::Closed { reason: other },
            };
            let _ = job.reply.send(Err(err));
            self.session.job_finished();
            drained += 1;
        }

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        if reason != CloseReason::Revoked && self.session.status() != AccountStatus::Unauthenticated
        {
            self.set_status(AccountStatus::Unauthenticated).await;
        }

        let id = self.session.id;
        self.shared
            .sessions
            .remove_if(&self.session.account, |_, handle| handle.shared.id == id);
        self.session.finish();

        info!(
            account = %self.account(),
            session_id = %id,
            reason = %reason,
            failed_jobs = drained,
            "session closed"
        );
    }
}
