//! The session manager.
//!
//! Keeps at most one live session per account. Operations are queued onto
//! the account's session worker; a session that is being torn down accepts
//! no new work, and callers that meet one wait for its worker to exit before
//! starting a fresh session.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use std::sync::Arc;
use thinkone_core::{AccountKey, Operation, OperationRequest};
use thinkone_governor::RateGovernor;
use thinkone_store::{AccountStore, CredentialCipher, StoreError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::client::TelegramClient;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{CloseReason, Completed, Job, SessionHandle, SessionInfo, SessionShared};
use crate::worker::{Shared, Worker};

/// Owns every live session.
pub struct SessionManager {
    shared: Arc<Shared>,
}

/// What a submitter found when it looked up an account's session.
enum Lookup {
    Queued(oneshot::Receiver<Result<Completed, SessionError>>),
    Closing(Arc<SessionShared>, Operation),
    WorkerGone(Operation),
    Absent(Operation),
}

impl SessionManager {
    /// Creates a manager with no live sessions.
    #[must_use]
    pub fn new(
        store: Arc<dyn AccountStore>,
        governor: Arc<RateGovernor>,
        client: Arc<dyn TelegramClient>,
        cipher: Arc<CredentialCipher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                governor,
                client,
                cipher,
                config,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Returns the live session for `account`, creating one if needed.
    ///
    /// # Errors
    ///
    /// Fails if the account is unknown, revoked, or the store is unreachable.
    #[instrument(skip_all, fields(account = %account))]
    pub async fn acquire(&self, account: &AccountKey) -> Result<SessionInfo, SessionError> {
        loop {
            let closing = match self.shared.sessions.get(account) {
                Some(handle) if handle.shared.closing().is_none() => {
                    return Ok(handle.shared.info());
                }
                Some(handle) => Some(Arc::clone(&handle.shared)),
                None => None,
            };
            match closing {
                Some(session) => session.wait_done().await,
                None => self.start_session(account, false).await?,
            }
        }
    }

    /// Queues an operation on the account's session and waits for its
    /// outcome.
    ///
    /// Operations for the same account run one at a time in submission
    /// order. Dropping the returned future abandons the wait only; the
    /// queued operation still runs.
    #[instrument(skip(self, request), fields(account = %request.account, kind = %request.operation.kind))]
    pub async fn execute(&self, request: OperationRequest) -> Result<Completed, SessionError> {
        let account = request.account;
        let mut operation = request.operation;

        let reply = loop {
            match self.try_enqueue(&account, operation) {
                Lookup::Queued(reply) => break reply,
                Lookup::Closing(session, op) => {
                    operation = op;
                    session.wait_done().await;
                }
                Lookup::WorkerGone(op) => {
                    operation = op;
                }
                Lookup::Absent(op) => {
                    operation = op;
                    self.start_session(&account, false).await?;
                }
            }
        };

        reply.await.map_err(|_| SessionError::Closed {
            reason: CloseReason::Shutdown,
        })?
    }

    /// Queues `operation` under the session map's read guard.
    fn try_enqueue(&self, account: &AccountKey, operation: Operation) -> Lookup {
        let Some(handle) = self.shared.sessions.get(account) else {
            return Lookup::Absent(operation);
        };
        if handle.shared.closing().is_some() {
            return Lookup::Closing(Arc::clone(&handle.shared), operation);
        }

        let (reply, rx) = oneshot::channel();
        handle.shared.job_queued();
        match handle.tx.send(Job { operation, reply }) {
            Ok(()) => Lookup::Queued(rx),
            Err(mpsc::error::SendError(job)) => {
                // The worker exited without unregistering; clear the stale entry.
                handle.shared.job_finished();
                let id = handle.shared.id;
                drop(handle);
                self.shared
                    .sessions
                    .remove_if(account, |_, existing| existing.shared.id == id);
                Lookup::WorkerGone(job.operation)
            }
        }
    }

    /// Loads the account and registers a worker for it, unless another
    /// caller got there first.
    async fn start_session(
        &self,
        account: &AccountKey,
        connect_eagerly: bool,
    ) -> Result<(), SessionError> {
        let store = &self.shared.store;
        let record = self
            .shared
            .config
            .store_retry
            .retry("load_account", StoreError::is_transient, || store.get(account))
            .await
            .map_err(|e| SessionError::from_store(account, e))?;
        if record.is_revoked() {
            return Err(SessionError::AuthRevoked {
                account: account.clone(),
            });
        }

        let worker = match self.shared.sessions.entry(account.clone()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let session = Arc::new(SessionShared::new(account.clone()));
                vacant.insert(SessionHandle {
                    tx,
                    shared: Arc::clone(&session),
                });
                Worker::new(Arc::clone(&self.shared), session, rx, connect_eagerly)
            }
        };

        tokio::spawn(worker.run());
        debug!(account = %account, "session registered");
        Ok(())
    }

    /// Releases an idle session.
    ///
    /// Returns false if there is no session or it still has work.
    #[instrument(skip_all, fields(account = %account))]
    pub async fn release(&self, account: &AccountKey) -> bool {
        let Some(session) = self.session_shared(account) else {
            return false;
        };
        if !self
            .shared
            .mark_closing(&session, CloseReason::Released, true)
        {
            return false;
        }
        session.wait_done().await;
        true
    }

    /// Tears down the account's session regardless of pending work and
    /// waits for its worker to exit.
    ///
    /// Queued operations fail. Returns false if there was no session.
    #[instrument(skip_all, fields(account = %account, reason = %reason))]
    pub async fn invalidate(&self, account: &AccountKey, reason: CloseReason) -> bool {
        let Some(session) = self.session_shared(account) else {
            return false;
        };
        self.shared.mark_closing(&session, reason, false);
        session.wait_done().await;
        info!(account = %account, reason = %reason, "session invalidated");
        true
    }

    /// Returns the live session for `account`, if any.
    #[must_use]
    pub fn session(&self, account: &AccountKey) -> Option<SessionInfo> {
        self.shared
            .sessions
            .get(account)
            .map(|handle| handle.shared.info())
    }

    /// Returns every live session.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.shared.info())
            .collect();
        sessions.sort_by(|a, b| a.account.cmp(&b.account));
        sessions
    }

    /// Starts sessions for `accounts` and connects them immediately.
    ///
    /// Failures are logged and skipped.
    pub async fn warm_up(&self, accounts: &[AccountKey]) {
        for account in accounts {
            if let Err(e) = self.start_session(account, true).await {
                warn!(account = %account, error = %e, "skipping eager session");
            }
        }
    }

    /// Tears down every session.
    pub async fn shutdown(&self) {
        let accounts: Vec<AccountKey> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        join_all(
            accounts
                .iter()
                .map(|account| self.invalidate(account, CloseReason::Shutdown)),
        )
        .await;
        info!(sessions = accounts.len(), "all sessions closed");
    }

    fn session_shared(&self, account: &AccountKey) -> Option<Arc<SessionShared>> {
        self.shared
            .sessions
            .get(account)
            .map(|handle| Arc::clone(&handle.shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConnectError, SendError};
    use crate::mock::MockTelegramClient;
    use futures::future::join_all;
    use serde_json::json;
    use std::time::Duration;
    use thinkone_core::{Backoff, OperationKind};
    use thinkone_governor::GovernorConfig;
    use thinkone_store::{Account, AccountStatus, Credential, InMemoryAccountStore};
    use tokio::time::Instant;

    #[test]
    fn connections_can_be_held_by_spawned_workers() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<Box<dyn crate::client::Connection>>();
        assert_send_sync::<Option<Box<dyn crate::client::Connection>>>();
    }

    struct Harness {
        manager: Arc<SessionManager>,
        client: MockTelegramClient,
        store: Arc<InMemoryAccountStore>,
        cipher: Arc<CredentialCipher>,
    }

    impl Harness {
        async fn register(&self, name: &str) -> AccountKey {
            let account = key(name);
            let sealed = self
                .cipher
                .seal(&account, &Credential::bot_token(format!("{name}:token")))
                .expect("seal");
            self.store
                .put(Account::new(account.clone(), sealed))
                .await
                .expect("put");
            account
        }

        async fn status(&self, account: &AccountKey) -> AccountStatus {
            self.store.get(account).await.expect("account exists").status
        }
    }

    fn key(name: &str) -> AccountKey {
        AccountKey::new(name).expect("valid key")
    }

    fn test_config() -> SessionConfig {
        SessionConfig::default()
            .with_idle_timeout(Duration::from_secs(60))
            .with_reconnect(Backoff::new(
                3,
                Duration::from_millis(10),
                Duration::from_millis(100),
            ))
    }

    fn harness(governor: GovernorConfig, config: SessionConfig) -> Harness {
        let client = MockTelegramClient::new();
        let store = Arc::new(InMemoryAccountStore::new());
        let cipher = Arc::new(CredentialCipher::new([7; 32]));
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::new(RateGovernor::new(governor)),
            Arc::new(client.clone()),
            Arc::clone(&cipher),
            config,
        ));
        Harness {
            manager,
            client,
            store,
            cipher,
        }
    }

    fn send(account: &AccountKey, seq: u64) -> OperationRequest {
        OperationRequest::new(
            account.clone(),
            Operation::new(OperationKind::SendMessage)
                .with_param("peer", json!("news"))
                .with_param("text", json!(format!("message {seq}"))),
        )
    }

    fn get_me(account: &AccountKey) -> OperationRequest {
        OperationRequest::new(account.clone(), Operation::new(OperationKind::GetMe))
    }

    #[tokio::test(start_paused = true)]
    async fn same_account_operations_run_in_submission_order() {
        let h = harness(GovernorConfig::new(100, 10.0), test_config());
        let account = h.register("a").await;
        h.client.set_delay(&account, Duration::from_millis(10));
        h.manager.acquire(&account).await.expect("acquire");

        let results = join_all((0..10).map(|seq| h.manager.execute(send(&account, seq)))).await;

        for (seq, result) in results.iter().enumerate() {
            let completed = result.as_ref().expect("operation succeeds");
            assert_eq!(
                completed.data["payload"]["text"],
                json!(format!("message {seq}"))
            );
        }
        let sent: Vec<Option<String>> = h
            .client
            .calls(&account)
            .iter()
            .map(|op| op.payload["text"].as_str().map(str::to_string))
            .collect();
        let expected: Vec<Option<String>> =
            (0..10).map(|seq| Some(format!("message {seq}"))).collect();
        assert_eq!(sent, expected);
        assert_eq!(h.client.max_in_flight(&account), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_account_does_not_block_others() {
        let h = harness(GovernorConfig::new(100, 10.0), test_config());
        let slow = h.register("slow").await;
        let fast = h.register("fast").await;
        h.client.set_delay(&slow, Duration::from_secs(10));

        let manager = Arc::clone(&h.manager);
        let slow_request = send(&slow, 1);
        let slow_task = tokio::spawn(async move { manager.execute(slow_request).await });
        tokio::task::yield_now().await;

        let start = Instant::now();
        h.manager.execute(get_me(&fast)).await.expect("fast succeeds");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!slow_task.is_finished());

        slow_task.await.expect("join").expect("slow succeeds");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_account_does_not_block_others() {
        let h = harness(
            GovernorConfig::new(1, 0.01),
            test_config().with_max_queue_wait(Duration::ZERO),
        );
        let limited = h.register("limited").await;
        let other = h.register("other").await;

        h.manager.execute(get_me(&limited)).await.expect("first admitted");
        assert!(matches!(
            h.manager.execute(get_me(&limited)).await,
            Err(SessionError::RateLimited { .. })
        ));
        h.manager.execute(get_me(&other)).await.expect("other admitted");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_sends_beyond_the_bucket_are_rate_limited() {
        let h = harness(
            GovernorConfig::new(3, 1.0),
            test_config().with_max_queue_wait(Duration::ZERO),
        );
        let account = h.register("a").await;
        h.manager.acquire(&account).await.expect("acquire");

        let results = join_all((0..5).map(|seq| h.manager.execute(send(&account, seq)))).await;

        assert!(results[..3].iter().all(Result::is_ok));
        let retry_afters: Vec<Duration> = results[3..]
            .iter()
            .map(|result| match result {
                Err(SessionError::RateLimited { retry_after }) => *retry_after,
                other => panic!("expected rate limit, got {other:?}"),
            })
            .collect();
        assert!(retry_afters[0] > Duration::ZERO);
        assert!(retry_afters[1] >= retry_afters[0]);
        assert_eq!(h.client.calls(&account).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn short_rate_limit_waits_are_absorbed_in_the_queue() {
        let h = harness(
            GovernorConfig::new(1, 1.0),
            test_config().with_max_queue_wait(Duration::from_secs(5)),
        );
        let account = h.register("a").await;

        let start = Instant::now();
        h.manager.execute(get_me(&account)).await.expect("first");
        h.manager.execute(get_me(&account)).await.expect("second waits");
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_is_retried_after_the_cooldown() {
        let h = harness(GovernorConfig::new(10, 1.0), test_config());
        let account = h.register("a").await;
        h.client
            .script_send(&account, Err(SendError::FloodWait { seconds: 2 }));

        let start = Instant::now();
        let completed = h.manager.execute(get_me(&account)).await.expect("retried");
        assert_eq!(completed.attempts, 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn long_flood_wait_fails_with_retry_after() {
        let h = harness(GovernorConfig::new(10, 1.0), test_config());
        let account = h.register("a").await;
        h.client
            .script_send(&account, Err(SendError::FloodWait { seconds: 30 }));

        let err = h.manager.execute(get_me(&account)).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::RateLimited {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_fails_queued_work_and_later_requests() {
        let h = harness(GovernorConfig::new(100, 10.0), test_config());
        let account = h.register("a").await;
        h.client.script_send(
            &account,
            Err(SendError::AuthRejected {
                reason: "AUTH_KEY_UNREGISTERED".to_string(),
            }),
        );
        h.manager.acquire(&account).await.expect("acquire");

        let results = join_all((0..3).map(|seq| h.manager.execute(send(&account, seq)))).await;
        for result in &results {
            assert_eq!(
                result.as_ref().unwrap_err(),
                &SessionError::AuthRevoked {
                    account: account.clone()
                }
            );
        }
        assert_eq!(h.client.calls(&account).len(), 1);
        assert_eq!(h.status(&account).await, AccountStatus::Revoked);
        assert!(h.manager.session(&account).is_none());

        assert!(matches!(
            h.manager.execute(get_me(&account)).await,
            Err(SessionError::AuthRevoked { .. })
        ));

        // Re-registering restores service.
        h.register("a").await;
        h.manager.execute(get_me(&account)).await.expect("works again");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credential_at_connect_revokes() {
        let h = harness(GovernorConfig::default(), test_config());
        let account = h.register("a").await;
        h.client.script_connect(
            &account,
            Err(ConnectError::AuthRejected {
                reason: "401".to_string(),
            }),
        );

        assert!(matches!(
            h.manager.execute(get_me(&account)).await,
            Err(SessionError::AuthRevoked { .. })
        ));
        assert_eq!(h.status(&account).await, AccountStatus::Revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_released_and_reconnects_transparently() {
        let h = harness(GovernorConfig::default(), test_config());
        let account = h.register("a").await;

        let first = h.manager.execute(get_me(&account)).await.expect("first");
        assert_eq!(
            h.manager.session(&account).map(|s| s.status),
            Some(AccountStatus::Connected)
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.manager.session(&account).is_none());
        assert_eq!(h.status(&account).await, AccountStatus::Unauthenticated);
        assert_eq!(h.client.closes(), 1);

        let second = h.manager.execute(get_me(&account)).await.expect("second");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(h.client.connects(&account), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_fails_queued_work_but_finishes_in_flight() {
        let h = harness(GovernorConfig::new(100, 10.0), test_config());
        let account = h.register("a").await;
        h.client.set_delay(&account, Duration::from_secs(1));
        h.manager.acquire(&account).await.expect("acquire");

        let (results, invalidated) = tokio::join!(
            join_all((0..3).map(|seq| h.manager.execute(send(&account, seq)))),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                h.manager.invalidate(&account, CloseReason::Logout).await
            }
        );

        assert!(invalidated);
        assert!(results[0].is_ok());
        for result in &results[1..] {
            assert_eq!(
                result.as_ref().unwrap_err(),
                &SessionError::Closed {
                    reason: CloseReason::Logout
                }
            );
        }
        assert!(h.manager.session(&account).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn release_only_takes_idle_sessions() {
        let h = harness(GovernorConfig::default(), test_config());
        let account = h.register("a").await;
        assert!(!h.manager.release(&account).await);

        h.client.set_delay(&account, Duration::from_secs(5));
        let manager = Arc::clone(&h.manager);
        let request = get_me(&account);
        let busy = tokio::spawn(async move { manager.execute(request).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.manager.release(&account).await);

        busy.await.expect("join").expect("completes");
        assert!(h.manager.release(&account).await);
        assert!(h.manager.session(&account).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_reconnects() {
        let h = harness(GovernorConfig::default(), test_config());
        let account = h.register("a").await;
        h.client.script_send(
            &account,
            Err(SendError::Transport {
                reason: "connection reset".to_string(),
            }),
        );

        let completed = h.manager.execute(get_me(&account)).await.expect("recovers");
        assert_eq!(completed.attempts, 2);
        assert_eq!(h.client.connects(&account), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_degrade_then_recover() {
        let h = harness(GovernorConfig::default(), test_config());
        let account = h.register("a").await;
        for _ in 0..3 {
            h.client.script_connect(
                &account,
                Err(ConnectError::Transport {
                    reason: "network unreachable".to_string(),
                }),
            );
        }

        assert!(matches!(
            h.manager.execute(get_me(&account)).await,
            Err(SessionError::Transport { .. })
        ));
        assert_eq!(h.status(&account).await, AccountStatus::Degraded);
        assert_eq!(h.client.connects(&account), 3);

        h.manager.execute(get_me(&account)).await.expect("recovers");
        assert_eq!(h.status(&account).await, AccountStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_account_is_not_found() {
        let h = harness(GovernorConfig::default(), test_config());
        let err = h.manager.execute(get_me(&key("ghost"))).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::AccountNotFound {
                account: key("ghost")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_requests_share_one_session() {
        let h = harness(GovernorConfig::new(100, 10.0), test_config());
        let account = h.register("a").await;

        let results = join_all((0..5).map(|seq| h.manager.execute(send(&account, seq)))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(h.client.connects(&account), 1);
        assert_eq!(h.client.max_in_flight(&account), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_connects_eagerly_and_shutdown_closes_all() {
        let h = harness(GovernorConfig::default(), test_config());
        let a = h.register("a").await;
        let b = h.register("b").await;

        h.manager.warm_up(&[a.clone(), b.clone(), key("ghost")]).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.client.connects(&a), 1);
        assert_eq!(h.client.connects(&b), 1);
        assert_eq!(h.manager.sessions().len(), 2);

        h.manager.shutdown().await;
        assert!(h.manager.sessions().is_empty());
        assert_eq!(h.client.closes(), 2);
    }
}
