//! Idempotency token cache.
//!
//! A token maps to one shared execution. Concurrent duplicates await the
//! same execution, and later duplicates within the TTL get its result
//! without re-running it. Failed executions are not kept: the next request
//! with that token runs again.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thinkone_core::{AccountKey, IdempotencyKey, OperationKind};
use tokio::time::Instant;
use tracing::debug;

use crate::error::GatewayError;
use crate::view::OperationResult;

/// A shareable in-progress or finished execution.
pub type SharedExecution = Shared<BoxFuture<'static, Result<OperationResult, GatewayError>>>;

/// Identity of a request, used to detect token reuse across different
/// requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    account: AccountKey,
    kind: OperationKind,
    payload: JsonValue,
}

impl Fingerprint {
    /// Creates a fingerprint from a validated request.
    #[must_use]
    pub fn new(account: &AccountKey, kind: OperationKind, payload: &JsonValue) -> Self {
        Self {
            account: account.clone(),
            kind,
            payload: payload.clone(),
        }
    }
}

struct CacheEntry {
    fingerprint: Fingerprint,
    created_at: Instant,
    execution: SharedExecution,
}

impl CacheEntry {
    /// True once the execution has finished with an error, even if no
    /// caller was left to observe it.
    fn failed(&self) -> bool {
        matches!(self.execution.clone().now_or_never(), Some(Err(_)))
    }
}

/// Bounded, TTL-limited map from idempotency token to execution.
pub struct IdempotencyCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<IdempotencyKey, CacheEntry>>,
}

impl IdempotencyCache {
    /// Creates a cache holding at most `capacity` tokens for `ttl` each.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<IdempotencyKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the execution for `token`, starting one with `start` if there
    /// is none or the previous one failed.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidOperation` if `token` is already bound
    /// to a different request.
    pub fn get_or_start<F>(
        &self,
        token: IdempotencyKey,
        fingerprint: Fingerprint,
        start: F,
    ) -> Result<SharedExecution, GatewayError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<OperationResult, GatewayError>>,
    {
        let now = Instant::now();
        let mut entries = self.entries();
        let ttl = self.ttl;
        entries.retain(|_, entry| now.saturating_duration_since(entry.created_at) < ttl);

        if let Some(entry) = entries.get(&token) {
            if entry.fingerprint != fingerprint {
                return Err(GatewayError::InvalidOperation {
                    reason: format!("idempotency key '{token}' was used for a different request"),
                });
            }
            if !entry.failed() {
                debug!(token = %token, "idempotent replay");
                return Ok(entry.execution.clone());
            }
        }

        if !entries.contains_key(&token) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        let execution = start().shared();
        entries.insert(
            token,
            CacheEntry {
                fingerprint,
                created_at: now,
                execution: execution.clone(),
            },
        );
        Ok(execution)
    }

    /// Number of tokens currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true if no tokens are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thinkone_core::RequestId;

    fn key() -> AccountKey {
        AccountKey::new("acct1").expect("valid key")
    }

    fn token(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).expect("valid token")
    }

    fn fingerprint(text: &str) -> Fingerprint {
        Fingerprint::new(&key(), OperationKind::SendMessage, &json!({ "text": text }))
    }

    fn counting(
        runs: &Arc<AtomicUsize>,
        outcome: Result<(), GatewayError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<OperationResult, GatewayError>> {
        let runs = Arc::clone(runs);
        move || {
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                outcome.map(|()| OperationResult {
                    request_id: RequestId::new(),
                    account: key(),
                    kind: OperationKind::SendMessage,
                    data: json!({ "ok": true }),
                    completed_at: Utc::now(),
                    latency_ms: 1,
                    attempts: 1,
                })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn duplicate_tokens_share_one_execution() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("first");
        let second = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("second");

        let (a, b) = futures::join!(first, second);
        assert_eq!(a, b);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let third = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("third")
            .await;
        assert_eq!(third, a);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reusing_a_token_for_another_request_is_rejected() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));

        let _ = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("first");
        let err = cache
            .get_or_start(token("t1"), fingerprint("bye"), counting(&runs, Ok(())))
            .err()
            .expect("mismatch rejected");
        assert_eq!(err.code(), "invalid_operation");
    }

    #[tokio::test]
    async fn failed_executions_are_rerun() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));
        let failure = GatewayError::TransportTransient {
            reason: "reset".to_string(),
        };

        let first = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Err(failure)))
            .expect("first")
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("second")
            .await;
        assert!(second.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unobserved_failures_are_rerun() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));
        let failure = GatewayError::TransportTransient {
            reason: "reset".to_string(),
        };

        drop(
            cache
                .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Err(failure)))
                .expect("first"),
        );

        let second = cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("second")
            .await;
        assert!(second.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(Duration::from_secs(10), 10);
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("first")
            .await
            .expect("ok");
        tokio::time::sleep(Duration::from_secs(11)).await;
        cache
            .get_or_start(token("t1"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("after ttl")
            .await
            .expect("ok");

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capacity_evicts_the_oldest_token() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 2);
        let runs = Arc::new(AtomicUsize::new(0));

        for name in ["t1", "t2", "t3"] {
            let _ = cache
                .get_or_start(token(name), fingerprint("hi"), counting(&runs, Ok(())))
                .expect("start");
        }
        assert_eq!(cache.len(), 2);

        let _ = cache
            .get_or_start(token("t3"), fingerprint("hi"), counting(&runs, Ok(())))
            .expect("t3 still cached");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
