//! Live session state shared between a worker and the manager.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thinkone_core::{AccountKey, Operation, SessionId};
use thinkone_store::AccountStatus;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::error::SessionError;

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// No work arrived within the idle timeout.
    Idle,
    /// An operator released the session.
    Released,
    /// The account logged out.
    Logout,
    /// The credential was replaced.
    Replaced,
    /// The account was deleted.
    Removed,
    /// Telegram rejected the credential.
    Revoked,
    /// The process is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Released => "released",
            Self::Logout => "logout",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::Revoked => "revoked",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successfully executed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    /// Session that ran the operation.
    pub session_id: SessionId,
    /// Response data from Telegram.
    pub data: JsonValue,
    /// Number of sends it took, including flood-wait and transport retries.
    pub attempts: u32,
}

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Account the session serves.
    pub account: AccountKey,
    /// Current connection status.
    pub status: AccountStatus,
    /// Operations queued or in flight.
    pub pending: usize,
    /// Milliseconds since the session last did any work.
    pub idle_ms: u64,
}

/// A queued operation and the channel its outcome is delivered on.
pub(crate) struct Job {
    pub(crate) operation: Operation,
    pub(crate) reply: oneshot::Sender<Result<Completed, SessionError>>,
}

/// The manager's handle to a live session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) tx: mpsc::UnboundedSender<Job>,
    pub(crate) shared: std::sync::Arc<SessionShared>,
}

/// State readable by both the worker and the manager.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) account: AccountKey,
    status: Mutex<AccountStatus>,
    last_activity: Mutex<Instant>,
    pending: AtomicUsize,
    closing: Mutex<Option<CloseReason>>,
    close: Notify,
    done: watch::Sender<bool>,
}

impl SessionShared {
    pub(crate) fn new(account: AccountKey) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: SessionId::new(),
            account,
            status: Mutex::new(AccountStatus::Unauthenticated),
            last_activity: Mutex::new(Instant::now()),
            pending: AtomicUsize::new(0),
            closing: Mutex::new(None),
            close: Notify::new(),
            done,
        }
    }

    pub(crate) fn status(&self) -> AccountStatus {
        *lock(&self.status)
    }

    pub(crate) fn set_status(&self, status: AccountStatus) {
        *lock(&self.status) = status;
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn job_queued(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_finished(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn closing(&self) -> Option<CloseReason> {
        *lock(&self.closing)
    }

    /// Marks the session closing. The first reason wins.
    ///
    /// Callers hold the session map's write guard for this account, so no
    /// job can be queued concurrently.
    pub(crate) fn mark_closing(&self, reason: CloseReason) {
        lock(&self.closing).get_or_insert(reason);
        self.close.notify_one();
    }

    /// Resolves once a close has been requested.
    pub(crate) async fn close_requested(&self) {
        self.close.notified().await;
    }

    /// Signals that the worker has exited.
    pub(crate) fn finish(&self) {
        self.done.send_replace(true);
    }

    /// Waits for the worker to exit.
    pub(crate) async fn wait_done(&self) {
        let mut done = self.done.subscribe();
        // Err means the sender is gone, which also means the worker is gone.
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub(crate) fn info(&self) -> SessionInfo {
        let idle = lock(&self.last_activity).elapsed();
        SessionInfo {
            id: self.id,
            account: self.account.clone(),
            status: self.status(),
            pending: self.pending(),
            idle_ms: idle.as_millis() as u64,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
