//! Values the dispatcher hands back to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thinkone_core::{AccountKey, OperationKind, RequestId};
use thinkone_governor::BudgetSnapshot;
use thinkone_session::SessionInfo;
use thinkone_store::{Account, AccountStatus};

/// The outcome of a dispatched operation.
///
/// Replays of an idempotent request return this value unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    /// Identifier minted when the operation first ran.
    pub request_id: RequestId,
    /// Account the operation ran as.
    pub account: AccountKey,
    /// What was done.
    pub kind: OperationKind,
    /// Response data from Telegram.
    pub data: JsonValue,
    /// When the operation finished.
    pub completed_at: DateTime<Utc>,
    /// Time from dispatch to completion, queueing included.
    pub latency_ms: u64,
    /// Sends it took, including retries.
    pub attempts: u32,
}

/// Rate budget state as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateView {
    pub tokens: f64,
    pub capacity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
}

impl From<BudgetSnapshot> for RateView {
    fn from(snapshot: BudgetSnapshot) -> Self {
        Self {
            tokens: snapshot.tokens,
            capacity: snapshot.capacity,
            cooldown_remaining_ms: snapshot
                .cooldown_remaining
                .map(|wait| wait.as_millis() as u64),
        }
    }
}

/// An account as reported to operators. Never includes the credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountView {
    pub key: AccountKey,
    /// Live session status when a session exists, stored status otherwise.
    pub status: AccountStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<RateView>,
}

impl AccountView {
    pub(crate) fn new(
        account: Account,
        session: Option<SessionInfo>,
        rate: Option<BudgetSnapshot>,
    ) -> Self {
        let status = session.as_ref().map_or(account.status, |s| s.status);
        Self {
            key: account.key,
            status,
            last_seen_at: account.last_seen_at,
            created_at: account.created_at,
            updated_at: account.updated_at,
            session,
            rate: rate.map(RateView::from),
        }
    }
}
