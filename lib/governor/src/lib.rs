//! Per-account rate governance for thinkone.
//!
//! Each account gets a token bucket that refills lazily from elapsed time,
//! with operation kinds costing different amounts. A flood-wait signal from
//! Telegram puts the account into a cooldown that rejects every admission
//! until it expires, regardless of how many tokens are left.

pub mod config;

pub use config::GovernorConfig;

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thinkone_core::{AccountKey, OperationKind};
use tokio::time::Instant;
use tracing::{debug, info};

/// Tolerance for floating-point token comparisons.
const EPSILON: f64 = 1e-9;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The operation may proceed; its weight has been deducted.
    Admitted {
        /// Whole tokens left after the deduction.
        remaining: u32,
    },
    /// The operation must wait.
    Rejected {
        /// How long until the same request would be admitted.
        retry_after: Duration,
    },
}

impl Admission {
    /// Returns true if the operation was admitted.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Returns the wait for a rejected admission.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Admitted { .. } => None,
            Self::Rejected { retry_after } => Some(*retry_after),
        }
    }
}

/// Point-in-time view of one account's budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    /// Tokens currently available.
    pub tokens: f64,
    /// Bucket capacity.
    pub capacity: u32,
    /// Time left on an active flood-wait cooldown.
    pub cooldown_remaining: Option<Duration>,
}

/// Token bucket state for one account.
#[derive(Debug)]
struct RateBudget {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl RateBudget {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
            cooldown_until: None,
        }
    }

    fn refill(&mut self, now: Instant, capacity: u32, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(capacity));
        self.last_refill = now;
    }

    /// Returns the remaining cooldown, clearing it once expired.
    fn cooldown_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.cooldown_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.cooldown_until = None;
                None
            }
            None => None,
        }
    }
}

/// Rate governor shared by every session.
///
/// Budgets are created full on first use and synchronized per account, so
/// admission checks for different accounts never contend.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    budgets: DashMap<AccountKey, Arc<Mutex<RateBudget>>>,
}

impl RateGovernor {
    /// Creates a governor.
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            budgets: DashMap::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Checks whether `kind` may run now for `account`, deducting its weight
    /// if so.
    pub fn admit(&self, account: &AccountKey, kind: OperationKind) -> Admission {
        self.admit_at(account, kind, Instant::now())
    }

    /// [`admit`](Self::admit) against an explicit clock reading.
    pub fn admit_at(&self, account: &AccountKey, kind: OperationKind, now: Instant) -> Admission {
        let budget = self.budget(account, now);
        let mut budget = lock(&budget);

        if let Some(retry_after) = budget.cooldown_remaining(now) {
            debug!(
                account = %account,
                kind = %kind,
                retry_after_ms = retry_after.as_millis() as u64,
                "admission rejected: flood-wait cooldown"
            );
            return Admission::Rejected { retry_after };
        }

        let capacity = self.config.bucket_size;
        let rate = self.config.refill_rate;
        budget.refill(now, capacity, rate);

        let weight = f64::from(self.config.weight(kind).min(capacity));
        if budget.tokens + EPSILON >= weight {
            budget.tokens = (budget.tokens - weight).max(0.0);
            return Admission::Admitted {
                remaining: (budget.tokens + EPSILON).floor() as u32,
            };
        }

        let deficit = weight - budget.tokens;
        let retry_after = Duration::from_nanos((deficit / rate * 1e9).ceil() as u64);
        debug!(
            account = %account,
            kind = %kind,
            tokens = budget.tokens,
            retry_after_ms = retry_after.as_millis() as u64,
            "admission rejected: budget exhausted"
        );
        Admission::Rejected { retry_after }
    }

    /// Applies a server-imposed flood-wait to `account`.
    pub fn record_flood_wait(&self, account: &AccountKey, wait: Duration) {
        self.record_flood_wait_at(account, wait, Instant::now());
    }

    /// [`record_flood_wait`](Self::record_flood_wait) against an explicit
    /// clock reading. An existing longer cooldown is kept.
    pub fn record_flood_wait_at(&self, account: &AccountKey, wait: Duration, now: Instant) {
        let budget = self.budget(account, now);
        let mut budget = lock(&budget);

        let until = now + wait;
        let extended = match budget.cooldown_until {
            Some(existing) if existing >= until => false,
            _ => {
                budget.cooldown_until = Some(until);
                true
            }
        };
        if extended {
            info!(account = %account, wait_secs = wait.as_secs(), "flood-wait cooldown set");
        }
    }

    /// Returns the budget state for `account`, if it has one.
    #[must_use]
    pub fn snapshot(&self, account: &AccountKey) -> Option<BudgetSnapshot> {
        self.snapshot_at(account, Instant::now())
    }

    /// [`snapshot`](Self::snapshot) against an explicit clock reading.
    #[must_use]
    pub fn snapshot_at(&self, account: &AccountKey, now: Instant) -> Option<BudgetSnapshot> {
        let budget = self.budgets.get(account).map(|entry| Arc::clone(entry.value()))?;
        let mut budget = lock(&budget);
        budget.refill(now, self.config.bucket_size, self.config.refill_rate);
        Some(BudgetSnapshot {
            tokens: budget.tokens,
            capacity: self.config.bucket_size,
            cooldown_remaining: budget.cooldown_remaining(now),
        })
    }

    /// Drops all state for `account`.
    pub fn forget(&self, account: &AccountKey) {
        self.budgets.remove(account);
    }

    fn budget(&self, account: &AccountKey, now: Instant) -> Arc<Mutex<RateBudget>> {
        // Clone the Arc out so the shard lock is released before the budget
        // lock is taken.
        Arc::clone(
            self.budgets
                .entry(account.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(RateBudget::full(self.config.bucket_size, now)))
                })
                .value(),
        )
    }
}

fn lock(budget: &Mutex<RateBudget>) -> MutexGuard<'_, RateBudget> {
    budget.lock().unwrap_or_else(PoisonError::into_inner)
}
