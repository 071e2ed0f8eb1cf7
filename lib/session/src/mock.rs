//! A scriptable in-process Telegram client.
//!
//! Responses are scripted per account and consumed in order; once a script
//! runs dry the connection echoes the operation back. Every connect and send
//! is recorded so tests can assert on ordering and concurrency.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thinkone_core::{AccountKey, Operation};
use thinkone_store::Credential;

use crate::client::{ConnectError, Connection, SendError, TelegramClient};

#[derive(Default)]
struct MockState {
    connect_script: HashMap<AccountKey, VecDeque<Result<(), ConnectError>>>,
    send_script: HashMap<AccountKey, VecDeque<Result<JsonValue, SendError>>>,
    delays: HashMap<AccountKey, Duration>,
    connects: HashMap<AccountKey, usize>,
    calls: Vec<(AccountKey, Operation)>,
    in_flight: HashMap<AccountKey, usize>,
    max_in_flight: HashMap<AccountKey, usize>,
}

/// A [`TelegramClient`] driven by scripted outcomes.
#[derive(Clone, Default)]
pub struct MockTelegramClient {
    state: Arc<Mutex<MockState>>,
    closes: Arc<AtomicUsize>,
}

impl MockTelegramClient {
    /// Creates a client that accepts every connection and echoes every
    /// operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of the next unscripted connect for `account`.
    pub fn script_connect(&self, account: &AccountKey, outcome: Result<(), ConnectError>) {
        self.state()
            .connect_script
            .entry(account.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Queues the outcome of the next unscripted send for `account`.
    pub fn script_send(&self, account: &AccountKey, outcome: Result<JsonValue, SendError>) {
        self.state()
            .send_script
            .entry(account.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Makes every send for `account` take `delay`.
    pub fn set_delay(&self, account: &AccountKey, delay: Duration) {
        self.state().delays.insert(account.clone(), delay);
    }

    /// Number of connect calls made for `account`.
    #[must_use]
    pub fn connects(&self, account: &AccountKey) -> usize {
        self.state().connects.get(account).copied().unwrap_or(0)
    }

    /// Operations sent for `account`, in the order they started.
    #[must_use]
    pub fn calls(&self, account: &AccountKey) -> Vec<Operation> {
        self.state()
            .calls
            .iter()
            .filter(|(key, _)| key == account)
            .map(|(_, operation)| operation.clone())
            .collect()
    }

    /// Every recorded send across accounts, in the order they started.
    #[must_use]
    pub fn all_calls(&self) -> Vec<(AccountKey, Operation)> {
        self.state().calls.clone()
    }

    /// Highest number of simultaneous sends observed for `account`.
    #[must_use]
    pub fn max_in_flight(&self, account: &AccountKey) -> usize {
        self.state().max_in_flight.get(account).copied().unwrap_or(0)
    }

    /// Number of connections closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelegramClient for MockTelegramClient {
    async fn connect(
        &self,
        account: &AccountKey,
        _credential: &Credential,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let outcome = {
            let mut state = self.state();
            *state.connects.entry(account.clone()).or_default() += 1;
            state
                .connect_script
                .get_mut(account)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(()))
        };
        outcome?;
        Ok(Box::new(MockConnection {
            account: account.clone(),
            client: self.clone(),
        }))
    }
}

struct MockConnection {
    account: AccountKey,
    client: MockTelegramClient,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, operation: &Operation) -> Result<JsonValue, SendError> {
        let delay = {
            let mut state = self.client.state();
            state.calls.push((self.account.clone(), operation.clone()));
            let in_flight = {
                let count = state.in_flight.entry(self.account.clone()).or_default();
                *count += 1;
                *count
            };
            let max = state.max_in_flight.entry(self.account.clone()).or_default();
            *max = (*max).max(in_flight);
            state.delays.get(&self.account).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.client.state();
        if let Some(count) = state.in_flight.get_mut(&self.account) {
            *count = count.saturating_sub(1);
        }
        state
            .send_script
            .get_mut(&self.account)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(json!({
                    "account": self.account.as_str(),
                    "kind": operation.kind.as_str(),
                    "payload": operation.payload,
                }))
            })
    }

    async fn close(&mut self) {
        self.client.closes.fetch_add(1, Ordering::SeqCst);
    }
}
