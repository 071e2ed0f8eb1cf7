//! The account store seam and its in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use thinkone_core::AccountKey;
use tokio::sync::RwLock;

use crate::account::{Account, AccountStatus};
use crate::error::StoreError;

/// Durable storage for account records.
///
/// Implementations store credentials only in sealed form.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Loads an account.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no account has this key.
    async fn get(&self, key: &AccountKey) -> Result<Account, StoreError>;

    /// Inserts or replaces an account record.
    ///
    /// The original `created_at` is kept when replacing.
    async fn put(&self, account: Account) -> Result<(), StoreError>;

    /// Updates the status and stamps the last-seen time.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no account has this key.
    async fn mark_status(&self, key: &AccountKey, status: AccountStatus)
    -> Result<(), StoreError>;

    /// Deletes an account.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no account has this key.
    async fn delete(&self, key: &AccountKey) -> Result<(), StoreError>;

    /// Lists all accounts ordered by key.
    async fn list(&self) -> Result<Vec<Account>, StoreError>;
}

/// Account store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountKey, Account>>,
}

impl InMemoryAccountStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, key: &AccountKey) -> Result<Account, StoreError> {
        self.accounts
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn put(&self, mut account: Account) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().await;
        if let Some(existing) = accounts.get(&account.key) {
            account.created_at = existing.created_at;
        }
        accounts.insert(account.key.clone(), account);
        Ok(())
    }

    async fn mark_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        account.mark_status(status);
        Ok(())
    }

    async fn delete(&self, key: &AccountKey) -> Result<(), StoreError> {
        self.accounts
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn list(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SealedCredential;

    fn account(name: &str) -> Account {
        Account::new(
            AccountKey::new(name).expect("valid key"),
            SealedCredential::from_bytes(vec![1, 2, 3]),
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryAccountStore::new();
        store.put(account("acct1")).await.expect("put");

        let loaded = store
            .get(&AccountKey::new("acct1").expect("valid key"))
            .await
            .expect("get");
        assert_eq!(loaded.status, AccountStatus::Unauthenticated);
        assert_eq!(loaded.credential.as_bytes(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let store = InMemoryAccountStore::new();
        let key = AccountKey::new("ghost").expect("valid key");

        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.mark_status(&key, AccountStatus::Connected).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(&key).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn replacing_keeps_created_at() {
        let store = InMemoryAccountStore::new();
        let first = account("acct1");
        let created_at = first.created_at;
        store.put(first).await.expect("put");

        let mut second = account("acct1");
        second.created_at = created_at + chrono::Duration::hours(1);
        store.put(second).await.expect("put");

        let loaded = store.get(&AccountKey::new("acct1").expect("valid key")).await.expect("get");
        assert_eq!(loaded.created_at, created_at);
    }

    #[tokio::test]
    async fn mark_status_stamps_last_seen() {
        let store = InMemoryAccountStore::new();
        store.put(account("acct1")).await.expect("put");
        let key = AccountKey::new("acct1").expect("valid key");

        store
            .mark_status(&key, AccountStatus::Revoked)
            .await
            .expect("mark");

        let loaded = store.get(&key).await.expect("get");
        assert!(loaded.is_revoked());
        assert!(loaded.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = InMemoryAccountStore::new();
        store.put(account("zeta")).await.expect("put");
        store.put(account("alpha")).await.expect("put");

        let keys: Vec<String> = store
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|a| a.key.to_string())
            .collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }
}
