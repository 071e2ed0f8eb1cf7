//! SQLite-backed account store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thinkone_core::AccountKey;
use tracing::{debug, info};

use crate::account::{Account, AccountStatus, SealedCredential};
use crate::error::StoreError;
use crate::store::AccountStore;

/// Row type for account queries.
#[derive(FromRow)]
struct AccountRow {
    account_key: String,
    credential: Vec<u8>,
    status: String,
    last_seen_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    fn try_into_account(self) -> Result<Account, StoreError> {
        let key = AccountKey::new(&self.account_key).map_err(|e| StoreError::Corrupted {
            key: None,
            reason: format!("invalid account key '{}': {e}", self.account_key),
        })?;
        let status = AccountStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupted {
            key: Some(key.clone()),
            reason: format!("unknown status '{}'", self.status),
        })?;

        Ok(Account {
            key,
            credential: SealedCredential::from_bytes(self.credential),
            status,
            last_seen_at: self.last_seen_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Account store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteAccountStore {
    pool: SqlitePool,
}

impl SqliteAccountStore {
    /// Connects to the database at `uri` and applies pending migrations.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await?;
        let store = Self::from_pool(pool).await?;
        info!("account store ready");
        Ok(store)
    }

    /// Wraps an existing pool, applying pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: format!("migration failed: {e}"),
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get(&self, key: &AccountKey) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT account_key, credential, status, last_seen_at, created_at, updated_at
            FROM accounts
            WHERE account_key = ?1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => r.try_into_account(),
            None => Err(StoreError::NotFound { key: key.clone() }),
        }
    }

    async fn put(&self, account: Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (account_key, credential, status, last_seen_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (account_key) DO UPDATE SET
                credential = excluded.credential,
                status = excluded.status,
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(account.key.as_str())
        .bind(account.credential.as_bytes())
        .bind(account.status.as_str())
        .bind(account.last_seen_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(account = %account.key, status = %account.status, "account stored");
        Ok(())
    }

    async fn mark_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET status = ?2, last_seen_at = ?3, updated_at = ?4
            WHERE account_key = ?1
            "#,
        )
        .bind(key.as_str())
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { key: key.clone() });
        }
        Ok(())
    }

    async fn delete(&self, key: &AccountKey) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE account_key = ?1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { key: key.clone() });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Account>, StoreError> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            r#"
            SELECT account_key, credential, status, last_seen_at, created_at, updated_at
            FROM accounts
            ORDER BY account_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountRow::try_into_account).collect()
    }
}
