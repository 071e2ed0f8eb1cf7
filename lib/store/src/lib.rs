//! Durable account store for thinkone.
//!
//! Holds each managed Telegram account's encrypted credential and last known
//! connection status. Two backends are provided: SQLite for deployments and
//! an in-memory map for tests and throwaway runs. Credentials are sealed with
//! [`CredentialCipher`] before they reach either backend.

pub mod account;
pub mod cipher;
pub mod error;
pub mod sqlite;
pub mod store;

pub use account::{Account, AccountStatus, Credential, CredentialKind, SealedCredential};
pub use cipher::{CredentialCipher, KEY_LEN};
pub use error::{CipherError, StoreError};
pub use sqlite::SqliteAccountStore;
pub use store::{AccountStore, InMemoryAccountStore};

use std::sync::Arc;

/// Opens the store selected by `uri`.
///
/// `memory:` selects the in-memory store; `sqlite:` URIs are passed to
/// [`SqliteAccountStore::connect`].
pub async fn open_store(uri: &str) -> Result<Arc<dyn AccountStore>, StoreError> {
    if uri == "memory:" {
        Ok(Arc::new(InMemoryAccountStore::new()))
    } else if uri.starts_with("sqlite:") {
        Ok(Arc::new(SqliteAccountStore::connect(uri).await?))
    } else {
        Err(StoreError::InvalidUri {
            uri: uri.to_string(),
        })
    }
}
