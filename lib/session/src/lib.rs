//! Session management for thinkone.
//!
//! Each managed account gets at most one live session: a worker task that
//! owns the account's Telegram connection and runs its operations one at a
//! time, in the order they were submitted. Sessions are created on demand,
//! released after sitting idle, and torn down when their credential is
//! revoked.
//!
//! The Telegram side is reached through the [`TelegramClient`] and
//! [`Connection`] traits. The `mock` feature adds `mock::MockTelegramClient`,
//! a scripted implementation for tests.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod session;
mod worker;

pub use client::{ConnectError, Connection, SendError, TelegramClient};
pub use config::SessionConfig;
pub use error::SessionError;
pub use manager::SessionManager;
pub use session::{CloseReason, Completed, SessionInfo};
