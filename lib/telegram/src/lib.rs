//! Telegram Bot HTTP API client capability for thinkone.
//!
//! [`BotApiClient`] implements the session layer's `TelegramClient` for
//! accounts registered with a bot token. Bots cannot join chats or read
//! arbitrary history, so `join-entity` is refused and `fetch-history`
//! returns the channel posts Telegram still retains for `getUpdates`.

pub mod api;
pub mod client;

pub use client::{BotApiClient, DEFAULT_API_BASE};
