//! Session manager configuration.

use std::time::Duration;
use thinkone_core::Backoff;

/// Tunables for session workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a session may sit without work before it is released.
    pub idle_timeout: Duration,
    /// Longest rate-limit wait absorbed in the queue before the operation
    /// fails with a rate-limited error.
    pub max_queue_wait: Duration,
    /// Flood-wait responses tolerated for one operation before giving up.
    pub max_flood_waits: u32,
    /// Policy for reconnecting after transport failures.
    pub reconnect: Backoff,
    /// Policy for retrying account store access.
    pub store_retry: Backoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            max_queue_wait: Duration::from_secs(5),
            max_flood_waits: 3,
            reconnect: Backoff::default(),
            store_retry: Backoff::default(),
        }
    }
}

impl SessionConfig {
    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the longest rate-limit wait absorbed in the queue.
    #[must_use]
    pub fn with_max_queue_wait(mut self, max_queue_wait: Duration) -> Self {
        self.max_queue_wait = max_queue_wait;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: Backoff) -> Self {
        self.reconnect = reconnect;
        self
    }
}
