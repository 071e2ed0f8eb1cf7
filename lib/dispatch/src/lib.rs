//! Request dispatching for thinkone.
//!
//! The [`Dispatcher`] is the single entry point the API surface talks to. It
//! validates operations, deduplicates retried requests by idempotency token,
//! bounds how long callers wait, and turns internal failures into the
//! [`GatewayError`] taxonomy. It also owns account administration.

pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod view;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::GatewayError;
pub use idempotency::IdempotencyCache;
pub use view::{AccountView, OperationResult, RateView};
