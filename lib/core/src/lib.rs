//! Core domain types and utilities for thinkone.
//!
//! This crate provides the identifiers, operation model, retry policy and
//! error handling foundation shared by the session gateway crates.

pub mod backoff;
pub mod error;
pub mod id;
pub mod operation;

pub use backoff::Backoff;
pub use error::Result;
pub use id::{AccountKey, IdempotencyKey, ParseIdError, RequestId, SessionId};
pub use operation::{
    InvalidOperation, Operation, OperationKind, OperationRequest, normalize_peer,
};
