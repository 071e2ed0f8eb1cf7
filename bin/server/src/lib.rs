//! thinkone HTTP gateway.
//!
//! Exposes account management, generic operation dispatch and the news feed
//! routes over a shared [`thinkone_dispatch::Dispatcher`].

pub mod config;
pub mod error;
pub mod news;
pub mod routes;
