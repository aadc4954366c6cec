//! The `fenice-link` library crate maintains the point-to-point link between
//! a driver process and a remote microcontroller gateway.
//!
//! Core functionalities of this crate include:
//!
//! - Keeping one persistent TCP connection per gateway alive, with
//!   line-oriented framing, lifecycle events, heartbeat supervision, and
//!   automatic reconnection
//! - Correlating sent commands with their asynchronous replies through
//!   monotonically increasing identifiers
//!
//! To optimize system resource usage, `fenice-link` leverages `tokio` as an
//! asynchronous executor: one background reader task per connection runs
//! concurrently with any number of caller tasks, and callers suspend only
//! when they choose to await a reply.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Link configuration and heartbeat strategy.
pub mod config;
/// The persistent gateway connection.
pub mod connection;
/// Correlation of commands with their replies.
pub mod dispatcher;
