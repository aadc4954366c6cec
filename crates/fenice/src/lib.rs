//! The wire vocabulary shared by every `fenice` crate.
//!
//! A remote microcontroller gateway speaks a tiny line-oriented text
//! protocol: each message is a single newline-terminated line of
//! colon-separated tokens, carrying a numeric correlation identifier, a
//! command name, and an ordered sequence of string arguments.
//!
//! This crate provides APIs to:
//!
//! - Model one protocol message as a [`command::Command`].
//! - Encode a command into its wire-text form and decode received lines
//!   back into commands.
//! - Classify the failures shared across the engine through
//!   [`error::Error`] and [`error::ErrorKind`].
//!
//! The codec is pure and stateless. Transport, correlation, and port
//! semantics live in the `fenice-link` and `fenice-ports` crates.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// The protocol message and its wire codec.
pub mod command;
/// Error management.
pub mod error;
