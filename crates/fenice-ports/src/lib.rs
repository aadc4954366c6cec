//! The `fenice-ports` library crate exposes the input/output ports of a
//! remote microcontroller gateway as typed controllers.
//!
//! Core functionalities of this crate include:
//!
//! - Configuring a port mode and pull resistor, and reading or writing its
//!   digital and analog values over the link
//! - Routing unsolicited gateway events, such as value changes and edge
//!   interrupts, to per-port listeners
//! - Forwarding capability commands and capability update events for the
//!   device attached to a port

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Port and pull resistor modes.
pub mod mode;
/// The per-port controller.
pub mod port;
