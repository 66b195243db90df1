//! zrelay - dual-role BLE fitness relay.
//!
//! The relay connects to a heart-rate strap, a power meter and an FTMS
//! smart trainer as a central, and re-exposes them to a companion app as
//! one virtual sensor. Control commands from the app are translated for
//! the trainer and passed through an adaptive grade limiter.
//!
//! Everything in this library is host-testable (`cargo test`); the embedded
//! binary (`src/main.rs`, feature `embedded`) only wires [`engine::Relay`] to
//! the SoftDevice, flash, UART and button.

#![cfg_attr(not(test), no_std)]

// must stay first: the logging macros are textually scoped
mod fmt;

pub mod activity;
pub mod ble;
pub mod config;
pub mod control_point;
pub mod engine;
pub mod error;
pub mod events;
pub mod grade_limiter;
pub mod relay;
pub mod storage;
pub mod ui;

pub use engine::Relay;
pub use error::Error;
