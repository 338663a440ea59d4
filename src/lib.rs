//! Reachability detection and session logging for a single fixed-IP device
//! on a self-hosted WiFi network.
//!
//! [`prober`] issues timed GETs, [`detector`] layers them into one
//! [`models::ConnectionState`] per cycle, [`scheduler`] repeats cycles with
//! bounded retries, and [`session`] gates control behind a logged session.
//! [`device::DeviceCore`] owns all of it.

pub mod api;
pub mod config;
pub mod detector;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod models;
pub mod prober;
pub mod scheduler;
pub mod session;
pub mod task;

#[cfg(test)]
mod testing;

pub use crate::device::{ControlStatus, DeviceCore};
pub use crate::error::{DetectError, ErrorKind, SessionError};
