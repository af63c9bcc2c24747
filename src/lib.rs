//! Client for one BLE peripheral reached through the BlueZ daemon.
//!
//! [`ClientSession`] drives the adapter and peripheral from power-on to an
//! open notification channel and reports progress as [`AppEvent`]s.

pub mod domain;
pub mod infrastructure;

pub use domain::error::ClientError;
pub use domain::models::{AppEvent, ConnectionState, PropValue, Role, Tristate};
pub use infrastructure::bluetooth::{ClientSession, ZbusTransport};
