//! Bluetooth Module
//!
//! Talks to the BlueZ daemon over D-Bus to reach one known peripheral and
//! turn its notifications into application events.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ClientSession                        │
//! │  (event dispatch, connection state machine, public API)  │
//! └──────┬──────────────────┬───────────────────┬───────────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌─────────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Registry   │   │ Notify        │   │  Protocol    │
//! │             │   │               │   │              │
//! │ - screening │   │ - AcquireNotify│  │ - names/paths│
//! │ - 4 proxies │   │ - stream reads │  │ - UUIDs      │
//! │ - prop cache│   │ - callback     │  │ - encoding   │
//! └──────┬──────┘   └───────┬───────┘   └──────────────┘
//!        │                  │
//!        ▼                  ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          BusTransport  (ZbusTransport on zbus)           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - BlueZ names, target UUIDs and the command/notification format
//! - [`transport`] - Bus capability trait and the events it delivers
//! - [`dbus`] - `zbus` implementation of the transport
//! - [`registry`] - Object screening and the fixed-role proxy table
//! - [`notify`] - Notification channel lifecycle
//! - [`service`] - Session coordinator

pub mod dbus;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main session for convenience
pub use dbus::ZbusTransport;
pub use service::ClientSession;
