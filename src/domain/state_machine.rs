//! Connection State Machine
//!
//! Sequences controller power-on, discovery, connection, service resolution
//! and notification setup for the single target peripheral.
//!
//! ```text
//! INIT ─ClientReady─▶ CONTROLLER_OFF ─Powered─▶ CONTROLLER_ON ─▶ SCANNING
//!                                                    │              │ RSSI
//!                                     (already)      │              ▼
//!                                     connected      │        SCAN_STOPPED
//!                                                    ▼              │ Discovering=false
//!  ACTIVE ◀─NotifyAcquired─ ACQUIRING_NOTIFY ◀─ CONNECTED ◀─ CONNECTING
//!                                                    ServicesResolved
//! ```
//!
//! States marked "immediate" act on entry without waiting for a new event,
//! so one event can carry the machine through several states before it
//! returns.

use crate::domain::error::ClientError;
use crate::domain::models::{ConnectionEvent, ConnectionState};
use tracing::{debug, info, warn};

/// Operations the state machine drives on the session.
pub trait ConnectionActions {
    fn controller_powered(&self) -> Result<bool, ClientError>;
    fn peripheral_connected(&self) -> Result<bool, ClientError>;
    fn power_on(&mut self) -> Result<(), ClientError>;
    fn start_scan(&mut self) -> Result<(), ClientError>;
    fn stop_scan(&mut self) -> Result<(), ClientError>;
    fn connect(&mut self) -> Result<(), ClientError>;
    fn acquire_notify(&mut self) -> Result<(), ClientError>;
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    transitions: Vec<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Init,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// States entered since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.transitions)
    }

    /// Drop back to INIT without acting. Used when the daemon goes away and
    /// every binding the machine relied on is gone with it.
    pub fn reset(&mut self) {
        self.enter(ConnectionState::Init);
    }

    /// Feed one event and advance until a state needs a new external event.
    /// Returns the state the machine settled in.
    pub fn handle<A: ConnectionActions>(
        &mut self,
        event: ConnectionEvent,
        actions: &mut A,
    ) -> ConnectionState {
        debug!("Connection event {:?} in state {}", event, self.state);

        // Disconnect is a hard reset, whatever we were doing.
        if event == ConnectionEvent::PeripheralDisconnected {
            self.enter(ConnectionState::ControllerOn);
        }

        loop {
            match self.state {
                ConnectionState::Init => {
                    if event != ConnectionEvent::ClientReady {
                        break;
                    }
                    self.enter(ConnectionState::ControllerOff);
                }

                ConnectionState::ControllerOff => match actions.controller_powered() {
                    Ok(true) => self.enter(ConnectionState::ControllerOn),
                    Ok(false) => {
                        info!("Controller is powered off, powering on");
                        if let Err(e) = actions.power_on() {
                            warn!("Failed to power controller on: {}", e);
                        }
                        break;
                    }
                    Err(e) => {
                        debug!("Controller power state unknown: {}", e);
                        break;
                    }
                },

                ConnectionState::ControllerOn => {
                    // A peripheral missing from the daemon's database reads as
                    // not connected.
                    let connected = actions.peripheral_connected().unwrap_or_else(|e| {
                        debug!("Peripheral connection state unknown: {}", e);
                        false
                    });

                    if connected {
                        self.enter(ConnectionState::Connected);
                        continue;
                    }

                    self.enter(ConnectionState::Scanning);
                    if let Err(e) = actions.start_scan() {
                        warn!("Failed to start discovery: {}", e);
                    }
                    break;
                }

                ConnectionState::Scanning => {
                    if event != ConnectionEvent::PeripheralDetected {
                        break;
                    }
                    if let Err(e) = actions.stop_scan() {
                        warn!("Failed to stop discovery: {}", e);
                    }
                    // Wait for Discovering to drop before connecting.
                    self.enter(ConnectionState::ScanStopped);
                    break;
                }

                ConnectionState::ScanStopped => {
                    if event != ConnectionEvent::ScanStopped {
                        break;
                    }
                    info!("Attempting to connect...");
                    match actions.connect() {
                        Ok(()) => self.enter(ConnectionState::Connecting),
                        Err(e) => warn!("Failed to request connection: {}", e),
                    }
                    break;
                }

                ConnectionState::Connecting => {
                    if event != ConnectionEvent::ServicesResolved {
                        break;
                    }
                    self.enter(ConnectionState::Connected);
                }

                ConnectionState::Connected => {
                    if let Err(e) = actions.acquire_notify() {
                        warn!("Failed to acquire notify: {}", e);
                    }
                    self.enter(ConnectionState::AcquiringNotify);
                    break;
                }

                ConnectionState::AcquiringNotify => {
                    if event == ConnectionEvent::NotifyAcquired {
                        self.enter(ConnectionState::Active);
                    }
                    break;
                }

                ConnectionState::Active => break,
            }
        }

        self.state
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Connection state {} -> {}", self.state, next);
            self.transitions.push(next);
        }
        self.state = next;
    }
}
