use std::fmt;

/// The four fixed proxy roles tracked for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The local Bluetooth adapter
    Controller,
    /// The one remote peripheral we care about
    Peripheral,
    /// GATT characteristic delivering notifications
    NotifyCharacteristic,
    /// GATT characteristic accepting command writes
    WriteCharacteristic,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Controller,
        Role::Peripheral,
        Role::NotifyCharacteristic,
        Role::WriteCharacteristic,
    ];

    /// Slot index into the fixed proxy table
    pub fn index(self) -> usize {
        match self {
            Self::Controller => 0,
            Self::Peripheral => 1,
            Self::NotifyCharacteristic => 2,
            Self::WriteCharacteristic => 3,
        }
    }

    /// Property names this role is allowed to cache.
    pub fn declared_properties(self) -> &'static [&'static str] {
        match self {
            Self::Controller => &["Powered", "Discovering"],
            Self::Peripheral => &["RSSI", "Connected", "ServicesResolved", "UUIDs"],
            Self::NotifyCharacteristic => &["UUID", "NotifyAcquired"],
            Self::WriteCharacteristic => &["UUID"],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Controller => "controller",
            Self::Peripheral => "peripheral",
            Self::NotifyCharacteristic => "notify characteristic",
            Self::WriteCharacteristic => "write characteristic",
        };
        f.write_str(name)
    }
}

/// A typed property value as received from (or sent to) the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Str(String),
    ObjectPath(String),
    StrList(Vec<String>),
    Bytes(Vec<u8>),
    /// Anything else, kept only by its signature
    Other(String),
}

impl PropValue {
    /// D-Bus type signature of the cached value
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Bool(_) => "b",
            Self::Byte(_) => "y",
            Self::Int16(_) => "n",
            Self::UInt16(_) => "q",
            Self::Int32(_) => "i",
            Self::UInt32(_) => "u",
            Self::Str(_) => "s",
            Self::ObjectPath(_) => "o",
            Self::StrList(_) => "as",
            Self::Bytes(_) => "ay",
            Self::Other(signature) => signature,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// True for single-valued D-Bus types that `Properties.Set` accepts here
    pub fn is_basic(&self) -> bool {
        !matches!(self, Self::StrList(_) | Self::Bytes(_) | Self::Other(_))
    }

    /// Whether this value is, or contains, the given UUID.
    pub fn contains_uuid(&self, wanted: &str) -> bool {
        match self {
            Self::Str(uuid) => uuid.eq_ignore_ascii_case(wanted),
            Self::StrList(uuids) => uuids.iter().any(|uuid| uuid.eq_ignore_ascii_case(wanted)),
            _ => false,
        }
    }
}

/// Value handed to the property change callback: a boolean or "not a boolean".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    Yes,
    No,
    NotBoolean,
}

impl Tristate {
    /// 1 / 0 / -1 encoding
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Yes => 1,
            Self::No => 0,
            Self::NotBoolean => -1,
        }
    }

    pub fn is_yes(self) -> bool {
        self == Self::Yes
    }

    pub fn is_no(self) -> bool {
        self == Self::No
    }
}

impl From<&PropValue> for Tristate {
    fn from(value: &PropValue) -> Self {
        match value.as_bool() {
            Some(true) => Self::Yes,
            Some(false) => Self::No,
            None => Self::NotBoolean,
        }
    }
}

/// One interface exposed by a bus object, with its property dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDescription {
    pub name: String,
    pub properties: Vec<(String, PropValue)>,
}

/// A bus object as reported by `GetManagedObjects` or `InterfacesAdded`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescription {
    pub path: String,
    pub interfaces: Vec<InterfaceDescription>,
}

/// Connection establishment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Init,
    ControllerOff,
    ControllerOn,
    Scanning,
    ScanStopped,
    Connecting,
    Connected,
    AcquiringNotify,
    Active,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::ControllerOff => "CONTROLLER_OFF",
            Self::ControllerOn => "CONTROLLER_ON",
            Self::Scanning => "SCANNING",
            Self::ScanStopped => "SCAN_STOPPED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::AcquiringNotify => "ACQUIRING_NOTIFY",
            Self::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ClientReady,
    ControllerPoweredOn,
    PeripheralDetected,
    ScanStopped,
    ServicesResolved,
    NotifyAcquired,
    PeripheralDisconnected,
}

impl ConnectionEvent {
    /// Translate a live property change on a tracked role into an event.
    pub fn from_property_change(role: Role, name: &str, value: Tristate) -> Option<Self> {
        match (role, name) {
            (Role::Peripheral, "ServicesResolved") if value.is_yes() => {
                Some(Self::ServicesResolved)
            }
            (Role::Peripheral, "RSSI") => Some(Self::PeripheralDetected),
            (Role::Peripheral, "Connected") if value.is_no() => Some(Self::PeripheralDisconnected),
            (Role::Controller, "Powered") if value.is_yes() => Some(Self::ControllerPoweredOn),
            (Role::Controller, "Discovering") if value.is_no() => Some(Self::ScanStopped),
            (Role::NotifyCharacteristic, "NotifyAcquired") if value.is_yes() => {
                Some(Self::NotifyAcquired)
            }
            _ => None,
        }
    }
}

/// Events pushed from the session to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Initial object snapshot has been processed
    Ready,
    StateChanged(ConnectionState),
    /// First byte of a peripheral notification
    Notification(u8),
    ChannelOpened { mtu: u16 },
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_encoding() {
        assert_eq!(Tristate::from(&PropValue::Bool(true)).as_i8(), 1);
        assert_eq!(Tristate::from(&PropValue::Bool(false)).as_i8(), 0);
        assert_eq!(Tristate::from(&PropValue::Int16(-60)).as_i8(), -1);
    }

    #[test]
    fn test_uuid_list_matching_ignores_case() {
        let uuids = PropValue::StrList(vec![
            "00001800-0000-1000-8000-00805f9b34fb".to_string(),
            "0003CBBB-0000-1000-8000-00805F9B0131".to_string(),
        ]);
        assert!(uuids.contains_uuid("0003cbbb-0000-1000-8000-00805f9b0131"));
        assert!(!PropValue::Bool(true).contains_uuid("0003cbbb-0000-1000-8000-00805f9b0131"));
    }

    #[test]
    fn test_events_from_property_changes() {
        assert_eq!(
            ConnectionEvent::from_property_change(Role::Peripheral, "RSSI", Tristate::NotBoolean),
            Some(ConnectionEvent::PeripheralDetected)
        );
        assert_eq!(
            ConnectionEvent::from_property_change(Role::Controller, "Discovering", Tristate::No),
            Some(ConnectionEvent::ScanStopped)
        );
        assert_eq!(
            ConnectionEvent::from_property_change(Role::Controller, "Discovering", Tristate::Yes),
            None
        );
        assert_eq!(
            ConnectionEvent::from_property_change(Role::Peripheral, "Connected", Tristate::No),
            Some(ConnectionEvent::PeripheralDisconnected)
        );
        assert_eq!(
            ConnectionEvent::from_property_change(
                Role::WriteCharacteristic,
                "NotifyAcquired",
                Tristate::Yes
            ),
            None
        );
    }

    #[test]
    fn test_declared_properties_fit_cache_limit() {
        for role in Role::ALL {
            assert!(role.declared_properties().len() <= 4);
        }
    }
}
