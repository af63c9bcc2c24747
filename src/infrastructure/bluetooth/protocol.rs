//! BlueZ Protocol
//!
//! Bus names, object paths, interfaces and wire formats used to talk to the
//! BlueZ daemon and to the target peripheral.

pub use crate::domain::settings::{
    BLUEZ_PATH, BLUEZ_SERVICE, DEVICE_UUID, READ_CHAR_UUID, ROOT_PATH, WRITE_CHAR_UUID,
};

pub mod interface {
    pub const ADAPTER: &str = "org.bluez.Adapter1";
    pub const DEVICE: &str = "org.bluez.Device1";
    pub const GATT_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
    pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
}

pub mod method {
    pub const GET_MANAGED_OBJECTS: &str = "GetManagedObjects";
    pub const SET_DISCOVERY_FILTER: &str = "SetDiscoveryFilter";
    pub const START_DISCOVERY: &str = "StartDiscovery";
    pub const STOP_DISCOVERY: &str = "StopDiscovery";
    pub const CONNECT: &str = "Connect";
    pub const ACQUIRE_NOTIFY: &str = "AcquireNotify";
    pub const WRITE_VALUE: &str = "WriteValue";
    pub const SET: &str = "Set";
}

pub mod signal {
    pub const INTERFACES_ADDED: &str = "InterfacesAdded";
    pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";
    pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";
}

pub mod property {
    pub const POWERED: &str = "Powered";
    pub const CONNECTED: &str = "Connected";
    pub const RSSI: &str = "RSSI";
    pub const UUID: &str = "UUID";
    pub const UUIDS: &str = "UUIDs";
}

/// Bytes read from the notification stream per readable event
pub const NOTIFY_READ_SIZE: usize = 512;

/// Encode a command value for `WriteValue`: 4 bytes, most significant first.
pub fn encode_command(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// The peripheral carries one meaningful byte per notification.
/// An empty chunk means the stream was closed.
pub fn decode_notification(chunk: &[u8]) -> Option<u8> {
    chunk.first().copied()
}

/// Interfaces that never map to a tracked role
pub fn is_meta_interface(name: &str) -> bool {
    name == interface::INTROSPECTABLE || name == interface::PROPERTIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_is_big_endian() {
        assert_eq!(encode_command(0xFF00_0080), [0xFF, 0x00, 0x00, 0x80]);
        assert_eq!(encode_command(1), [0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_notification_uses_first_byte_only() {
        assert_eq!(decode_notification(&[0x01, 0xAA, 0xBB]), Some(0x01));
        assert_eq!(decode_notification(&[]), None);
    }

    #[test]
    fn test_meta_interfaces_are_skipped() {
        assert!(is_meta_interface("org.freedesktop.DBus.Properties"));
        assert!(!is_meta_interface(interface::ADAPTER));
    }
}
