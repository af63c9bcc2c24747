//! Object Screening & Registry
//!
//! Filters bus objects down to the four roles this client tracks and keeps
//! one proxy per role. Objects come from the initial `GetManagedObjects`
//! snapshot and from `InterfacesAdded` signals; a later match for the same
//! role simply rebinds its slot.

use crate::domain::error::ClientError;
use crate::domain::models::{InterfaceDescription, PropValue, Role, Tristate};
use crate::domain::property_cache::PropertyCache;
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::protocol::{self, interface, property, signal};
use crate::infrastructure::bluetooth::transport::{
    BusTransport, MethodArgs, MethodCall, ReplyKind, SignalRule, SubscriptionId,
};
use tracing::{debug, info, warn};

/// Object path and interface a proxy is currently bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub path: String,
    pub interface: String,
}

/// One fixed-role slot: the bound object plus its cached properties
#[derive(Debug)]
pub struct RemoteObjectProxy {
    role: Role,
    binding: Option<Binding>,
    properties: PropertyCache,
    pending: bool,
    subscription: Option<SubscriptionId>,
}

impl RemoteObjectProxy {
    fn new(role: Role) -> Self {
        Self {
            role,
            binding: None,
            properties: PropertyCache::new(role),
            pending: false,
            subscription: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.path.as_str())
    }

    pub fn properties(&self) -> &PropertyCache {
        &self.properties
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Typed boolean read; an unbound slot counts as an unknown value.
    pub fn read_bool(&self, name: &str) -> Result<bool, ClientError> {
        if self.binding.is_none() {
            return Err(ClientError::Unbound(self.role));
        }
        self.properties.get_bool(name)
    }

    /// Build a call to `method` on the bound object and interface.
    pub fn method_call(
        &self,
        service: &str,
        method: &str,
        args: MethodArgs,
        reply: ReplyKind,
    ) -> Result<MethodCall, ClientError> {
        let binding = self.binding.as_ref().ok_or(ClientError::Unbound(self.role))?;
        Ok(MethodCall {
            destination: service.to_string(),
            path: binding.path.clone(),
            interface: binding.interface.clone(),
            method: method.to_string(),
            args,
            reply,
        })
    }

    /// Build an `org.freedesktop.DBus.Properties.Set` call for this object.
    pub fn property_set_call(
        &self,
        service: &str,
        name: &str,
        value: PropValue,
    ) -> Result<MethodCall, ClientError> {
        if !value.is_basic() {
            return Err(ClientError::UnsupportedValue(value.type_tag().to_string()));
        }
        let binding = self.binding.as_ref().ok_or(ClientError::Unbound(self.role))?;
        Ok(MethodCall {
            destination: service.to_string(),
            path: binding.path.clone(),
            interface: interface::PROPERTIES.to_string(),
            method: protocol::method::SET.to_string(),
            args: MethodArgs::SetProperty {
                interface: binding.interface.clone(),
                name: name.to_string(),
                value,
            },
            reply: ReplyKind::Unit,
        })
    }

    /// Bulk-load a property dictionary. Undeclared names are skipped and no
    /// change events are raised.
    fn load(&mut self, properties: &[(String, PropValue)]) {
        for (name, value) in properties {
            if self.properties.is_declared(name) {
                // Declared names cannot be rejected.
                let _ = self.properties.set(name, value.clone());
            }
        }
    }

    /// Apply a live change. Returns the value's tristate when the name is
    /// tracked for this role.
    fn update(&mut self, name: &str, value: PropValue) -> Option<Tristate> {
        let tristate = Tristate::from(&value);
        match self.properties.set(name, value) {
            Ok(()) => Some(tristate),
            Err(e) => {
                debug!("Ignoring change: {}", e);
                None
            }
        }
    }

    /// Fire the one-time "proxy available" hook if the slot was just bound.
    fn mark_available(&mut self) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;
        true
    }
}

/// A live property change that the cache accepted
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub role: Role,
    pub interface: String,
    pub name: String,
    pub value: Tristate,
}

/// The fixed four-slot proxy table plus the screening rules.
#[derive(Debug)]
pub struct ObjectRegistry {
    service: String,
    base_path: String,
    device_uuid: String,
    read_uuid: String,
    write_uuid: String,
    proxies: [RemoteObjectProxy; 4],
}

impl ObjectRegistry {
    pub fn new(settings: &BleSettings) -> Self {
        Self {
            service: settings.service_name.clone(),
            base_path: settings.base_path.clone(),
            device_uuid: settings.device_uuid.clone(),
            read_uuid: settings.read_char_uuid.clone(),
            write_uuid: settings.write_char_uuid.clone(),
            proxies: Role::ALL.map(RemoteObjectProxy::new),
        }
    }

    pub fn proxy(&self, role: Role) -> &RemoteObjectProxy {
        &self.proxies[role.index()]
    }

    /// Decide which role, if any, the interface at `path` belongs to.
    /// Controllers must live under the configured base path.
    pub fn screen(&self, path: &str, description: &InterfaceDescription) -> Option<Role> {
        let name = description.name.as_str();
        if protocol::is_meta_interface(name) {
            return None;
        }

        match name {
            interface::ADAPTER => is_under(path, &self.base_path).then_some(Role::Controller),
            interface::DEVICE => {
                has_uuid(&description.properties, &self.device_uuid).then_some(Role::Peripheral)
            }
            interface::GATT_CHARACTERISTIC => {
                if has_uuid(&description.properties, &self.read_uuid) {
                    Some(Role::NotifyCharacteristic)
                } else if has_uuid(&description.properties, &self.write_uuid) {
                    Some(Role::WriteCharacteristic)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Screen one (path, interface, properties) tuple and bind it on a match.
    /// Returns the role that became available.
    pub fn bind<T: BusTransport>(
        &mut self,
        path: &str,
        description: &InterfaceDescription,
        transport: &mut T,
    ) -> Option<Role> {
        let role = self.screen(path, description)?;
        let rule = SignalRule {
            sender: self.service.clone(),
            path: path.to_string(),
            interface: interface::PROPERTIES.to_string(),
            member: signal::PROPERTIES_CHANGED.to_string(),
            arg0: Some(description.name.clone()),
        };

        let proxy = &mut self.proxies[role.index()];

        if let Some(previous) = proxy.subscription.take() {
            transport.unsubscribe(previous);
        }
        if proxy.path() != Some(path) {
            proxy.properties.clear();
        }

        proxy.binding = Some(Binding {
            path: path.to_string(),
            interface: description.name.clone(),
        });

        match transport.subscribe(rule) {
            Ok(subscription) => proxy.subscription = Some(subscription),
            Err(e) => warn!("Failed to watch properties of {}: {}", path, e),
        }

        proxy.load(&description.properties);
        proxy.pending = true;

        if proxy.mark_available() {
            info!("{} available at {}", role, path);
        }
        Some(role)
    }

    /// Drop the binding of whichever role is bound to (path, interface).
    pub fn unbind<T: BusTransport>(
        &mut self,
        path: &str,
        interface_name: &str,
        transport: &mut T,
    ) -> Option<Role> {
        let proxy = self.proxies.iter_mut().find(|proxy| {
            proxy
                .binding
                .as_ref()
                .is_some_and(|b| b.path == path && b.interface == interface_name)
        })?;

        if let Some(subscription) = proxy.subscription.take() {
            transport.unsubscribe(subscription);
        }
        proxy.binding = None;
        proxy.pending = false;
        proxy.properties.clear();

        info!("{} at {} removed", proxy.role, path);
        Some(proxy.role)
    }

    pub fn role_for_subscription(&self, subscription: SubscriptionId) -> Option<Role> {
        self.proxies
            .iter()
            .find(|proxy| proxy.subscription == Some(subscription))
            .map(|proxy| proxy.role)
    }

    /// Apply a `PropertiesChanged` payload to `role`'s cache. Returns the
    /// changes that were recorded, in signal order.
    pub fn apply_changes(
        &mut self,
        role: Role,
        interface_name: &str,
        changed: Vec<(String, PropValue)>,
        invalidated: &[String],
    ) -> Vec<AppliedChange> {
        let proxy = &mut self.proxies[role.index()];

        match &proxy.binding {
            Some(binding) if binding.interface == interface_name => {}
            _ => {
                debug!("Ignoring {} changes for {}", interface_name, role);
                return Vec::new();
            }
        }

        for name in invalidated {
            proxy.properties.remove(name);
        }

        changed
            .into_iter()
            .filter_map(|(name, value)| {
                proxy.update(&name, value).map(|tristate| AppliedChange {
                    role,
                    interface: interface_name.to_string(),
                    name,
                    value: tristate,
                })
            })
            .collect()
    }

    /// Whether `role` is bound to a characteristic with the expected UUID.
    pub fn validate_characteristic(&self, role: Role) -> Result<(), ClientError> {
        let expected = match role {
            Role::NotifyCharacteristic => &self.read_uuid,
            Role::WriteCharacteristic => &self.write_uuid,
            _ => return Ok(()),
        };

        let proxy = self.proxy(role);
        let binding = proxy.binding().ok_or(ClientError::Unbound(role))?;
        if binding.interface != interface::GATT_CHARACTERISTIC {
            return Err(ClientError::WrongInterface {
                role,
                interface: binding.interface.clone(),
                expected: interface::GATT_CHARACTERISTIC,
            });
        }

        match proxy.properties.get(property::UUID) {
            Ok(uuid) if uuid.contains_uuid(expected) => Ok(()),
            _ => Err(ClientError::UuidMismatch {
                role,
                expected: expected.clone(),
            }),
        }
    }

    /// Unbind every role and remove its property subscription.
    pub fn release<T: BusTransport>(&mut self, transport: &mut T) {
        for proxy in &mut self.proxies {
            if let Some(subscription) = proxy.subscription.take() {
                transport.unsubscribe(subscription);
            }
            proxy.binding = None;
            proxy.pending = false;
            proxy.properties.clear();
        }
    }
}

fn is_under(path: &str, base: &str) -> bool {
    path.strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || base.ends_with('/'))
}

fn has_uuid(properties: &[(String, PropValue)], wanted: &str) -> bool {
    properties
        .iter()
        .filter(|(name, _)| name == property::UUID || name == property::UUIDS)
        .any(|(_, value)| value.contains_uuid(wanted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::RecordingTransport;

    fn iface(name: &str, properties: Vec<(&str, PropValue)>) -> InterfaceDescription {
        InterfaceDescription {
            name: name.to_string(),
            properties: properties
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
    }

    const PATH: &str = "/org/bluez/hci0";

    fn characteristic(uuid: &str) -> InterfaceDescription {
        iface(
            interface::GATT_CHARACTERISTIC,
            vec![("UUID", PropValue::Str(uuid.to_string()))],
        )
    }

    #[test]
    fn test_screening_rules() {
        let registry = ObjectRegistry::new(&BleSettings::default());

        assert_eq!(
            registry.screen(PATH, &iface(interface::ADAPTER, vec![])),
            Some(Role::Controller)
        );
        assert_eq!(registry.screen(PATH, &iface(interface::PROPERTIES, vec![])), None);
        assert_eq!(
            registry.screen(PATH, &characteristic(protocol::READ_CHAR_UUID)),
            Some(Role::NotifyCharacteristic)
        );
        assert_eq!(
            registry.screen(PATH, &characteristic(protocol::WRITE_CHAR_UUID)),
            Some(Role::WriteCharacteristic)
        );
        assert_eq!(
            registry.screen(PATH, &characteristic("00002a00-0000-1000-8000-00805f9b34fb")),
            None
        );

        let other_device = iface(
            interface::DEVICE,
            vec![(
                "UUIDs",
                PropValue::StrList(vec!["0000180f-0000-1000-8000-00805f9b34fb".into()]),
            )],
        );
        assert_eq!(registry.screen(PATH, &other_device), None);

        let target = iface(
            interface::DEVICE,
            vec![(
                "UUIDs",
                PropValue::StrList(vec![
                    "0000180f-0000-1000-8000-00805f9b34fb".into(),
                    protocol::DEVICE_UUID.into(),
                ]),
            )],
        );
        assert_eq!(registry.screen(PATH, &target), Some(Role::Peripheral));
    }

    #[test]
    fn test_bind_loads_declared_properties_silently() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();

        let adapter = iface(
            interface::ADAPTER,
            vec![
                ("Powered", PropValue::Bool(true)),
                ("Alias", PropValue::Str("hci0".into())),
            ],
        );
        let role = registry.bind("/org/bluez/hci0", &adapter, &mut transport);

        assert_eq!(role, Some(Role::Controller));
        let proxy = registry.proxy(Role::Controller);
        assert!(!proxy.is_pending());
        assert_eq!(proxy.read_bool("Powered"), Ok(true));
        assert!(proxy.properties().get("Alias").is_err());

        let rule = &transport.subscriptions[0].1;
        assert_eq!(rule.path, "/org/bluez/hci0");
        assert_eq!(rule.member, "PropertiesChanged");
        assert_eq!(rule.arg0.as_deref(), Some(interface::ADAPTER));
    }

    #[test]
    fn test_rebinding_replaces_previous_object() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();

        let first = "/org/bluez/hci0/dev_00_A0_50_3E_47_9D/service000c/char000d";
        let second = "/org/bluez/hci0/dev_00_A0_50_3E_47_9D/service0011/char0012";
        let mut notify = characteristic(protocol::READ_CHAR_UUID);
        notify
            .properties
            .push(("NotifyAcquired".into(), PropValue::Bool(true)));

        registry.bind(first, &notify, &mut transport);
        let first_sub = registry.proxy(Role::NotifyCharacteristic).subscription().unwrap();

        registry.bind(second, &characteristic(protocol::READ_CHAR_UUID), &mut transport);
        let proxy = registry.proxy(Role::NotifyCharacteristic);

        assert_eq!(proxy.path(), Some(second));
        assert_eq!(transport.unsubscribed, vec![first_sub]);
        assert_eq!(registry.role_for_subscription(first_sub), None);
        // Values from the old object do not leak into the new binding.
        assert!(proxy.properties().get("NotifyAcquired").is_err());

        let bound: Vec<_> = Role::ALL
            .iter()
            .filter_map(|role| registry.proxy(*role).path())
            .collect();
        assert_eq!(bound, vec![second]);
    }

    #[test]
    fn test_live_changes_only_for_declared_names() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();
        registry.bind(
            "/org/bluez/hci0",
            &iface(interface::ADAPTER, vec![]),
            &mut transport,
        );

        let applied = registry.apply_changes(
            Role::Controller,
            interface::ADAPTER,
            vec![
                ("Discovering".into(), PropValue::Bool(false)),
                ("Class".into(), PropValue::UInt32(0x0c010c)),
            ],
            &[],
        );

        assert_eq!(
            applied,
            vec![AppliedChange {
                role: Role::Controller,
                interface: interface::ADAPTER.into(),
                name: "Discovering".into(),
                value: Tristate::No,
            }]
        );
    }

    #[test]
    fn test_unbind_on_removal() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();
        let path = "/org/bluez/hci0/dev_00_A0_50_3E_47_9D";
        let device = iface(
            interface::DEVICE,
            vec![
                ("UUIDs", PropValue::StrList(vec![protocol::DEVICE_UUID.into()])),
                ("Connected", PropValue::Bool(true)),
            ],
        );
        registry.bind(path, &device, &mut transport);

        assert_eq!(
            registry.unbind(path, interface::DEVICE, &mut transport),
            Some(Role::Peripheral)
        );
        let proxy = registry.proxy(Role::Peripheral);
        assert_eq!(proxy.read_bool("Connected"), Err(ClientError::Unbound(Role::Peripheral)));
        assert_eq!(transport.unsubscribed.len(), 1);
    }

    #[test]
    fn test_characteristic_validation() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();

        assert_eq!(
            registry.validate_characteristic(Role::WriteCharacteristic),
            Err(ClientError::Unbound(Role::WriteCharacteristic))
        );

        registry.bind(
            "/org/bluez/hci0/dev_00_A0_50_3E_47_9D/service000c/char0010",
            &characteristic(protocol::WRITE_CHAR_UUID),
            &mut transport,
        );
        assert_eq!(registry.validate_characteristic(Role::WriteCharacteristic), Ok(()));
    }

    #[test]
    fn test_property_set_rejects_container_values() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();
        registry.bind(
            "/org/bluez/hci0",
            &iface(interface::ADAPTER, vec![]),
            &mut transport,
        );
        let proxy = registry.proxy(Role::Controller);

        let call = proxy
            .property_set_call("org.bluez", "Powered", PropValue::Bool(true))
            .unwrap();
        assert_eq!(call.interface, interface::PROPERTIES);
        assert_eq!(
            call.args,
            MethodArgs::SetProperty {
                interface: interface::ADAPTER.into(),
                name: "Powered".into(),
                value: PropValue::Bool(true),
            }
        );

        assert!(matches!(
            proxy.property_set_call("org.bluez", "UUIDs", PropValue::StrList(vec![])),
            Err(ClientError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_controller_must_sit_under_base_path() {
        let registry = ObjectRegistry::new(&BleSettings::default());
        let adapter = iface(interface::ADAPTER, vec![]);

        assert_eq!(registry.screen("/org/bluez/hci1", &adapter), Some(Role::Controller));
        assert_eq!(registry.screen("/org/other/hci0", &adapter), None);
        assert_eq!(registry.screen("/org/bluezz", &adapter), None);
    }

    #[test]
    fn test_release_unbinds_every_role() {
        let mut registry = ObjectRegistry::new(&BleSettings::default());
        let mut transport = RecordingTransport::default();
        registry.bind(
            PATH,
            &iface(interface::ADAPTER, vec![("Powered", PropValue::Bool(true))]),
            &mut transport,
        );
        registry.bind(
            "/org/bluez/hci0/dev_00_A0_50_3E_47_9D/service000c/char000d",
            &characteristic(protocol::READ_CHAR_UUID),
            &mut transport,
        );

        registry.release(&mut transport);

        assert_eq!(transport.unsubscribed.len(), 2);
        assert_eq!(
            registry.proxy(Role::Controller).read_bool("Powered"),
            Err(ClientError::Unbound(Role::Controller))
        );
        assert_eq!(registry.proxy(Role::NotifyCharacteristic).binding(), None);
    }
}
