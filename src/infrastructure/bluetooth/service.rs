//! Client Session
//!
//! Main service that ties the bus transport, the proxy registry, the
//! notification channel and the connection state machine together for the
//! one target peripheral.

use crate::domain::error::ClientError;
use crate::domain::models::{
    AppEvent, ConnectionEvent, ConnectionState, ObjectDescription, PropValue, Role, Tristate,
};
use crate::domain::settings::BleSettings;
use crate::domain::state_machine::{ConnectionActions, ConnectionStateMachine};
use crate::infrastructure::bluetooth::{
    notify::{NotificationCallback, NotificationChannelManager, StreamOutcome},
    protocol::{self, interface, method, property, signal},
    registry::ObjectRegistry,
    transport::{
        BusError, BusEvent, BusTransport, CallId, MethodArgs, MethodCall, Reply, ReplyKind,
        SignalPayload, SignalRule, SubscriptionId,
    },
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Process-wide property change callback: (interface, property, value)
pub type ChangeCallback = Box<dyn FnMut(&str, &str, Tristate)>;

/// Everything the state machine acts on. Kept apart from the event queue and
/// the machine itself so both can be borrowed at once.
struct SessionCore<T: BusTransport> {
    transport: T,
    settings: BleSettings,
    registry: ObjectRegistry,
    notify: NotificationChannelManager,
    events: mpsc::UnboundedSender<AppEvent>,
    pending_calls: HashMap<CallId, String>,
    discovery_filter_set: bool,
}

impl<T: BusTransport> SessionCore<T> {
    fn emit(&self, event: AppEvent) {
        if self.events.send(event).is_err() {
            trace!("No receiver for application events");
        }
    }

    fn send(&mut self, call: MethodCall) -> Result<Option<CallId>, ClientError> {
        let label = call.to_string();
        debug!("Calling {}", label);
        let id = self.transport.call(call)?;
        if let Some(id) = id {
            self.pending_calls.insert(id, label);
        }
        Ok(id)
    }

    fn call_role(
        &mut self,
        role: Role,
        method: &str,
        args: MethodArgs,
        reply: ReplyKind,
    ) -> Result<(), ClientError> {
        let call = self
            .registry
            .proxy(role)
            .method_call(&self.settings.service_name, method, args, reply)?;
        self.send(call).map(|_| ())
    }

    fn set_property(&mut self, role: Role, name: &str, value: PropValue) -> Result<(), ClientError> {
        let call = self
            .registry
            .proxy(role)
            .property_set_call(&self.settings.service_name, name, value)?;
        self.send(call).map(|_| ())
    }

    fn request_notify(&mut self, callback: NotificationCallback) -> Result<(), ClientError> {
        self.notify.request(
            &self.registry,
            &self.settings.service_name,
            &mut self.transport,
            callback,
        )
    }

    /// Callback used when the state machine acquires the channel: values
    /// go out as [`AppEvent::Notification`].
    fn forward_notifications(&self) -> NotificationCallback {
        let events = self.events.clone();
        Box::new(move |value| {
            let _ = events.send(AppEvent::Notification(value));
        })
    }

    fn write_command(&mut self, value: u32) -> Result<(), ClientError> {
        self.registry
            .validate_characteristic(Role::WriteCharacteristic)?;
        let bytes = protocol::encode_command(value).to_vec();
        self.call_role(
            Role::WriteCharacteristic,
            method::WRITE_VALUE,
            MethodArgs::BytesWithOptions(bytes, Vec::new()),
            ReplyKind::Unit,
        )
    }

    fn close_channel(&mut self) {
        if self.notify.close(&mut self.transport) {
            self.emit(AppEvent::ChannelClosed);
        }
    }
}

impl<T: BusTransport> ConnectionActions for SessionCore<T> {
    fn controller_powered(&self) -> Result<bool, ClientError> {
        self.registry
            .proxy(Role::Controller)
            .read_bool(property::POWERED)
    }

    fn peripheral_connected(&self) -> Result<bool, ClientError> {
        self.registry
            .proxy(Role::Peripheral)
            .read_bool(property::CONNECTED)
    }

    fn power_on(&mut self) -> Result<(), ClientError> {
        self.set_property(Role::Controller, property::POWERED, PropValue::Bool(true))
    }

    fn start_scan(&mut self) -> Result<(), ClientError> {
        if !self.discovery_filter_set {
            let filter = vec![(
                property::UUIDS.to_string(),
                PropValue::StrList(vec![self.settings.device_uuid.clone()]),
            )];
            self.call_role(
                Role::Controller,
                method::SET_DISCOVERY_FILTER,
                MethodArgs::Options(filter),
                ReplyKind::Unit,
            )?;
            self.discovery_filter_set = true;
        }

        info!("Starting discovery");
        self.call_role(
            Role::Controller,
            method::START_DISCOVERY,
            MethodArgs::Empty,
            ReplyKind::Unit,
        )
    }

    fn stop_scan(&mut self) -> Result<(), ClientError> {
        info!("Stopping discovery");
        self.call_role(
            Role::Controller,
            method::STOP_DISCOVERY,
            MethodArgs::Empty,
            ReplyKind::Unit,
        )
    }

    fn connect(&mut self) -> Result<(), ClientError> {
        self.call_role(
            Role::Peripheral,
            method::CONNECT,
            MethodArgs::Empty,
            ReplyKind::Unit,
        )
    }

    fn acquire_notify(&mut self) -> Result<(), ClientError> {
        let callback = self.forward_notifications();
        self.request_notify(callback)
    }
}

/// One session with the BlueZ daemon for the configured peripheral
pub struct ClientSession<T: BusTransport> {
    core: SessionCore<T>,
    machine: ConnectionStateMachine,
    queue: VecDeque<ConnectionEvent>,
    change_callback: Option<ChangeCallback>,
    added_subscription: Option<SubscriptionId>,
    removed_subscription: Option<SubscriptionId>,
    objects_call: Option<CallId>,
    connected: bool,
    ready: bool,
    closed: bool,
}

impl<T: BusTransport> ClientSession<T> {
    /// Create a session. Nothing is sent until [`initialize`](Self::initialize).
    pub fn new(transport: T, settings: BleSettings, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            core: SessionCore {
                transport,
                registry: ObjectRegistry::new(&settings),
                settings,
                notify: NotificationChannelManager::new(),
                events,
                pending_calls: HashMap::new(),
                discovery_filter_set: false,
            },
            machine: ConnectionStateMachine::new(),
            queue: VecDeque::new(),
            change_callback: None,
            added_subscription: None,
            removed_subscription: None,
            objects_call: None,
            connected: false,
            ready: false,
            closed: false,
        }
    }

    /// Subscribe to object add/remove signals and start watching the daemon.
    /// Readiness is reported later as [`AppEvent::Ready`].
    pub fn initialize(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;

        let service = self.core.settings.service_name.clone();
        let root = self.core.settings.root_path.clone();
        let rule = |member: &str| SignalRule {
            sender: service.clone(),
            path: root.clone(),
            interface: interface::OBJECT_MANAGER.to_string(),
            member: member.to_string(),
            arg0: None,
        };

        self.added_subscription = Some(
            self.core
                .transport
                .subscribe(rule(signal::INTERFACES_ADDED))?,
        );
        self.removed_subscription = Some(
            self.core
                .transport
                .subscribe(rule(signal::INTERFACES_REMOVED))?,
        );
        self.core.transport.watch_service(&service)?;

        info!("Waiting for {} on the bus", service);
        Ok(())
    }

    pub fn set_change_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str, &str, Tristate) + 'static,
    {
        self.change_callback = Some(Box::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Whether the daemon currently owns its bus name
    pub fn is_service_connected(&self) -> bool {
        self.connected
    }

    pub fn is_channel_open(&self) -> bool {
        self.core.notify.is_open()
    }

    pub fn power_on(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.power_on()
    }

    pub fn start_scan(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.start_scan()
    }

    pub fn stop_scan(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.stop_scan()
    }

    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.connect()
    }

    /// Acquire the notification channel with a custom callback.
    pub fn acquire_notify<F>(&mut self, callback: F) -> Result<(), ClientError>
    where
        F: FnMut(u8) + 'static,
    {
        self.ensure_open()?;
        self.core.request_notify(Box::new(callback))
    }

    /// Write a command to the write characteristic (4 bytes, big-endian).
    pub fn write_command(&mut self, value: u32) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.write_command(value)
    }

    pub fn set_property(&mut self, role: Role, name: &str, value: PropValue) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.core.set_property(role, name, value)
    }

    pub fn read_boolean_property(&self, role: Role, name: &str) -> Result<bool, ClientError> {
        self.core.registry.proxy(role).read_bool(name)
    }

    /// Handle one event from the transport, then run every connection event
    /// it produced through the state machine.
    pub fn dispatch(&mut self, event: BusEvent) {
        if self.closed {
            trace!("Dropping {:?} after shutdown", event);
            return;
        }

        match event {
            BusEvent::ServiceConnected => self.on_service_connected(),
            BusEvent::ServiceDisconnected => self.on_service_disconnected(),
            BusEvent::Reply { call, outcome } => self.on_reply(call, outcome),
            BusEvent::Signal {
                subscription,
                payload,
            } => self.on_signal(subscription, payload),
            BusEvent::StreamReadable { stream, chunk } => {
                let outcome = self
                    .core
                    .notify
                    .on_readable(stream, &chunk, &mut self.core.transport);
                if outcome == StreamOutcome::Closed {
                    self.core.emit(AppEvent::ChannelClosed);
                }
            }
            BusEvent::StreamHangup { stream } => {
                let outcome = self.core.notify.on_hangup(stream, &mut self.core.transport);
                if outcome == StreamOutcome::Closed {
                    self.core.emit(AppEvent::ChannelClosed);
                }
            }
        }

        self.drain_queue();
    }

    /// Cancel outstanding calls, close the channel, drop every subscription
    /// and release the transport. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Shutting down session");

        for (call, label) in self.core.pending_calls.drain() {
            debug!("Cancelling {}", label);
            self.core.transport.cancel(call);
        }
        self.objects_call = None;
        self.core.notify.cancel_pending(&mut self.core.transport);
        self.core.close_channel();

        self.core.registry.release(&mut self.core.transport);
        for subscription in [self.added_subscription.take(), self.removed_subscription.take()]
            .into_iter()
            .flatten()
        {
            self.core.transport.unsubscribe(subscription);
        }

        self.queue.clear();
        self.core.transport.close();
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn on_service_connected(&mut self) {
        info!("{} appeared on the bus", self.core.settings.service_name);
        self.connected = true;

        if self.objects_call.is_some() {
            return;
        }

        let call = MethodCall {
            destination: self.core.settings.service_name.clone(),
            path: self.core.settings.root_path.clone(),
            interface: interface::OBJECT_MANAGER.to_string(),
            method: method::GET_MANAGED_OBJECTS.to_string(),
            args: MethodArgs::Empty,
            reply: ReplyKind::ManagedObjects,
        };
        match self.core.send(call) {
            Ok(id) => self.objects_call = id,
            Err(e) => {
                warn!("Failed to request managed objects: {}", e);
                self.snapshot_done();
            }
        }
    }

    /// The daemon took every object, call and filter with it. Forget them
    /// all and start over from INIT once it comes back.
    fn on_service_disconnected(&mut self) {
        warn!("{} left the bus", self.core.settings.service_name);
        self.connected = false;

        for (call, label) in self.core.pending_calls.drain() {
            debug!("Abandoning {}", label);
            self.core.transport.cancel(call);
        }
        self.objects_call = None;
        self.core.notify.cancel_pending(&mut self.core.transport);
        self.core.close_channel();
        self.core.registry.release(&mut self.core.transport);
        self.core.discovery_filter_set = false;

        self.queue.clear();
        self.machine.reset();
        for state in self.machine.take_transitions() {
            self.core.emit(AppEvent::StateChanged(state));
        }
    }

    fn on_reply(&mut self, call: CallId, outcome: Result<Reply, BusError>) {
        if self.core.notify.owns(call) {
            let core = &mut self.core;
            match core.notify.on_reply(call, outcome, &mut core.transport) {
                Ok(mtu) => core.emit(AppEvent::ChannelOpened { mtu }),
                Err(e) => warn!("Failed to acquire notify: {}", e),
            }
            return;
        }

        let Some(label) = self.core.pending_calls.remove(&call) else {
            debug!("Reply for unknown call {:?}", call);
            return;
        };

        if self.objects_call == Some(call) {
            self.objects_call = None;
            self.on_snapshot(outcome);
            return;
        }

        match outcome {
            Ok(_) => debug!("{} succeeded", label),
            Err(e) => warn!("{} failed: {}", label, e),
        }
    }

    fn on_snapshot(&mut self, outcome: Result<Reply, BusError>) {
        match outcome {
            Ok(Reply::ManagedObjects(objects)) => {
                info!("Received {} managed objects", objects.len());
                for object in &objects {
                    for description in &object.interfaces {
                        self.core
                            .registry
                            .bind(&object.path, description, &mut self.core.transport);
                    }
                }
            }
            Ok(other) => warn!("Unexpected GetManagedObjects reply: {:?}", other),
            Err(e) => warn!("GetManagedObjects failed: {}", e),
        }
        self.snapshot_done();
    }

    fn snapshot_done(&mut self) {
        if !self.ready {
            self.ready = true;
            self.core.emit(AppEvent::Ready);
        }
        if self.machine.state() == ConnectionState::Init
            && !self.queue.contains(&ConnectionEvent::ClientReady)
        {
            self.queue.push_back(ConnectionEvent::ClientReady);
        }
    }

    fn on_signal(&mut self, subscription: SubscriptionId, payload: SignalPayload) {
        match payload {
            SignalPayload::InterfacesAdded(object)
                if self.added_subscription == Some(subscription) =>
            {
                self.on_object_added(object)
            }
            SignalPayload::InterfacesRemoved { path, interfaces }
                if self.removed_subscription == Some(subscription) =>
            {
                for name in &interfaces {
                    let removed = self
                        .core
                        .registry
                        .unbind(&path, name, &mut self.core.transport);
                    if removed == Some(Role::NotifyCharacteristic)
                        && self.core.notify.path() == Some(path.as_str())
                    {
                        self.core.close_channel();
                    }
                }
            }
            SignalPayload::PropertiesChanged {
                interface,
                changed,
                invalidated,
            } => match self.core.registry.role_for_subscription(subscription) {
                Some(role) => self.on_properties_changed(role, &interface, changed, &invalidated),
                None => trace!("PropertiesChanged on stale subscription {:?}", subscription),
            },
            other => debug!("Ignoring signal {:?}", other),
        }
    }

    fn on_object_added(&mut self, object: ObjectDescription) {
        for description in &object.interfaces {
            let role = self
                .core
                .registry
                .bind(&object.path, description, &mut self.core.transport);

            // A peripheral coming back in range is announced with its RSSI.
            let has_rssi = description
                .properties
                .iter()
                .any(|(name, _)| name == property::RSSI);
            if role == Some(Role::Peripheral) && has_rssi {
                self.queue.push_back(ConnectionEvent::PeripheralDetected);
            }
        }
    }

    fn on_properties_changed(
        &mut self,
        role: Role,
        interface: &str,
        changed: Vec<(String, PropValue)>,
        invalidated: &[String],
    ) {
        let applied = self
            .core
            .registry
            .apply_changes(role, interface, changed, invalidated);

        for change in applied {
            debug!("{} {} changed: {:?}", role, change.name, change.value);
            if let Some(callback) = self.change_callback.as_mut() {
                callback(&change.interface, &change.name, change.value);
            }

            if let Some(event) = ConnectionEvent::from_property_change(role, &change.name, change.value) {
                if event == ConnectionEvent::PeripheralDisconnected {
                    info!("Peripheral disconnected");
                    self.core.notify.cancel_pending(&mut self.core.transport);
                    self.core.close_channel();
                }
                self.queue.push_back(event);
            }
        }
    }

    fn drain_queue(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            self.machine.handle(event, &mut self.core);
            for state in self.machine.take_transitions() {
                self.core.emit(AppEvent::StateChanged(state));
            }
        }
    }
}

impl<T: BusTransport> Drop for ClientSession<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
