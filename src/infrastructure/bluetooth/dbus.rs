//! D-Bus Transport
//!
//! [`BusTransport`] on top of a `zbus` system bus connection. One router task
//! owns the connection's message stream: it sends method calls, matches
//! replies by serial and signals against the registered rules, and reports
//! everything through one unbounded channel of [`BusEvent`]s in the order the
//! bus delivered it. Each acquired notification stream is read by a task of
//! its own.

use crate::domain::models::{InterfaceDescription, ObjectDescription, PropValue};
use crate::infrastructure::bluetooth::transport::{
    BusError, BusEvent, BusTransport, CallId, MethodArgs, MethodCall, Reply, ReplyKind,
    SignalPayload, SignalRule, StreamId, SubscriptionId, TransportError,
};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use zbus::fdo::DBusProxy;
use zbus::message::{Flags, Type as MessageType};
use zbus::names::BusName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, Message, MessageStream};

type PropertyMap = HashMap<String, OwnedValue>;
type InterfaceMap = HashMap<String, PropertyMap>;

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

/// Work handed from the session side to the router task
#[derive(Debug)]
enum Command {
    Call(Option<CallId>, MethodCall),
    Cancel(CallId),
    Subscribe(SubscriptionId, SignalRule),
    Unsubscribe(SubscriptionId),
    WatchService(String),
}

pub struct ZbusTransport {
    connection: Option<Connection>,
    events: mpsc::UnboundedSender<BusEvent>,
    commands: mpsc::UnboundedSender<Command>,
    router: Option<JoinHandle<()>>,
    next_id: u64,
    streams: HashMap<StreamId, JoinHandle<()>>,
}

impl ZbusTransport {
    /// Connect to the system bus. Must be called from within a tokio runtime.
    pub async fn system(events: mpsc::UnboundedSender<BusEvent>) -> zbus::Result<Self> {
        let connection = Connection::system().await?;
        info!(
            "Connected to system bus as {}",
            connection
                .unique_name()
                .map(|name| name.as_str())
                .unwrap_or("<unknown>")
        );
        Ok(Self::with_connection(connection, events))
    }

    /// Wrap an existing connection and start its router task.
    pub fn with_connection(connection: Connection, events: mpsc::UnboundedSender<BusEvent>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let router = BusRouter::new(connection.clone(), events.clone());
        let router = tokio::spawn(router.run(receiver));

        Self {
            connection: Some(connection),
            events,
            commands,
            router: Some(router),
            next_id: 0,
            streams: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn submit(&self, command: Command) -> Result<(), TransportError> {
        if self.connection.is_none() {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(command)
            .map_err(|_| TransportError::Send("bus router has stopped".into()))
    }
}

impl BusTransport for ZbusTransport {
    fn call(&mut self, call: MethodCall) -> Result<Option<CallId>, TransportError> {
        let id = match call.reply {
            ReplyKind::NoReply => None,
            _ => Some(CallId(self.next_id())),
        };
        trace!("Queueing {}", call);
        self.submit(Command::Call(id, call))?;
        Ok(id)
    }

    fn cancel(&mut self, call: CallId) {
        let _ = self.commands.send(Command::Cancel(call));
    }

    fn subscribe(&mut self, rule: SignalRule) -> Result<SubscriptionId, TransportError> {
        let id = SubscriptionId(self.next_id());
        self.submit(Command::Subscribe(id, rule))?;
        Ok(id)
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        let _ = self.commands.send(Command::Unsubscribe(subscription));
    }

    fn watch_service(&mut self, service: &str) -> Result<(), TransportError> {
        self.submit(Command::WatchService(service.to_string()))
    }

    fn watch_stream(&mut self, fd: OwnedFd, read_size: usize) -> Result<StreamId, TransportError> {
        if self.connection.is_none() {
            return Err(TransportError::Closed);
        }

        let stream = readable_stream(fd)?;
        let id = StreamId(self.next_id());
        let events = self.events.clone();
        let task = tokio::spawn(read_stream(id, stream, read_size, events));

        self.streams.insert(id, task);
        Ok(id)
    }

    fn release_stream(&mut self, stream: StreamId) {
        // Aborting drops the AsyncFd, which closes the descriptor.
        if let Some(task) = self.streams.remove(&stream) {
            task.abort();
        }
    }

    fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let tasks = self
            .streams
            .drain()
            .map(|(_, t)| t)
            .chain(self.router.take());
        for task in tasks {
            task.abort();
        }

        drop(connection);
        info!("System bus connection released");
    }
}

impl Drop for ZbusTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// A call waiting for its reply, keyed by the serial of the request
#[derive(Debug)]
struct PendingCall {
    id: CallId,
    kind: ReplyKind,
    label: String,
}

#[derive(Debug)]
struct Route {
    rule: MatchRule<'static>,
    member: String,
}

/// Registered signal rules. Subscriptions are matched in id order so a
/// signal wanted by several of them fans out deterministically.
#[derive(Debug, Default)]
struct SignalRoutes {
    routes: BTreeMap<SubscriptionId, Route>,
    service: Option<MatchRule<'static>>,
}

impl SignalRoutes {
    fn insert(&mut self, id: SubscriptionId, rule: &SignalRule) -> zbus::Result<MatchRule<'static>> {
        let match_rule = signal_rule(rule)?;
        self.routes.insert(
            id,
            Route {
                rule: match_rule.clone(),
                member: rule.member.clone(),
            },
        );
        Ok(match_rule)
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<MatchRule<'static>> {
        self.routes.remove(&id).map(|route| route.rule)
    }

    /// Events for one incoming signal, in subscription order.
    fn events_for(&self, message: &Message) -> Vec<BusEvent> {
        if let Some(rule) = &self.service {
            if rule.matches(message).unwrap_or(false) {
                return owner_change(message).into_iter().collect();
            }
        }

        self.routes
            .iter()
            .filter(|(_, route)| route.rule.matches(message).unwrap_or(false))
            .filter_map(|(id, route)| match decode_signal(&route.member, message) {
                Ok(payload) => Some(BusEvent::Signal {
                    subscription: *id,
                    payload,
                }),
                Err(e) => {
                    warn!("Malformed {} signal: {}", route.member, e);
                    None
                }
            })
            .collect()
    }
}

/// Single reader of the connection. Owns the pending calls and the signal
/// routes so that replies and signals leave in arrival order.
struct BusRouter {
    connection: Connection,
    events: mpsc::UnboundedSender<BusEvent>,
    pending: HashMap<NonZeroU32, PendingCall>,
    signals: SignalRoutes,
}

impl BusRouter {
    fn new(connection: Connection, events: mpsc::UnboundedSender<BusEvent>) -> Self {
        Self {
            connection,
            events,
            pending: HashMap::new(),
            signals: SignalRoutes::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // Open the stream before anything is sent so no reply can slip past.
        let mut stream = MessageStream::from(&self.connection);
        let dbus = match DBusProxy::new(&self.connection).await {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("Failed to reach the bus daemon: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command, &dbus).await,
                    None => break,
                },
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        if !self.route(&message) {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("Unreadable message: {}", e),
                    None => {
                        warn!("System bus connection lost");
                        break;
                    }
                },
            }
        }
        debug!("Bus router stopped");
    }

    async fn execute(&mut self, command: Command, dbus: &DBusProxy<'_>) {
        match command {
            Command::Call(id, call) => self.send_call(id, call).await,
            Command::Cancel(id) => self.pending.retain(|_, pending| pending.id != id),
            Command::Subscribe(id, rule) => match self.signals.insert(id, &rule) {
                Ok(match_rule) => {
                    if let Err(e) = dbus.add_match_rule(match_rule).await {
                        error!(
                            "Signal subscription {}.{} on {} failed: {}",
                            rule.interface, rule.member, rule.path, e
                        );
                        self.signals.remove(id);
                        return;
                    }
                    debug!("Subscribed to {}.{} on {}", rule.interface, rule.member, rule.path);
                }
                Err(e) => error!("Invalid signal rule for {}: {}", rule.path, e),
            },
            Command::Unsubscribe(id) => {
                if let Some(match_rule) = self.signals.remove(id) {
                    if let Err(e) = dbus.remove_match_rule(match_rule).await {
                        debug!("Failed to drop match rule: {}", e);
                    }
                }
            }
            Command::WatchService(service) => self.watch_service(&service, dbus).await,
        }
    }

    async fn send_call(&mut self, id: Option<CallId>, call: MethodCall) {
        let message = match build_call(&call) {
            Ok(message) => message,
            Err(e) => return self.fail(id, &call, e),
        };
        let serial = message.primary_header().serial_num();

        if let Some(id) = id {
            self.pending.insert(
                serial,
                PendingCall {
                    id,
                    kind: call.reply,
                    label: call.to_string(),
                },
            );
        }

        if let Err(e) = self.connection.send(&message).await {
            self.pending.remove(&serial);
            self.fail(id, &call, e);
        }
    }

    fn fail(&self, id: Option<CallId>, call: &MethodCall, err: zbus::Error) {
        match id {
            Some(id) => {
                self.emit(BusEvent::Reply {
                    call: id,
                    outcome: Err(bus_error(err)),
                });
            }
            None => debug!("{} failed: {}", call, err),
        }
    }

    async fn watch_service(&mut self, service: &str, dbus: &DBusProxy<'_>) {
        let rule = match owner_rule(service) {
            Ok(rule) => rule,
            Err(e) => {
                error!("Cannot watch {}: {}", service, e);
                return;
            }
        };
        if let Some(previous) = self.signals.service.take() {
            let _ = dbus.remove_match_rule(previous).await;
        }
        if let Err(e) = dbus.add_match_rule(rule.clone()).await {
            error!("Watching {} failed: {}", service, e);
            return;
        }
        self.signals.service = Some(rule);

        // The rule is in place first so an owner change between the two is
        // not missed.
        let owned = match BusName::try_from(service) {
            Ok(name) => dbus.name_has_owner(name).await.map_err(zbus::Error::from),
            Err(e) => Err(zbus::Error::from(e)),
        };
        match owned {
            Ok(true) => {
                self.emit(BusEvent::ServiceConnected);
            }
            Ok(false) => info!("{} is not running yet", service),
            Err(e) => warn!("Failed to look up the owner of {}: {}", service, e),
        }
    }

    /// Returns false once nobody is listening for events any more.
    fn route(&mut self, message: &Message) -> bool {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let Some(pending) = message
                    .header()
                    .reply_serial()
                    .and_then(|serial| self.pending.remove(&serial))
                else {
                    return true;
                };
                trace!("Reply to {}", pending.label);

                let outcome = if message.message_type() == MessageType::Error {
                    Err(bus_error(zbus::Error::from(message.clone())))
                } else {
                    decode_reply(pending.kind, message)
                };
                self.emit(BusEvent::Reply {
                    call: pending.id,
                    outcome,
                })
            }
            MessageType::Signal => self
                .signals
                .events_for(message)
                .into_iter()
                .all(|event| self.emit(event)),
            _ => true,
        }
    }

    fn emit(&self, event: BusEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

fn build_call(call: &MethodCall) -> zbus::Result<Message> {
    let mut builder = Message::method_call(call.path.as_str(), call.method.as_str())?
        .destination(call.destination.as_str())?
        .interface(call.interface.as_str())?;
    if call.reply == ReplyKind::NoReply {
        builder = builder.with_flags(Flags::NoReplyExpected)?;
    }

    match &call.args {
        MethodArgs::Empty => builder.build(&()),
        MethodArgs::Options(options) => builder.build(&to_dict(options)?),
        MethodArgs::BytesWithOptions(bytes, options) => {
            builder.build(&(bytes.as_slice(), to_dict(options)?))
        }
        MethodArgs::SetProperty {
            interface,
            name,
            value,
        } => builder.build(&(interface.as_str(), name.as_str(), to_value(value)?)),
    }
}

fn bus_error(err: zbus::Error) -> BusError {
    match err {
        zbus::Error::MethodError(name, message, _) => BusError::Remote {
            name: name.to_string(),
            message: message.unwrap_or_default(),
        },
        zbus::Error::Variant(e) => BusError::Malformed(e.to_string()),
        other => BusError::Failed(other.to_string()),
    }
}

fn decode_reply(kind: ReplyKind, message: &Message) -> Result<Reply, BusError> {
    let body = message.body();
    match kind {
        ReplyKind::NoReply | ReplyKind::Unit => Ok(Reply::Unit),
        ReplyKind::ManagedObjects => {
            let objects: HashMap<OwnedObjectPath, InterfaceMap> = body
                .deserialize()
                .map_err(|e| BusError::Malformed(e.to_string()))?;
            let mut objects: Vec<ObjectDescription> = objects
                .into_iter()
                .map(|(path, interfaces)| describe_object(path.as_str(), interfaces))
                .collect();
            objects.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(Reply::ManagedObjects(objects))
        }
        ReplyKind::AcquiredStream => {
            let (fd, mtu): (zbus::zvariant::OwnedFd, u16) = body
                .deserialize()
                .map_err(|e| BusError::Malformed(e.to_string()))?;
            Ok(Reply::Stream {
                fd: OwnedFd::from(fd),
                mtu,
            })
        }
    }
}

fn signal_rule(rule: &SignalRule) -> zbus::Result<MatchRule<'static>> {
    let mut builder = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(rule.sender.clone())?
        .path(rule.path.clone())?
        .interface(rule.interface.clone())?
        .member(rule.member.clone())?;
    if let Some(arg0) = &rule.arg0 {
        builder = builder.arg(0, arg0.clone())?;
    }
    Ok(builder.build())
}

fn owner_rule(service: &str) -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(DBUS_SERVICE)?
        .interface(DBUS_SERVICE)?
        .member(NAME_OWNER_CHANGED)?
        .arg(0, service.to_string())?
        .build())
}

fn owner_change(message: &Message) -> Option<BusEvent> {
    let (_, old_owner, new_owner): (String, String, String) = match message.body().deserialize() {
        Ok(args) => args,
        Err(e) => {
            warn!("Malformed {}: {}", NAME_OWNER_CHANGED, e);
            return None;
        }
    };

    match (old_owner.is_empty(), new_owner.is_empty()) {
        (true, false) => Some(BusEvent::ServiceConnected),
        (false, true) => Some(BusEvent::ServiceDisconnected),
        _ => None,
    }
}

fn decode_signal(member: &str, message: &Message) -> zbus::Result<SignalPayload> {
    let body = message.body();
    match member {
        "InterfacesAdded" => {
            let (path, interfaces): (OwnedObjectPath, InterfaceMap) = body.deserialize()?;
            Ok(SignalPayload::InterfacesAdded(describe_object(
                path.as_str(),
                interfaces,
            )))
        }
        "InterfacesRemoved" => {
            let (path, interfaces): (OwnedObjectPath, Vec<String>) = body.deserialize()?;
            Ok(SignalPayload::InterfacesRemoved {
                path: path.to_string(),
                interfaces,
            })
        }
        "PropertiesChanged" => {
            let (interface, changed, invalidated): (String, PropertyMap, Vec<String>) =
                body.deserialize()?;
            Ok(SignalPayload::PropertiesChanged {
                interface,
                changed: changed
                    .iter()
                    .map(|(name, value)| (name.clone(), from_value(value)))
                    .collect(),
                invalidated,
            })
        }
        other => Err(zbus::Error::Failure(format!("unsupported signal {}", other))),
    }
}

/// Register an acquired fd with the reactor for read readiness.
fn readable_stream(fd: OwnedFd) -> Result<AsyncFd<UnixStream>, TransportError> {
    let stream = UnixStream::from(fd);
    stream
        .set_nonblocking(true)
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    AsyncFd::with_interest(stream, Interest::READABLE).map_err(|e| TransportError::Stream(e.to_string()))
}

async fn read_stream(
    id: StreamId,
    stream: AsyncFd<UnixStream>,
    read_size: usize,
    events: mpsc::UnboundedSender<BusEvent>,
) {
    let mut buf = vec![0u8; read_size];
    loop {
        let mut guard = match stream.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Stream {:?} poll failed: {}", id, e);
                let _ = events.send(BusEvent::StreamHangup { stream: id });
                return;
            }
        };

        match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
            Ok(Ok(n)) => {
                let event = BusEvent::StreamReadable {
                    stream: id,
                    chunk: buf[..n].to_vec(),
                };
                if events.send(event).is_err() || n == 0 {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!("Stream {:?} read failed: {}", id, e);
                let _ = events.send(BusEvent::StreamHangup { stream: id });
                return;
            }
            Err(_would_block) => continue,
        }
    }
}

fn describe_object(path: &str, interfaces: InterfaceMap) -> ObjectDescription {
    let mut interfaces: Vec<InterfaceDescription> = interfaces
        .into_iter()
        .map(|(name, properties)| InterfaceDescription {
            name,
            properties: properties
                .iter()
                .map(|(prop, value)| (prop.clone(), from_value(value)))
                .collect(),
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));

    ObjectDescription {
        path: path.to_string(),
        interfaces,
    }
}

fn from_value(value: &Value<'_>) -> PropValue {
    match value {
        Value::Bool(v) => PropValue::Bool(*v),
        Value::U8(v) => PropValue::Byte(*v),
        Value::I16(v) => PropValue::Int16(*v),
        Value::U16(v) => PropValue::UInt16(*v),
        Value::I32(v) => PropValue::Int32(*v),
        Value::U32(v) => PropValue::UInt32(*v),
        Value::Str(v) => PropValue::Str(v.to_string()),
        Value::ObjectPath(v) => PropValue::ObjectPath(v.to_string()),
        Value::Value(inner) => from_value(inner),
        Value::Array(array) => {
            let signature = value.value_signature().to_string();
            match signature.as_str() {
                "as" => PropValue::StrList(
                    array
                        .inner()
                        .iter()
                        .filter_map(|item| match item {
                            Value::Str(s) => Some(s.to_string()),
                            _ => None,
                        })
                        .collect(),
                ),
                "ay" => PropValue::Bytes(
                    array
                        .inner()
                        .iter()
                        .filter_map(|item| match item {
                            Value::U8(b) => Some(*b),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => PropValue::Other(signature),
            }
        }
        other => PropValue::Other(other.value_signature().to_string()),
    }
}

fn to_value(value: &PropValue) -> zbus::Result<Value<'static>> {
    Ok(match value {
        PropValue::Bool(v) => Value::from(*v),
        PropValue::Byte(v) => Value::from(*v),
        PropValue::Int16(v) => Value::from(*v),
        PropValue::UInt16(v) => Value::from(*v),
        PropValue::Int32(v) => Value::from(*v),
        PropValue::UInt32(v) => Value::from(*v),
        PropValue::Str(v) => Value::from(v.clone()),
        PropValue::ObjectPath(v) => Value::from(ObjectPath::try_from(v.clone())?),
        PropValue::StrList(v) => Value::from(v.clone()),
        PropValue::Bytes(v) => Value::from(v.clone()),
        PropValue::Other(signature) => {
            return Err(zbus::Error::Failure(format!(
                "cannot encode value of type '{}'",
                signature
            )))
        }
    })
}

fn to_dict(options: &[(String, PropValue)]) -> zbus::Result<HashMap<String, Value<'static>>> {
    options
        .iter()
        .map(|(key, value)| Ok((key.clone(), to_value(value)?)))
        .collect()
}
