//! Bus Transport
//!
//! The capability the session needs from the message bus: method calls with
//! or without a reply, signal subscriptions, service presence, and stream
//! readiness for acquired file descriptors. Everything arrives back as
//! [`BusEvent`]s, delivered in order to one consumer.

use crate::domain::error::ClientError;
use crate::domain::models::{ObjectDescription, PropValue};
use std::fmt;
use std::os::fd::OwnedFd;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Argument shapes used by the methods this client invokes
#[derive(Debug, Clone, PartialEq)]
pub enum MethodArgs {
    Empty,
    /// `a{sv}`
    Options(Vec<(String, PropValue)>),
    /// `ay a{sv}`
    BytesWithOptions(Vec<u8>, Vec<(String, PropValue)>),
    /// `s s v`, for `org.freedesktop.DBus.Properties.Set`
    SetProperty {
        interface: String,
        name: String,
        value: PropValue,
    },
}

/// How the reply of a call should be handled and decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Fire-and-forget: no reply is requested
    NoReply,
    /// Reply carries nothing we use, but errors are reported
    Unit,
    /// `a{oa{sa{sv}}}`
    ManagedObjects,
    /// `h q`
    AcquiredStream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: MethodArgs,
    pub reply: ReplyKind,
}

impl fmt::Display for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} on {}", self.interface, self.method, self.path)
    }
}

/// Decoded reply body
#[derive(Debug)]
pub enum Reply {
    Unit,
    ManagedObjects(Vec<ObjectDescription>),
    Stream { fd: OwnedFd, mtu: u16 },
}

/// A failed call: an error reply from the remote side, a reply that could
/// not be decoded into the requested shape, or a local bus failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("bus failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRule {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Match on the first string argument (e.g. the interface for
    /// `PropertiesChanged`)
    pub arg0: Option<String>,
}

/// Decoded signal body
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    InterfacesAdded(ObjectDescription),
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        interface: String,
        changed: Vec<(String, PropValue)>,
        invalidated: Vec<String>,
    },
}

/// Everything the transport hands back to the session
#[derive(Debug)]
pub enum BusEvent {
    ServiceConnected,
    ServiceDisconnected,
    Reply {
        call: CallId,
        outcome: Result<Reply, BusError>,
    },
    Signal {
        subscription: SubscriptionId,
        payload: SignalPayload,
    },
    StreamReadable {
        stream: StreamId,
        chunk: Vec<u8>,
    },
    StreamHangup {
        stream: StreamId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bus connection is closed")]
    Closed,
    #[error("failed to queue message: {0}")]
    Send(String),
    #[error("stream watch failed: {0}")]
    Stream(String),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Message bus capability used by the session. Implementations must not
/// block: results come back later as [`BusEvent`]s.
pub trait BusTransport {
    /// Queue a method call. Returns the id its reply will carry, or `None`
    /// for [`ReplyKind::NoReply`] calls.
    fn call(&mut self, call: MethodCall) -> Result<Option<CallId>, TransportError>;

    /// Stop waiting for a reply; no event will be delivered for it.
    fn cancel(&mut self, call: CallId);

    fn subscribe(&mut self, rule: SignalRule) -> Result<SubscriptionId, TransportError>;

    fn unsubscribe(&mut self, subscription: SubscriptionId);

    /// Report presence of `service` as `ServiceConnected`/`ServiceDisconnected`.
    fn watch_service(&mut self, service: &str) -> Result<(), TransportError>;

    /// Take ownership of `fd` and deliver each readable event as a chunk of
    /// at most `read_size` bytes.
    fn watch_stream(&mut self, fd: OwnedFd, read_size: usize) -> Result<StreamId, TransportError>;

    /// Stop watching and close the stream.
    fn release_stream(&mut self, stream: StreamId);

    /// Release the bus connection. Calling it again is a no-op.
    fn close(&mut self);
}
