//! Notification Channel
//!
//! Owns the byte stream handed out by `AcquireNotify` and turns each readable
//! event into a callback with the notification's first byte. At most one
//! channel is open at a time.

use crate::domain::error::ClientError;
use crate::domain::models::Role;
use crate::infrastructure::bluetooth::protocol::{self, method};
use crate::infrastructure::bluetooth::registry::ObjectRegistry;
use crate::infrastructure::bluetooth::transport::{
    BusError, BusTransport, CallId, MethodArgs, Reply, ReplyKind, StreamId,
};
use tracing::{debug, info, warn};

pub type NotificationCallback = Box<dyn FnMut(u8)>;

struct NotificationChannel {
    path: String,
    stream: StreamId,
    mtu: u16,
    callback: NotificationCallback,
}

struct PendingAcquire {
    call: CallId,
    path: String,
    callback: NotificationCallback,
}

/// What happened to the channel as a result of a stream event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Delivered(u8),
    Closed,
    Ignored,
}

#[derive(Default)]
pub struct NotificationChannelManager {
    pending: Option<PendingAcquire>,
    channel: Option<NotificationChannel>,
}

impl NotificationChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn mtu(&self) -> Option<u16> {
        self.channel.as_ref().map(|c| c.mtu)
    }

    pub fn path(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.path.as_str())
    }

    /// Whether `call` is the outstanding `AcquireNotify` request
    pub fn owns(&self, call: CallId) -> bool {
        self.pending.as_ref().is_some_and(|p| p.call == call)
    }

    /// Send `AcquireNotify` to the notify characteristic. The channel opens
    /// once the reply arrives.
    pub fn request<T: BusTransport>(
        &mut self,
        registry: &ObjectRegistry,
        service: &str,
        transport: &mut T,
        callback: NotificationCallback,
    ) -> Result<(), ClientError> {
        registry.validate_characteristic(Role::NotifyCharacteristic)?;

        let proxy = registry.proxy(Role::NotifyCharacteristic);
        let call = proxy.method_call(
            service,
            method::ACQUIRE_NOTIFY,
            MethodArgs::Options(Vec::new()),
            ReplyKind::AcquiredStream,
        )?;
        let path = call.path.clone();

        let id = transport
            .call(call)?
            .ok_or_else(|| ClientError::Transport("no reply handle for AcquireNotify".into()))?;

        // Only the latest request may open the channel.
        if let Some(previous) = self.pending.take() {
            transport.cancel(previous.call);
        }

        debug!("AcquireNotify sent to {}", path);
        self.pending = Some(PendingAcquire {
            call: id,
            path,
            callback,
        });
        Ok(())
    }

    /// Complete the outstanding request. Returns the negotiated MTU.
    pub fn on_reply<T: BusTransport>(
        &mut self,
        call: CallId,
        outcome: Result<Reply, BusError>,
        transport: &mut T,
    ) -> Result<u16, ClientError> {
        let pending = match self.pending.take() {
            Some(p) if p.call == call => p,
            other => {
                self.pending = other;
                return Err(ClientError::MalformedReply {
                    method: method::ACQUIRE_NOTIFY.into(),
                    reason: "reply to an unknown request".into(),
                });
            }
        };

        let (fd, mtu) = match outcome {
            Ok(Reply::Stream { fd, mtu }) => (fd, mtu),
            Ok(other) => {
                return Err(ClientError::MalformedReply {
                    method: method::ACQUIRE_NOTIFY.into(),
                    reason: format!("expected fd and mtu, got {:?}", other),
                })
            }
            Err(BusError::Remote { name, message }) => {
                return Err(ClientError::BusCall {
                    method: method::ACQUIRE_NOTIFY.into(),
                    name,
                    message,
                })
            }
            Err(BusError::Malformed(reason)) => {
                return Err(ClientError::MalformedReply {
                    method: method::ACQUIRE_NOTIFY.into(),
                    reason,
                })
            }
            Err(BusError::Failed(reason)) => return Err(ClientError::Transport(reason)),
        };

        self.close(transport);

        let stream = transport.watch_stream(fd, protocol::NOTIFY_READ_SIZE)?;
        info!("Notification channel open on {} (MTU {})", pending.path, mtu);

        self.channel = Some(NotificationChannel {
            path: pending.path,
            stream,
            mtu,
            callback: pending.callback,
        });
        Ok(mtu)
    }

    /// Handle one chunk read from the stream.
    pub fn on_readable<T: BusTransport>(
        &mut self,
        stream: StreamId,
        chunk: &[u8],
        transport: &mut T,
    ) -> StreamOutcome {
        let Some(channel) = self.channel.as_mut().filter(|c| c.stream == stream) else {
            debug!("Data on stale stream {:?}", stream);
            return StreamOutcome::Ignored;
        };

        match protocol::decode_notification(chunk) {
            Some(value) => {
                (channel.callback)(value);
                StreamOutcome::Delivered(value)
            }
            None => {
                info!("Notification stream closed by peer");
                self.close(transport);
                StreamOutcome::Closed
            }
        }
    }

    pub fn on_hangup<T: BusTransport>(&mut self, stream: StreamId, transport: &mut T) -> StreamOutcome {
        if self.channel.as_ref().map(|c| c.stream) != Some(stream) {
            return StreamOutcome::Ignored;
        }
        warn!("Notification stream hung up");
        self.close(transport);
        StreamOutcome::Closed
    }

    /// Tear down the open channel, if any. Returns whether one was open.
    pub fn close<T: BusTransport>(&mut self, transport: &mut T) -> bool {
        match self.channel.take() {
            Some(channel) => {
                transport.release_stream(channel.stream);
                debug!("Notification channel on {} released", channel.path);
                true
            }
            None => false,
        }
    }

    /// Drop an outstanding request so its reply is never delivered.
    pub fn cancel_pending<T: BusTransport>(&mut self, transport: &mut T) {
        if let Some(pending) = self.pending.take() {
            transport.cancel(pending.call);
        }
    }
}
