//! In-memory transport that records what the session asks of the bus.

use super::transport::{
    BusTransport, CallId, MethodCall, ReplyKind, SignalRule, StreamId, SubscriptionId,
    TransportError,
};
use std::os::fd::OwnedFd;

#[derive(Debug, Default)]
pub struct RecordingTransport {
    next_id: u64,
    pub calls: Vec<(Option<CallId>, MethodCall)>,
    pub cancelled: Vec<CallId>,
    pub subscriptions: Vec<(SubscriptionId, SignalRule)>,
    pub unsubscribed: Vec<SubscriptionId>,
    pub watched_services: Vec<String>,
    pub streams: Vec<(StreamId, OwnedFd, usize)>,
    pub released: Vec<StreamId>,
    pub close_count: usize,
    pub fail_calls: bool,
}

impl RecordingTransport {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Names of every method called so far, in order
    pub fn methods(&self) -> Vec<&str> {
        self.calls.iter().map(|(_, call)| call.method.as_str()).collect()
    }

    pub fn last_call(&self) -> Option<&(Option<CallId>, MethodCall)> {
        self.calls.last()
    }

    /// Id of the most recent call to `method`
    pub fn call_id(&self, method: &str) -> Option<CallId> {
        self.calls
            .iter()
            .rev()
            .find(|(_, call)| call.method == method)
            .and_then(|(id, _)| *id)
    }

    pub fn subscription_for(&self, path: &str, member: &str) -> Option<SubscriptionId> {
        self.subscriptions
            .iter()
            .rev()
            .find(|(_, rule)| rule.path == path && rule.member == member)
            .map(|(id, _)| *id)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count > 0
    }
}

impl BusTransport for RecordingTransport {
    fn call(&mut self, call: MethodCall) -> Result<Option<CallId>, TransportError> {
        if self.fail_calls || self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = match call.reply {
            ReplyKind::NoReply => None,
            _ => Some(CallId(self.next())),
        };
        self.calls.push((id, call));
        Ok(id)
    }

    fn cancel(&mut self, call: CallId) {
        self.cancelled.push(call);
    }

    fn subscribe(&mut self, rule: SignalRule) -> Result<SubscriptionId, TransportError> {
        let id = SubscriptionId(self.next());
        self.subscriptions.push((id, rule));
        Ok(id)
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        self.unsubscribed.push(subscription);
    }

    fn watch_service(&mut self, service: &str) -> Result<(), TransportError> {
        self.watched_services.push(service.to_string());
        Ok(())
    }

    fn watch_stream(&mut self, fd: OwnedFd, read_size: usize) -> Result<StreamId, TransportError> {
        let id = StreamId(self.next());
        self.streams.push((id, fd, read_size));
        Ok(id)
    }

    fn release_stream(&mut self, stream: StreamId) {
        self.released.push(stream);
    }

    fn close(&mut self) {
        self.close_count += 1;
    }
}
