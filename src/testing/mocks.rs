//! Mock implementations for testing
//!
//! [`MockTransport`] implements [`Transport`] against an in-memory broker
//! whose behaviour is scripted through a shared [`MockBroker`] handle: tests
//! keep the handle, give the transport to the session, and then inspect the
//! frames the session sent or inject frames for it to receive.

use crate::auth::{AuthError, RegistrationClient, RegistrationRequest};
use crate::transport::mqtt::codec::{
    self, CodecError, Connect, ConnectReturnCode, Packet, QoS, SubscribeReasonCode,
};
use crate::transport::mqtt::{SessionEvent, Subscriber};
use crate::transport::{Endpoint, SendStatus, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct BrokerState {
    open: bool,
    announce_connected: bool,
    opens: usize,
    fail_open: bool,
    connack_code: ConnectReturnCode,
    auto_connack: bool,
    auto_pingresp: bool,
    hold_acks: bool,
    write_blocked: bool,
    write_ready_pending: bool,
    drop_reason: Option<String>,
    rejected_filters: HashSet<String>,
    sent: Vec<Packet>,
    inbound: VecDeque<Bytes>,
    held: Vec<Bytes>,
    last_endpoint: Option<Endpoint>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            open: false,
            announce_connected: false,
            opens: 0,
            fail_open: false,
            connack_code: ConnectReturnCode::Success,
            auto_connack: true,
            auto_pingresp: true,
            hold_acks: false,
            write_blocked: false,
            write_ready_pending: false,
            drop_reason: None,
            rejected_filters: HashSet::new(),
            sent: Vec::new(),
            inbound: VecDeque::new(),
            held: Vec::new(),
            last_endpoint: None,
        }
    }
}

impl BrokerState {
    /// Queue a reply; acknowledgments may be held for the test to release
    fn reply(&mut self, frame: Result<Bytes, CodecError>, holdable: bool) {
        match frame {
            Ok(frame) if holdable && self.hold_acks => self.held.push(frame),
            Ok(frame) => self.inbound.push_back(frame),
            Err(e) => warn!(target: "iotlink::testing", error = %e, "mock broker reply not encoded"),
        }
    }

    fn respond(&mut self, packet: &Packet) {
        match packet {
            Packet::Connect(_) if self.auto_connack => {
                let frame = codec::encode_connack(self.connack_code);
                self.reply(frame, false);
            }
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if self.rejected_filters.contains(&filter.path) {
                            SubscribeReasonCode::Failure
                        } else {
                            SubscribeReasonCode::Success(filter.qos)
                        }
                    })
                    .collect();
                self.reply(codec::encode_suback(subscribe.pkid, codes), true);
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.reply(codec::encode_unsuback(unsubscribe.pkid), true);
            }
            Packet::Publish(publish) => {
                if QoS::try_from(publish.qos) == Ok(QoS::AtLeastOnce) {
                    self.reply(codec::encode_puback(publish.pkid), true);
                }
            }
            Packet::PingReq if self.auto_pingresp => {
                self.reply(codec::encode_pingresp(), false);
            }
            _ => {}
        }
    }
}

/// Scripted in-memory broker shared between a test and its [`MockTransport`]
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    activity: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport bound to this broker
    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone())
    }

    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn set_connack_code(&self, code: ConnectReturnCode) {
        lock(&self.state).connack_code = code;
    }

    pub fn set_auto_connack(&self, enabled: bool) {
        lock(&self.state).auto_connack = enabled;
    }

    pub fn set_auto_pingresp(&self, enabled: bool) {
        lock(&self.state).auto_pingresp = enabled;
    }

    /// Hold SUBACK, UNSUBACK and PUBACK until [`take_held`](Self::take_held)
    pub fn set_hold_acks(&self, hold: bool) {
        lock(&self.state).hold_acks = hold;
    }

    /// SUBACK this filter with the failure return code
    pub fn reject_filter(&self, filter: &str) {
        lock(&self.state).rejected_filters.insert(filter.to_string());
    }

    /// While blocked every send returns `WouldBlock`; unblocking reports `WriteReady`
    pub fn set_write_blocked(&self, blocked: bool) {
        let mut state = lock(&self.state);
        if state.write_blocked && !blocked {
            state.write_ready_pending = true;
        }
        state.write_blocked = blocked;
        drop(state);
        self.activity.notify_one();
    }

    /// Deliver raw bytes to the session on its next drive
    pub fn inject(&self, bytes: Bytes) {
        lock(&self.state).inbound.push_back(bytes);
        self.activity.notify_one();
    }

    /// Deliver a PUBLISH to the session
    pub fn inject_publish(&self, topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>) {
        let payload = Bytes::copy_from_slice(payload);
        match codec::encode_publish(topic, payload, qos, packet_id) {
            Ok(frame) => self.inject(frame),
            Err(e) => warn!(target: "iotlink::testing", topic, error = %e, "PUBLISH not injected"),
        }
    }

    /// Acknowledgments held back so far, in the order they were produced
    pub fn take_held(&self) -> Vec<Bytes> {
        std::mem::take(&mut lock(&self.state).held)
    }

    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Make the next drive report the link as lost
    pub fn drop_link(&self, reason: &str) {
        lock(&self.state).drop_reason = Some(reason.to_string());
        self.activity.notify_one();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        lock(&self.state).last_endpoint.clone()
    }

    /// Every packet the session sent, decoded, in order
    pub fn sent_packets(&self) -> Vec<Packet> {
        lock(&self.state).sent.clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    /// Number of sent packets with this name, e.g. `"PINGREQ"`
    pub fn count_sent(&self, name: &str) -> usize {
        lock(&self.state)
            .sent
            .iter()
            .filter(|packet| codec::packet_name(packet) == name)
            .count()
    }

    pub fn connect_packets(&self) -> Vec<Connect> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|packet| match packet {
                Packet::Connect(connect) => Some(connect.clone()),
                _ => None,
            })
            .collect()
    }

    /// Usernames of every CONNECT sent, in order
    pub fn connect_usernames(&self) -> Vec<String> {
        self.connect_packets()
            .into_iter()
            .filter_map(|connect| connect.login.map(|login| login.username))
            .collect()
    }

    /// Filters of every SUBSCRIBE sent, in order
    pub fn subscribed_filters(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|packet| match packet {
                Packet::Subscribe(subscribe) => Some(subscribe.filters.clone()),
                _ => None,
            })
            .flatten()
            .map(|filter| filter.path)
            .collect()
    }

    /// Packet ids of every SUBSCRIBE sent, in order
    pub fn subscribe_packet_ids(&self) -> Vec<u16> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|packet| match packet {
                Packet::Subscribe(subscribe) => Some(subscribe.pkid),
                _ => None,
            })
            .collect()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|packet| match packet {
                Packet::Publish(publish) => Some(publish.topic.clone()),
                _ => None,
            })
            .collect()
    }
}

/// In-memory [`Transport`] backed by a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
}

impl MockTransport {
    pub fn new(broker: MockBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let mut state = lock(&self.broker.state);
        state.opens += 1;
        state.last_endpoint = Some(endpoint.clone());
        if state.fail_open {
            return Err(TransportError::Open {
                address: endpoint.address(),
                reason: "connection refused".to_string(),
            });
        }
        state.open = true;
        state.announce_connected = true;
        state.drop_reason = None;
        state.inbound.clear();
        state.held.clear();
        state.write_ready_pending = false;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = lock(&self.broker.state);
        state.open = false;
        state.inbound.clear();
        state.held.clear();
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<SendStatus, TransportError> {
        let mut state = lock(&self.broker.state);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.write_blocked {
            return Ok(SendStatus::WouldBlock);
        }
        let packet =
            codec::decode_frame(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        state.respond(&packet);
        state.sent.push(packet);
        drop(state);
        self.broker.activity.notify_one();
        Ok(SendStatus::Sent)
    }

    /// Returns as soon as anything is deliverable, otherwise sleeps on the
    /// tokio clock until `timeout`. Nothing is dequeued unless it is returned.
    async fn drive(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = lock(&self.broker.state);
                if let Some(reason) = state.drop_reason.take() {
                    if state.open {
                        state.open = false;
                        state.inbound.clear();
                        state.held.clear();
                        return vec![TransportEvent::Disconnected(reason)];
                    }
                }

                if state.open {
                    let mut events = Vec::new();
                    if state.announce_connected {
                        state.announce_connected = false;
                        events.push(TransportEvent::Connected);
                    }
                    if state.write_ready_pending {
                        state.write_ready_pending = false;
                        events.push(TransportEvent::WriteReady);
                    }
                    events.extend(state.inbound.drain(..).map(TransportEvent::FrameReceived));
                    if !events.is_empty() {
                        return events;
                    }
                }
            }

            tokio::select! {
                _ = self.broker.activity.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.broker.state).open
    }
}

/// Subscriber that records everything it receives
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.messages).clone()
    }

    pub fn message_count(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        lock(&self.events).clone()
    }

    /// Recorded events matching `predicate`
    pub fn count_events(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }
}

impl Subscriber for RecordingSubscriber {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        lock(&self.messages).push((topic.to_string(), payload.to_vec()));
    }

    fn on_event(&self, event: &SessionEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Registration client returning a canned response body
#[derive(Debug, Default)]
pub struct MockRegistrationClient {
    body: String,
    unreachable: Option<String>,
    requests: Mutex<Vec<RegistrationRequest>>,
}

impl MockRegistrationClient {
    pub fn with_body(body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            body: body.into(),
            ..Default::default()
        })
    }

    /// Every call fails as if the service could not be reached
    pub fn unreachable(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            unreachable: Some(reason.into()),
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<RegistrationRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl RegistrationClient for MockRegistrationClient {
    async fn register(&self, request: &RegistrationRequest) -> Result<String, AuthError> {
        lock(&self.requests).push(request.clone());
        match &self.unreachable {
            Some(reason) => Err(AuthError::Unreachable(reason.clone())),
            None => Ok(self.body.clone()),
        }
    }
}
