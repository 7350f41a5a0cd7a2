//! In-flight operations awaiting broker acknowledgment
//!
//! Every SUBSCRIBE, UNSUBSCRIBE and QoS 1 PUBLISH gets its own packet
//! identifier and is recorded here before its frame is transmitted.
//! Acknowledgments are correlated by that identifier, so any number of
//! requests may be outstanding at once and acks may arrive in any order.
//!
//! An entry leaves its table exactly once: through [`PendingQueues::acknowledge`],
//! [`PendingQueues::expire`] or [`PendingQueues::drain_unacknowledged`]. The
//! caller reports the outcome for whatever comes back, which makes duplicate
//! or lost failure reports impossible by construction.

use super::codec::{self, QoS};
use super::subscriber::Subscriber;
use crate::error::{SessionError, SessionResult};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Allocates MQTT packet identifiers (1..=65535), skipping ones in use
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            let candidate = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn release(&mut self, packet_id: u16) {
        self.in_use.remove(&packet_id);
    }

    pub fn is_in_use(&self, packet_id: u16) -> bool {
        self.in_use.contains(&packet_id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}

/// Which acknowledgment an entry waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

pub struct PendingSubscribe {
    pub packet_id: u16,
    pub topic: String,
    pub qos: QoS,
    pub subscriber: Arc<dyn Subscriber>,
    pub frame: Bytes,
    pub sent_at: Instant,
    seq: u64,
}

pub struct PendingUnsubscribe {
    pub packet_id: u16,
    pub topic: String,
    pub subscriber: Option<Arc<dyn Subscriber>>,
    pub frame: Bytes,
    pub sent_at: Instant,
    seq: u64,
}

pub struct PendingPublish {
    pub packet_id: u16,
    pub topic: String,
    /// Explicit observer; None reports to the session listener
    pub observer: Option<Arc<dyn Subscriber>>,
    pub frame: Bytes,
    pub sent_at: Instant,
    seq: u64,
}

/// An entry removed from one of the queues
pub enum PendingOperation {
    Subscribe(PendingSubscribe),
    Unsubscribe(PendingUnsubscribe),
    Publish(PendingPublish),
}

impl PendingOperation {
    pub fn kind(&self) -> AckKind {
        match self {
            PendingOperation::Subscribe(_) => AckKind::Subscribe,
            PendingOperation::Unsubscribe(_) => AckKind::Unsubscribe,
            PendingOperation::Publish(_) => AckKind::Publish,
        }
    }

    pub fn packet_id(&self) -> u16 {
        match self {
            PendingOperation::Subscribe(op) => op.packet_id,
            PendingOperation::Unsubscribe(op) => op.packet_id,
            PendingOperation::Publish(op) => op.packet_id,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            PendingOperation::Subscribe(op) => &op.topic,
            PendingOperation::Unsubscribe(op) => &op.topic,
            PendingOperation::Publish(op) => &op.topic,
        }
    }

    fn seq(&self) -> u64 {
        match self {
            PendingOperation::Subscribe(op) => op.seq,
            PendingOperation::Unsubscribe(op) => op.seq,
            PendingOperation::Publish(op) => op.seq,
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind())
            .field("packet_id", &self.packet_id())
            .field("topic", &self.topic())
            .finish()
    }
}

/// Keyed tables of outstanding requests
#[derive(Default)]
pub struct PendingQueues {
    ids: PacketIdAllocator,
    subscribes: HashMap<u16, PendingSubscribe>,
    unsubscribes: HashMap<u16, PendingUnsubscribe>,
    publishes: HashMap<u16, PendingPublish>,
    seq: u64,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Allocate an id, encode with it, and release the id if encoding fails
    fn with_packet_id<F>(&mut self, encode: F) -> SessionResult<(u16, Bytes)>
    where
        F: FnOnce(u16) -> Result<Bytes, codec::CodecError>,
    {
        let packet_id = self.ids.allocate().ok_or(SessionError::PacketIdsExhausted)?;
        match encode(packet_id) {
            Ok(frame) => Ok((packet_id, frame)),
            Err(e) => {
                self.ids.release(packet_id);
                Err(e.into())
            }
        }
    }

    /// Record a SUBSCRIBE; returns its packet id and the frame to transmit
    pub fn enqueue_subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        subscriber: Arc<dyn Subscriber>,
        now: Instant,
    ) -> SessionResult<(u16, Bytes)> {
        let (packet_id, frame) =
            self.with_packet_id(|id| codec::encode_subscribe(id, topic, qos))?;
        let seq = self.next_seq();
        self.subscribes.insert(
            packet_id,
            PendingSubscribe {
                packet_id,
                topic: topic.to_string(),
                qos,
                subscriber,
                frame: frame.clone(),
                sent_at: now,
                seq,
            },
        );
        Ok((packet_id, frame))
    }

    pub fn enqueue_unsubscribe(
        &mut self,
        topic: &str,
        subscriber: Option<Arc<dyn Subscriber>>,
        now: Instant,
    ) -> SessionResult<(u16, Bytes)> {
        let (packet_id, frame) = self.with_packet_id(|id| codec::encode_unsubscribe(id, topic))?;
        let seq = self.next_seq();
        self.unsubscribes.insert(
            packet_id,
            PendingUnsubscribe {
                packet_id,
                topic: topic.to_string(),
                subscriber,
                frame: frame.clone(),
                sent_at: now,
                seq,
            },
        );
        Ok((packet_id, frame))
    }

    /// Record a QoS 1 PUBLISH. QoS 0 never reaches this queue.
    pub fn enqueue_publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        observer: Option<Arc<dyn Subscriber>>,
        now: Instant,
    ) -> SessionResult<(u16, Bytes)> {
        if qos != QoS::AtLeastOnce {
            return Err(SessionError::invalid_argument(
                "only QoS 1 publishes are tracked for acknowledgment",
            ));
        }
        let (packet_id, frame) =
            self.with_packet_id(|id| codec::encode_publish(topic, payload, qos, Some(id)))?;
        let seq = self.next_seq();
        self.publishes.insert(
            packet_id,
            PendingPublish {
                packet_id,
                topic: topic.to_string(),
                observer,
                frame: frame.clone(),
                sent_at: now,
                seq,
            },
        );
        Ok((packet_id, frame))
    }

    /// Remove the entry matching an acknowledgment, if any
    pub fn acknowledge(&mut self, kind: AckKind, packet_id: u16) -> Option<PendingOperation> {
        let removed = match kind {
            AckKind::Subscribe => self
                .subscribes
                .remove(&packet_id)
                .map(PendingOperation::Subscribe),
            AckKind::Unsubscribe => self
                .unsubscribes
                .remove(&packet_id)
                .map(PendingOperation::Unsubscribe),
            AckKind::Publish => self
                .publishes
                .remove(&packet_id)
                .map(PendingOperation::Publish),
        };
        if removed.is_some() {
            self.ids.release(packet_id);
        }
        removed
    }

    /// Remove everything, in the order it was enqueued
    pub fn drain_unacknowledged(&mut self) -> Vec<PendingOperation> {
        let mut drained: Vec<PendingOperation> = self
            .subscribes
            .drain()
            .map(|(_, op)| PendingOperation::Subscribe(op))
            .chain(
                self.unsubscribes
                    .drain()
                    .map(|(_, op)| PendingOperation::Unsubscribe(op)),
            )
            .chain(
                self.publishes
                    .drain()
                    .map(|(_, op)| PendingOperation::Publish(op)),
            )
            .collect();
        drained.sort_by_key(PendingOperation::seq);
        self.ids.clear();
        drained
    }

    /// Remove entries older than `timeout`, in the order they were enqueued
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingOperation> {
        let stale = |sent_at: Instant| now.saturating_duration_since(sent_at) >= timeout;

        let subscribe_ids: Vec<u16> = self
            .subscribes
            .values()
            .filter(|op| stale(op.sent_at))
            .map(|op| op.packet_id)
            .collect();
        let unsubscribe_ids: Vec<u16> = self
            .unsubscribes
            .values()
            .filter(|op| stale(op.sent_at))
            .map(|op| op.packet_id)
            .collect();
        let publish_ids: Vec<u16> = self
            .publishes
            .values()
            .filter(|op| stale(op.sent_at))
            .map(|op| op.packet_id)
            .collect();

        let mut expired: Vec<PendingOperation> = subscribe_ids
            .into_iter()
            .filter_map(|id| self.acknowledge(AckKind::Subscribe, id))
            .collect();
        expired.extend(
            unsubscribe_ids
                .into_iter()
                .filter_map(|id| self.acknowledge(AckKind::Unsubscribe, id)),
        );
        expired.extend(
            publish_ids
                .into_iter()
                .filter_map(|id| self.acknowledge(AckKind::Publish, id)),
        );
        expired.sort_by_key(PendingOperation::seq);
        expired
    }

    pub fn contains(&self, kind: AckKind, packet_id: u16) -> bool {
        match kind {
            AckKind::Subscribe => self.subscribes.contains_key(&packet_id),
            AckKind::Unsubscribe => self.unsubscribes.contains_key(&packet_id),
            AckKind::Publish => self.publishes.contains_key(&packet_id),
        }
    }

    pub fn outstanding(&self, kind: AckKind) -> usize {
        match kind {
            AckKind::Subscribe => self.subscribes.len(),
            AckKind::Unsubscribe => self.unsubscribes.len(),
            AckKind::Publish => self.publishes.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.subscribes.len() + self.unsubscribes.len() + self.publishes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest outstanding entry, used to schedule the ack timeout sweep
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.subscribes
            .values()
            .map(|op| op.sent_at)
            .chain(self.unsubscribes.values().map(|op| op.sent_at))
            .chain(self.publishes.values().map(|op| op.sent_at))
            .min()
    }
}
