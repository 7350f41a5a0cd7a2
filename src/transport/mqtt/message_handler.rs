//! Pure routing of decoded packets
//!
//! Turns a broker packet into an [`EventRoute`] the session acts on. Keeping
//! this separate from the client lets the mapping be tested without a
//! transport.

use super::codec::{self, ConnectReturnCode, Packet, QoS};
use super::pending::AckKind;
use bytes::Bytes;
use tracing::debug;

/// Pure routing decisions for inbound packets
pub struct MessageHandler;

impl MessageHandler {
    /// Route a packet received from the broker
    pub fn route_packet(packet: Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(ack) => match ack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged {
                    session_present: ack.session_present,
                },
                code => EventRoute::ConnectionRefused(code),
            },
            Packet::Publish(publish) => match QoS::try_from(publish.qos) {
                Ok(qos) => EventRoute::MessageReceived {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos,
                    packet_id: (qos == QoS::AtLeastOnce).then_some(publish.pkid),
                    retain: publish.retain,
                },
                Err(e) => EventRoute::ProtocolViolation(format!("inbound PUBLISH: {e}")),
            },
            Packet::SubAck(ack) => EventRoute::Acknowledged {
                kind: AckKind::Subscribe,
                packet_id: ack.pkid,
                granted: codec::granted_qos(&ack),
            },
            Packet::PubAck(ack) => EventRoute::Acknowledged {
                kind: AckKind::Publish,
                packet_id: ack.pkid,
                granted: Some(QoS::AtLeastOnce),
            },
            Packet::UnsubAck(ack) => EventRoute::Acknowledged {
                kind: AckKind::Unsubscribe,
                packet_id: ack.pkid,
                granted: None,
            },
            Packet::PingResp => EventRoute::PingResponse,
            Packet::Disconnect => EventRoute::ProtocolViolation(
                "broker sent DISCONNECT".to_string(),
            ),
            other => {
                let name = codec::packet_name(&other);
                debug!(target: "iotlink::session", packet = name, "client-only packet from broker");
                EventRoute::ProtocolViolation(format!("unexpected {name} from broker"))
            }
        }
    }

    /// PUBACK owed for an inbound QoS 1 message
    pub fn acknowledgment_for(qos: QoS, packet_id: Option<u16>) -> Option<Bytes> {
        match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => codec::encode_puback(id).ok(),
            _ => None,
        }
    }
}

/// Routing decisions for broker packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// CONNACK accepted
    ConnectionAcknowledged { session_present: bool },
    /// CONNACK with a refusal code
    ConnectionRefused(ConnectReturnCode),
    /// Application message for registered subscribers
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        packet_id: Option<u16>,
        retain: bool,
    },
    /// SUBACK, UNSUBACK or PUBACK. `granted` is None for a refused SUBACK.
    Acknowledged {
        kind: AckKind,
        packet_id: u16,
        granted: Option<QoS>,
    },
    PingResponse,
    /// Packet a broker must never send; the link is torn down
    ProtocolViolation(String),
}
