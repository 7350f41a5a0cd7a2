//! MQTT 3.1.1 framing over `rumqttc::mqttbytes::v4`
//!
//! Packet layouts, the remaining-length varint and decoding all come from
//! rumqttc. This module narrows them to what a device session exchanges:
//! QoS 0 and 1 only, frames handed around as [`Bytes`], and string fields
//! checked against the 16-bit length prefix before they reach the writer.
//!
//! The broker-side encoders exist for the in-memory broker used in tests.

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::{self, v4};
use std::fmt;
use thiserror::Error;

pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Login, Packet, PubAck, Publish, SubAck, Subscribe,
    SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
};

/// Largest remaining length the fixed header can express
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Codec failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("mqtt protocol error: {0}")]
    Protocol(#[from] mqttbytes::Error),
    #[error("string of {0} bytes exceeds 65535")]
    StringTooLong(usize),
    #[error("unsupported QoS level {0}")]
    UnsupportedQoS(u8),
    #[error("{0} bytes left over after a complete frame")]
    TrailingBytes(usize),
}

/// Delivery guarantee; QoS 2 is not supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(CodecError::UnsupportedQoS(other)),
        }
    }
}

impl TryFrom<mqttbytes::QoS> for QoS {
    type Error = CodecError;

    fn try_from(value: mqttbytes::QoS) -> Result<Self, Self::Error> {
        QoS::try_from(value as u8)
    }
}

impl From<QoS> for mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => mqttbytes::QoS::AtLeastOnce,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", *self as u8)
    }
}

/// Human readable CONNACK return code
pub fn describe_return_code(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
        ConnectReturnCode::BadClientId => "client identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad username or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
    }
}

/// Short name of a packet for logs and protocol errors
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// QoS granted for the single filter a SUBACK answers; None when refused
pub fn granted_qos(ack: &SubAck) -> Option<QoS> {
    match ack.return_codes.first() {
        Some(SubscribeReasonCode::Success(qos)) => QoS::try_from(*qos).ok(),
        _ => None,
    }
}

/// Encode any packet into one complete frame
pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
    check_strings(packet)?;

    let mut buf = BytesMut::new();
    match packet {
        Packet::Connect(connect) => connect.write(&mut buf),
        Packet::ConnAck(ack) => ack.write(&mut buf),
        Packet::Publish(publish) => publish.write(&mut buf),
        Packet::PubAck(ack) => ack.write(&mut buf),
        Packet::Subscribe(subscribe) => subscribe.write(&mut buf),
        Packet::SubAck(ack) => ack.write(&mut buf),
        Packet::Unsubscribe(unsubscribe) => unsubscribe.write(&mut buf),
        Packet::UnsubAck(ack) => ack.write(&mut buf),
        Packet::PingReq => v4::PingReq.write(&mut buf),
        Packet::PingResp => v4::PingResp.write(&mut buf),
        Packet::Disconnect => v4::Disconnect.write(&mut buf),
        Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
            return Err(CodecError::UnsupportedQoS(2))
        }
    }?;

    Ok(buf.freeze())
}

fn check_strings(packet: &Packet) -> Result<(), CodecError> {
    let strings: Vec<&str> = match packet {
        Packet::Connect(connect) => {
            let mut strings = vec![connect.client_id.as_str()];
            if let Some(login) = &connect.login {
                strings.push(&login.username);
                strings.push(&login.password);
            }
            strings
        }
        Packet::Publish(publish) => vec![publish.topic.as_str()],
        Packet::Subscribe(subscribe) => subscribe.filters.iter().map(|f| f.path.as_str()).collect(),
        Packet::Unsubscribe(unsubscribe) => unsubscribe.topics.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    };

    match strings.into_iter().find(|s| s.len() > MAX_STRING_LEN) {
        Some(oversized) => Err(CodecError::StringTooLong(oversized.len())),
        None => Ok(()),
    }
}

/// CONNECT carrying username and password, protocol level 4
pub fn encode_connect(
    client_id: &str,
    username: &str,
    password: &str,
    keep_alive: u16,
    clean_session: bool,
) -> Result<Bytes, CodecError> {
    let mut connect = Connect::new(client_id);
    connect.keep_alive = keep_alive;
    connect.clean_session = clean_session;
    connect.set_login(username, password);
    encode(&Packet::Connect(connect))
}

/// PUBLISH; QoS 1 requires a non-zero packet id
pub fn encode_publish(
    topic: &str,
    payload: Bytes,
    qos: QoS,
    packet_id: Option<u16>,
) -> Result<Bytes, CodecError> {
    let mut publish = Publish::from_bytes(topic, qos.into(), payload);
    if let Some(id) = packet_id {
        publish.pkid = id;
    }
    encode(&Packet::Publish(publish))
}

pub fn encode_subscribe(packet_id: u16, filter: &str, qos: QoS) -> Result<Bytes, CodecError> {
    let mut subscribe = Subscribe::new(filter, qos.into());
    subscribe.pkid = packet_id;
    encode(&Packet::Subscribe(subscribe))
}

pub fn encode_unsubscribe(packet_id: u16, filter: &str) -> Result<Bytes, CodecError> {
    let mut unsubscribe = Unsubscribe::new(filter);
    unsubscribe.pkid = packet_id;
    encode(&Packet::Unsubscribe(unsubscribe))
}

pub fn encode_puback(packet_id: u16) -> Result<Bytes, CodecError> {
    encode(&Packet::PubAck(PubAck::new(packet_id)))
}

pub fn encode_pingreq() -> Result<Bytes, CodecError> {
    encode(&Packet::PingReq)
}

pub fn encode_disconnect() -> Result<Bytes, CodecError> {
    encode(&Packet::Disconnect)
}

pub fn encode_connack(code: ConnectReturnCode) -> Result<Bytes, CodecError> {
    encode(&Packet::ConnAck(ConnAck::new(code, false)))
}

pub fn encode_suback(
    packet_id: u16,
    return_codes: Vec<SubscribeReasonCode>,
) -> Result<Bytes, CodecError> {
    encode(&Packet::SubAck(SubAck::new(packet_id, return_codes)))
}

pub fn encode_unsuback(packet_id: u16) -> Result<Bytes, CodecError> {
    encode(&Packet::UnsubAck(UnsubAck::new(packet_id)))
}

pub fn encode_pingresp() -> Result<Bytes, CodecError> {
    encode(&Packet::PingResp)
}

/// Decode a buffer holding exactly one frame
pub fn decode_frame(frame: &[u8]) -> Result<Packet, CodecError> {
    let mut stream = BytesMut::from(frame);
    let packet = v4::read(&mut stream, MAX_REMAINING_LENGTH)?;
    if !stream.is_empty() {
        return Err(CodecError::TrailingBytes(stream.len()));
    }
    Ok(packet)
}
