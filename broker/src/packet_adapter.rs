// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Translates between the wire-level, per-version packet catalogs in
//! [`codec::v3`] / [`codec::v5`] and the neutral shapes the broker actor
//! operates on.
//!
//! The broker never touches a `codec::v3::*Packet` or `codec::v5::*Packet`
//! struct directly outside this module: every inbound byte buffer is turned
//! into an [`Inbound`] value here, and every outbound reply is built from one
//! of the `encode_*` functions below. This is what lets `broker.rs` dispatch
//! on application-level shape rather than on wire version.

use codec::{ByteArray, DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS};

use crate::error::{Error, ErrorKind};

/// Packet type nibble shared by every MQTT wire version (the high 4 bits of
/// the first fixed-header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    ConnectAck,
    Publish,
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
    Auth,
}

/// Peek the packet type out of the first byte of a frame without fully
/// decoding it. Used to route a raw frame to the right per-version decoder.
pub fn peek_packet_kind(bytes: &[u8]) -> Result<PacketKind, Error> {
    let first = *bytes
        .first()
        .ok_or_else(|| Error::new(ErrorKind::Decode, "empty frame".to_string()))?;
    match first >> 4 {
        1 => Ok(PacketKind::Connect),
        2 => Ok(PacketKind::ConnectAck),
        3 => Ok(PacketKind::Publish),
        4 => Ok(PacketKind::PublishAck),
        5 => Ok(PacketKind::PublishReceived),
        6 => Ok(PacketKind::PublishRelease),
        7 => Ok(PacketKind::PublishComplete),
        8 => Ok(PacketKind::Subscribe),
        9 => Ok(PacketKind::SubscribeAck),
        10 => Ok(PacketKind::Unsubscribe),
        11 => Ok(PacketKind::UnsubscribeAck),
        12 => Ok(PacketKind::PingRequest),
        13 => Ok(PacketKind::PingResponse),
        14 => Ok(PacketKind::Disconnect),
        15 => Ok(PacketKind::Auth),
        _ => Err(Error::new(ErrorKind::Decode, "invalid packet type".to_string())),
    }
}

/// Peek the protocol level out of a CONNECT frame's variable header,
/// before the broker knows whether to hand the rest of the bytes to
/// `codec::v3::ConnectPacket` or `codec::v5::ConnectPacket`.
///
/// Walks the same fixed-header-then-variable-header prefix every CONNECT
/// shares regardless of version: type/flags byte, remaining-length
/// `VarInt`, then the `Protocol Name` string, then the one-byte
/// `Protocol Level` that actually decides it.
///
/// # Errors
///
/// Returns an error if the frame is too short or carries an unknown
/// protocol level.
pub fn peek_protocol_level(bytes: &[u8]) -> Result<ProtocolLevel, Error> {
    let mut ba = ByteArray::new(bytes);
    let _fixed_header = ba.read_byte().map_err(Error::from)?;
    let _remaining_length = codec::VarInt::decode(&mut ba).map_err(Error::from)?;
    let _protocol_name = codec::StringData::decode(&mut ba).map_err(Error::from)?;
    let level_byte = ba.read_byte().map_err(Error::from)?;
    ProtocolLevel::try_from(level_byte).map_err(Error::from)
}

/// A decoded CONNECT packet, with MQTT5 properties flattened into plain
/// fields (v3/v3.1.1 connections simply leave them at their defaults).
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub protocol_level: ProtocolLevel,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillRequest>,
    pub session_expiry_interval: u32,
    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub maximum_packet_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WillRequest {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: u16,
    pub topic_alias: Option<u16>,
    pub payload: Vec<u8>,
}

/// Version-neutral mirror of the MQTT5 SUBSCRIBE retain-handling option;
/// v3/v3.1.1 subscriptions always behave as `SendAtSubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainHandlingMode {
    SendAtSubscribe,
    SendIfNew,
    DoNotSend,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequestTopic {
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandlingMode,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub packet_id: u16,
    pub identifier: Option<u32>,
    pub topics: Vec<SubscribeRequestTopic>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribeRequest {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Every inbound packet shape the broker reacts to, in a single version-free
/// enum.
#[derive(Debug, Clone)]
pub enum Inbound {
    Connect(ConnectRequest),
    Publish(PublishRequest),
    PublishAck(u16),
    PublishReceived(u16),
    PublishRelease(u16),
    PublishComplete(u16),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    PingRequest,
    Disconnect,
}

/// Decode a raw frame (as handed up by the listener) according to the
/// connection's negotiated protocol level.
///
/// # Errors
///
/// Returns an error if the frame is malformed for the given protocol level.
pub fn decode_inbound(protocol_level: ProtocolLevel, bytes: &[u8]) -> Result<Inbound, Error> {
    let kind = peek_packet_kind(bytes)?;
    let mut ba = ByteArray::new(bytes);

    let decode_err = |e: codec::DecodeError| Error::from(e);

    match protocol_level {
        ProtocolLevel::V5 => match kind {
            PacketKind::Connect => {
                let packet = codec::v5::ConnectPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Connect(connect_from_v5(&packet)))
            }
            PacketKind::Publish => {
                let packet = codec::v5::PublishPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Publish(publish_from_v5(&packet)))
            }
            PacketKind::PublishAck => {
                let packet = codec::v5::PublishAckPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishAck(packet.packet_id().value()))
            }
            PacketKind::PublishReceived => {
                let packet =
                    codec::v5::PublishReceivedPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishReceived(packet.packet_id().value()))
            }
            PacketKind::PublishRelease => {
                let packet =
                    codec::v5::PublishReleasePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishRelease(packet.packet_id().value()))
            }
            PacketKind::PublishComplete => {
                let packet =
                    codec::v5::PublishCompletePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishComplete(packet.packet_id().value()))
            }
            PacketKind::Subscribe => {
                let packet = codec::v5::SubscribePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Subscribe(subscribe_from_v5(&packet)))
            }
            PacketKind::Unsubscribe => {
                let packet = codec::v5::UnsubscribePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Unsubscribe(UnsubscribeRequest {
                    packet_id: packet.packet_id().value(),
                    filters: packet.topics().iter().map(|t| t.as_ref().to_string()).collect(),
                }))
            }
            PacketKind::PingRequest => {
                let _ = codec::v5::PingRequestPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PingRequest)
            }
            PacketKind::Disconnect => Ok(Inbound::Disconnect),
            _ => Err(Error::new(ErrorKind::Decode, "unexpected packet type from client".to_string())),
        },
        ProtocolLevel::V3 | ProtocolLevel::V4 => match kind {
            PacketKind::Connect => {
                let packet = codec::v3::ConnectPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Connect(connect_from_v3(&packet)))
            }
            PacketKind::Publish => {
                let packet = codec::v3::PublishPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Publish(PublishRequest {
                    dup: packet.dup(),
                    qos: packet.qos(),
                    retain: packet.retain(),
                    topic: packet.topic().to_string(),
                    packet_id: packet.packet_id().value(),
                    topic_alias: None,
                    payload: packet.message().to_vec(),
                }))
            }
            PacketKind::PublishAck => {
                let packet = codec::v3::PublishAckPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishAck(packet.packet_id().value()))
            }
            PacketKind::PublishReceived => {
                let packet =
                    codec::v3::PublishReceivedPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishReceived(packet.packet_id().value()))
            }
            PacketKind::PublishRelease => {
                let packet =
                    codec::v3::PublishReleasePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishRelease(packet.packet_id().value()))
            }
            PacketKind::PublishComplete => {
                let packet =
                    codec::v3::PublishCompletePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PublishComplete(packet.packet_id().value()))
            }
            PacketKind::Subscribe => {
                let packet = codec::v3::SubscribePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Subscribe(SubscribeRequest {
                    packet_id: packet.packet_id().value(),
                    identifier: None,
                    topics: packet
                        .topics()
                        .iter()
                        .map(|t| SubscribeRequestTopic {
                            filter: t.topic().to_string(),
                            qos: t.qos(),
                            no_local: false,
                            retain_as_published: false,
                            retain_handling: RetainHandlingMode::SendAtSubscribe,
                        })
                        .collect(),
                }))
            }
            PacketKind::Unsubscribe => {
                let packet = codec::v3::UnsubscribePacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::Unsubscribe(UnsubscribeRequest {
                    packet_id: packet.packet_id().value(),
                    filters: packet.topics().iter().map(|t| t.as_ref().to_string()).collect(),
                }))
            }
            PacketKind::PingRequest => {
                let _ = codec::v3::PingRequestPacket::decode(&mut ba).map_err(decode_err)?;
                Ok(Inbound::PingRequest)
            }
            PacketKind::Disconnect => Ok(Inbound::Disconnect),
            _ => Err(Error::new(ErrorKind::Decode, "unexpected packet type from client".to_string())),
        },
    }
}

fn connect_from_v5(packet: &codec::v5::ConnectPacket) -> ConnectRequest {
    let mut session_expiry_interval = 0u32;
    let mut receive_maximum = 65535u16;
    let mut topic_alias_maximum = 0u16;
    let mut maximum_packet_size = None;
    for prop in packet.properties().props() {
        match prop {
            codec::v5::Property::SessionExpiryInterval(v) => session_expiry_interval = v.value(),
            codec::v5::Property::ReceiveMaximum(v) => receive_maximum = v.value(),
            codec::v5::Property::TopicAliasMaximum(v) => topic_alias_maximum = v.value(),
            codec::v5::Property::MaximumPacketSize(v) => maximum_packet_size = Some(v.value()),
            _ => {}
        }
    }

    let will = if packet.will() {
        let mut delay_interval = 0u32;
        for prop in packet.will_properties().props() {
            if let codec::v5::Property::WillDelayInterval(v) = prop {
                delay_interval = v.value();
            }
        }
        Some(WillRequest {
            topic: packet.will_topic().unwrap_or_default().to_string(),
            message: packet.will_message().to_vec(),
            qos: packet.will_qos(),
            retain: packet.will_retain(),
            delay_interval,
        })
    } else {
        None
    };

    ConnectRequest {
        protocol_level: packet.protocol_level(),
        client_id: packet.client_id().to_string(),
        clean_session: packet.clean_session(),
        keep_alive: packet.keep_alive(),
        username: if packet.username().is_empty() {
            None
        } else {
            Some(packet.username().to_string())
        },
        password: if packet.password().is_empty() {
            None
        } else {
            Some(packet.password().to_vec())
        },
        will,
        session_expiry_interval,
        receive_maximum,
        topic_alias_maximum,
        maximum_packet_size,
    }
}

fn connect_from_v3(packet: &codec::v3::ConnectPacket) -> ConnectRequest {
    let will = if packet.connect_flags().will() {
        Some(WillRequest {
            topic: packet.will_topic().unwrap_or_default().to_string(),
            message: packet.will_message().to_vec(),
            qos: packet.connect_flags().will_qos(),
            retain: packet.connect_flags().will_retain(),
            delay_interval: 0,
        })
    } else {
        None
    };

    ConnectRequest {
        protocol_level: packet.protocol_level(),
        client_id: packet.client_id().to_string(),
        clean_session: packet.connect_flags().clean_session(),
        keep_alive: packet.keep_alive(),
        username: if packet.username().is_empty() {
            None
        } else {
            Some(packet.username().to_string())
        },
        password: if packet.password().is_empty() {
            None
        } else {
            Some(packet.password().to_vec())
        },
        will,
        session_expiry_interval: 0,
        receive_maximum: 65535,
        topic_alias_maximum: 0,
        maximum_packet_size: None,
    }
}

fn publish_from_v5(packet: &codec::v5::PublishPacket) -> PublishRequest {
    let mut topic_alias = None;
    for prop in packet.properties().props() {
        if let codec::v5::Property::TopicAlias(v) = prop {
            topic_alias = Some(v.value());
        }
    }
    PublishRequest {
        dup: packet.dup(),
        qos: packet.qos(),
        retain: packet.retain(),
        topic: packet.topic().to_string(),
        packet_id: packet.packet_id().value(),
        topic_alias,
        payload: packet.message().to_vec(),
    }
}

fn subscribe_from_v5(packet: &codec::v5::SubscribePacket) -> SubscribeRequest {
    let mut identifier = None;
    for prop in packet.properties().props() {
        if let codec::v5::Property::SubscriptionIdentifier(v) = prop {
            identifier = Some(v.value() as u32);
        }
    }
    SubscribeRequest {
        packet_id: packet.packet_id().value(),
        identifier,
        topics: packet
            .topics()
            .iter()
            .map(|t| SubscribeRequestTopic {
                filter: t.topic().to_string(),
                qos: t.qos(),
                no_local: t.no_local(),
                retain_as_published: t.retain_as_published(),
                retain_handling: match t.retain_handling() {
                    codec::v5::RetainHandling::Send => RetainHandlingMode::SendAtSubscribe,
                    codec::v5::RetainHandling::SendFirst => RetainHandlingMode::SendIfNew,
                    codec::v5::RetainHandling::NoSend => RetainHandlingMode::DoNotSend,
                },
            })
            .collect(),
    }
}

/// Version-neutral CONNACK disposition. Each variant maps to both a
/// `codec::v5::ReasonCode` and a `codec::v3::ConnectReturnCode`, so the
/// broker's connect-handling logic never has to branch on protocol level to
/// decide what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAckReason {
    Success,
    UnsupportedProtocolVersion,
    ClientIdentifierNotValid,
    BadUserNameOrPassword,
    NotAuthorized,
    ServerUnavailable,
    ServerBusy,
    Banned,
    QuotaExceeded,
    PacketTooLarge,
}

impl ConnAckReason {
    const fn to_v5(self) -> codec::v5::ReasonCode {
        match self {
            Self::Success => codec::v5::ReasonCode::Success,
            Self::UnsupportedProtocolVersion => codec::v5::ReasonCode::UnsupportedProtocolVersion,
            Self::ClientIdentifierNotValid => codec::v5::ReasonCode::ClientIdentifierNotValid,
            Self::BadUserNameOrPassword => codec::v5::ReasonCode::BadUserNameOrPassword,
            Self::NotAuthorized => codec::v5::ReasonCode::NotAuthorized,
            Self::ServerUnavailable => codec::v5::ReasonCode::ServerUnavailable,
            Self::ServerBusy => codec::v5::ReasonCode::ServerBusy,
            Self::Banned => codec::v5::ReasonCode::Banned,
            Self::QuotaExceeded => codec::v5::ReasonCode::QuotaExceeded,
            Self::PacketTooLarge => codec::v5::ReasonCode::PacketTooLarge,
        }
    }

    /// MQTT 3.1.1 has no dedicated codes for `Banned`, `ServerBusy`,
    /// `QuotaExceeded` or `PacketTooLarge`; those collapse onto the closest
    /// return code the older wire format actually has.
    const fn to_v3(self) -> codec::v3::ConnectReturnCode {
        match self {
            Self::Success => codec::v3::ConnectReturnCode::Accepted,
            Self::UnsupportedProtocolVersion => codec::v3::ConnectReturnCode::UnacceptedProtocol,
            Self::ClientIdentifierNotValid => codec::v3::ConnectReturnCode::IdentifierRejected,
            Self::BadUserNameOrPassword => codec::v3::ConnectReturnCode::MalformedUsernamePassword,
            Self::NotAuthorized => codec::v3::ConnectReturnCode::Unauthorized,
            Self::ServerUnavailable
            | Self::ServerBusy
            | Self::Banned
            | Self::QuotaExceeded
            | Self::PacketTooLarge => codec::v3::ConnectReturnCode::ServerUnavailable,
        }
    }
}

/// Build a CONNACK reply for the negotiated protocol level.
#[allow(clippy::too_many_arguments)]
pub fn encode_connack(
    protocol_level: ProtocolLevel,
    session_present: bool,
    reason: ConnAckReason,
    receive_maximum: u16,
    maximum_qos: QoS,
    retain_available: bool,
    topic_alias_maximum: u16,
    assigned_client_id: Option<&str>,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut packet = codec::v5::ConnectAckPacket::new(session_present, reason.to_v5());
            let props = packet.properties_mut();
            let _ = props.push(codec::v5::Property::ReceiveMaximum(receive_maximum.into()));
            let _ = props.push(codec::v5::Property::MaximumQoS(maximum_qos));
            let _ = props.push(codec::v5::Property::RetainAvailable(retain_available.into()));
            let _ = props.push(codec::v5::Property::TopicAliasMaximum(topic_alias_maximum.into()));
            if let Some(client_id) = assigned_client_id {
                if let Ok(v) = codec::StringData::from(client_id) {
                    let _ = props.push(codec::v5::Property::AssignedClientIdentifier(v));
                }
            }
            packet.encode(&mut buf).map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let packet = codec::v3::ConnectAckPacket::new(session_present, reason.to_v3());
            packet.encode(&mut buf).map_err(Error::from)?;
        }
    }
    Ok(buf)
}

/// Build an outbound PUBLISH frame for the given protocol level.
pub fn encode_publish(
    protocol_level: ProtocolLevel,
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: u16,
    subscription_identifiers: &[u32],
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut packet =
                codec::v5::PublishPacket::new(topic, qos, payload).map_err(Error::from)?;
            packet.set_retain(retain);
            packet.set_dup(dup).map_err(Error::from)?;
            if qos != QoS::AtMostOnce {
                packet.set_packet_id(PacketId::new(packet_id));
            }
            for id in subscription_identifiers {
                if let Ok(v) = codec::VarInt::from(*id as usize) {
                    let _ = packet
                        .properties_mut()
                        .push(codec::v5::Property::SubscriptionIdentifier(v));
                }
            }
            packet.encode(&mut buf).map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let mut packet =
                codec::v3::PublishPacket::new(topic, qos, payload).map_err(Error::from)?;
            packet.set_retain(retain);
            packet.set_dup(dup).map_err(Error::from)?;
            if qos != QoS::AtMostOnce {
                packet.set_packet_id(PacketId::new(packet_id));
            }
            packet.encode(&mut buf).map_err(Error::from)?;
        }
    }
    Ok(buf)
}

/// Build an outbound PUBACK. `reason_code` is only meaningful for V5 peers
/// (V3/V3.1.1 PUBACK has no reason-code field); pass
/// [`codec::v5::ReasonCode::Success`] for the ordinary case and
/// [`codec::v5::ReasonCode::NoMatchingSubscribers`] when routing produced no
/// deliveries.
/// Build an outbound PUBLISH carrying a `TopicAlias` property (MQTT 5
/// only). Pass `topic = Some(name)` for the establishing form (full topic
/// name alongside the alias) and `topic = None` for the use form (empty
/// topic name, relying on a previously established alias) [MQTT-3.3.2-12].
/// V3/V3.1.1 has no topic-alias concept; `alias` is ignored and the full
/// topic name is always sent, falling back to [`encode_publish`].
///
/// # Errors
///
/// Returns an error if `topic` is required but missing, or if the
/// underlying packet fails to encode.
pub fn encode_publish_with_alias(
    protocol_level: ProtocolLevel,
    topic: Option<&str>,
    alias: u16,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: u16,
    subscription_identifiers: &[u32],
) -> Result<Vec<u8>, Error> {
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut buf = Vec::new();
            let mut packet = codec::v5::PublishPacket::new(topic.unwrap_or("_"), qos, payload)
                .map_err(Error::from)?;
            if topic.is_none() {
                packet.set_topic_to_alias_only();
            }
            packet.set_retain(retain);
            packet.set_dup(dup).map_err(Error::from)?;
            if qos != QoS::AtMostOnce {
                packet.set_packet_id(PacketId::new(packet_id));
            }
            let _ = packet
                .properties_mut()
                .push(codec::v5::Property::TopicAlias(alias.into()));
            for id in subscription_identifiers {
                if let Ok(v) = codec::VarInt::from(*id as usize) {
                    let _ = packet
                        .properties_mut()
                        .push(codec::v5::Property::SubscriptionIdentifier(v));
                }
            }
            packet.encode(&mut buf).map_err(Error::from)?;
            Ok(buf)
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => encode_publish(
            protocol_level,
            topic.unwrap_or_default(),
            payload,
            qos,
            retain,
            dup,
            packet_id,
            subscription_identifiers,
        ),
    }
}

pub fn encode_puback(
    protocol_level: ProtocolLevel,
    packet_id: u16,
    reason_code: codec::v5::ReasonCode,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut packet = codec::v5::PublishAckPacket::new(PacketId::new(packet_id));
            packet.set_reason_code(reason_code);
            packet.encode(&mut buf).map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::PublishAckPacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

/// Build an outbound PUBREC. `reason_code` is only meaningful for V5 peers;
/// V3/V3.1.1 has no reason-code field on PUBREC, so a duplicate packet id
/// must instead be handled by closing the connection at the call site.
pub fn encode_pubrec(
    protocol_level: ProtocolLevel,
    packet_id: u16,
    reason_code: codec::v5::ReasonCode,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut packet = codec::v5::PublishReceivedPacket::new(PacketId::new(packet_id));
            packet.set_reason_code(reason_code);
            packet.encode(&mut buf).map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::PublishReceivedPacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

pub fn encode_pubrel(protocol_level: ProtocolLevel, packet_id: u16) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            codec::v5::PublishReleasePacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::PublishReleasePacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

pub fn encode_pubcomp(protocol_level: ProtocolLevel, packet_id: u16) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            codec::v5::PublishCompletePacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::PublishCompletePacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

pub fn encode_suback(
    protocol_level: ProtocolLevel,
    packet_id: u16,
    granted: &[Option<QoS>],
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let reasons = granted
                .iter()
                .map(|g| match g {
                    Some(QoS::AtMostOnce) => codec::v5::ReasonCode::Success,
                    Some(QoS::AtLeastOnce) => codec::v5::ReasonCode::GrantedQoS1,
                    Some(QoS::ExactOnce) => codec::v5::ReasonCode::GrantedQoS2,
                    None => codec::v5::ReasonCode::UnspecifiedError,
                })
                .collect();
            codec::v5::SubscribeAckPacket::with_vec(PacketId::new(packet_id), reasons)
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let acks = granted
                .iter()
                .map(|g| match g {
                    Some(qos) => codec::v3::SubscribeAck::QoS(*qos),
                    None => codec::v3::SubscribeAck::Failed,
                })
                .collect();
            codec::v3::SubscribeAckPacket::with_vec(PacketId::new(packet_id), acks)
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

pub fn encode_unsuback(protocol_level: ProtocolLevel, packet_id: u16) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let count = 1;
            let reasons = vec![codec::v5::ReasonCode::Success; count];
            codec::v5::UnsubscribeAckPacket::with_vec(PacketId::new(packet_id), reasons)
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::UnsubscribeAckPacket::new(PacketId::new(packet_id))
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

pub fn encode_pingresp(protocol_level: ProtocolLevel) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            codec::v5::PingResponsePacket::new()
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            codec::v3::PingResponsePacket::new()
                .encode(&mut buf)
                .map_err(Error::from)?;
        }
    }
    Ok(buf)
}

/// Reasons the broker closes a connection with a DISCONNECT packet.
///
/// MQTT 3.1.1 has no server-to-client DISCONNECT packet at all; for those
/// connections [`encode_disconnect`] returns an empty buffer and the caller
/// just closes the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    SessionTakenOver,
    Banned,
    MessageRateTooHigh,
    TopicAliasInvalid,
    ReceiveMaximumExceeded,
    ProtocolError,
    UnspecifiedError,
}

impl DisconnectReason {
    const fn to_v5(self) -> codec::v5::ReasonCode {
        match self {
            Self::Normal => codec::v5::ReasonCode::Success,
            Self::SessionTakenOver => codec::v5::ReasonCode::SessionTakenOver,
            Self::Banned => codec::v5::ReasonCode::Banned,
            Self::MessageRateTooHigh => codec::v5::ReasonCode::MessageRateTooHigh,
            Self::TopicAliasInvalid => codec::v5::ReasonCode::TopicAliasInvalid,
            Self::ReceiveMaximumExceeded => codec::v5::ReasonCode::ReceiveMaximumExceeded,
            Self::ProtocolError => codec::v5::ReasonCode::ProtocolError,
            Self::UnspecifiedError => codec::v5::ReasonCode::UnspecifiedError,
        }
    }
}

pub fn encode_disconnect(
    protocol_level: ProtocolLevel,
    reason: DisconnectReason,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    if protocol_level == ProtocolLevel::V5 {
        let mut packet = codec::v5::DisconnectPacket::new();
        packet.set_reason_code(reason.to_v5());
        packet.encode(&mut buf).map_err(Error::from)?;
    }
    Ok(buf)
}
