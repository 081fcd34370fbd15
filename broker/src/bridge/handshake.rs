// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Client-role CONNECT/SUBSCRIBE encoding and CONNACK/SUBACK decoding.
//!
//! [`crate::packet_adapter`] only covers the shapes a broker needs when it
//! is the one being connected to; a bridge connection is a client of the
//! remote broker, so it needs the mirror image of a handful of those
//! packets. Kept separate rather than folded into `packet_adapter` since
//! nothing else in the broker ever originates a CONNECT or reads a CONNACK.

use codec::{ByteArray, ConnectFlags, DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS};

use crate::error::{Error, ErrorKind};

/// Build a CONNECT frame for the given protocol level.
///
/// # Errors
///
/// Returns an error if `client_id`/`username`/`password` cannot be encoded
/// (too long, or not valid for the wire format).
pub fn encode_connect(
    protocol_level: ProtocolLevel,
    client_id: &str,
    clean_start: bool,
    keep_alive: u16,
    username: Option<&str>,
    password: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    match protocol_level {
        ProtocolLevel::V5 => {
            let mut packet = codec::v5::ConnectPacket::new(client_id).map_err(Error::from)?;
            packet.set_keep_alive(keep_alive);
            packet.set_clean_session(clean_start);
            if let Some(username) = username {
                packet.set_username(Some(username)).map_err(Error::from)?;
            }
            if let Some(password) = password {
                packet.set_password(Some(password)).map_err(Error::from)?;
            }
            packet.encode(&mut buf).map_err(Error::from)?;
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let mut packet = codec::v3::ConnectPacket::new(client_id).map_err(Error::from)?;
            packet.set_protcol_level(protocol_level);
            packet.set_keep_alive(keep_alive);
            let mut flags = ConnectFlags::default();
            flags.set_clean_session(clean_start);
            if let Some(username) = username {
                flags.set_has_username(true);
                packet.set_username(username).map_err(Error::from)?;
            }
            if let Some(password) = password {
                flags.set_has_password(true);
                packet.set_password(password).map_err(Error::from)?;
            }
            packet.set_connect_flags(flags);
            packet.encode(&mut buf).map_err(Error::from)?;
        }
    }
    Ok(buf)
}

/// Result of a successful CONNACK from the remote broker.
#[derive(Debug, Clone, Copy)]
pub struct RemoteConnAck {
    pub session_present: bool,
}

/// Decode a CONNACK frame and fail unless it reports acceptance.
///
/// # Errors
///
/// Returns a [`ErrorKind::Bridge`] error if the frame is malformed or the
/// remote broker rejected the connection.
pub fn decode_connack(protocol_level: ProtocolLevel, bytes: &[u8]) -> Result<RemoteConnAck, Error> {
    let mut ba = ByteArray::new(bytes);
    match protocol_level {
        ProtocolLevel::V5 => {
            let packet = codec::v5::ConnectAckPacket::decode(&mut ba).map_err(Error::from)?;
            if packet.reason_code() != codec::v5::ReasonCode::Success {
                return Err(Error::new(
                    ErrorKind::Bridge,
                    format!("remote broker refused connect: {:?}", packet.reason_code()),
                ));
            }
            Ok(RemoteConnAck {
                session_present: packet.session_present(),
            })
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let packet = codec::v3::ConnectAckPacket::decode(&mut ba).map_err(Error::from)?;
            if packet.return_code() != codec::v3::ConnectReturnCode::Accepted {
                return Err(Error::new(
                    ErrorKind::Bridge,
                    format!("remote broker refused connect: {:?}", packet.return_code()),
                ));
            }
            Ok(RemoteConnAck {
                session_present: packet.session_present(),
            })
        }
    }
}

/// Build one SUBSCRIBE frame per filter in `topics_in`, all at `qos`.
///
/// `codec::v3` does not expose its `SubscribeTopic` type, so a single
/// packet carrying every filter cannot be built from outside the crate;
/// one filter per frame sidesteps that and is valid for both wire
/// versions regardless. `first_packet_id` is consumed and incremented by
/// one (wrapping) per frame.
///
/// # Errors
///
/// Returns an error if a filter is not a valid topic pattern.
pub fn encode_subscribe(
    protocol_level: ProtocolLevel,
    first_packet_id: u16,
    filters: &[String],
    qos: QoS,
) -> Result<Vec<(u16, Vec<u8>)>, Error> {
    if filters.is_empty() {
        return Err(Error::new(ErrorKind::Bridge, "no topics_in filters to subscribe"));
    }
    let mut frames = Vec::with_capacity(filters.len());
    let mut packet_id = first_packet_id;
    for filter in filters {
        let mut buf = Vec::new();
        match protocol_level {
            ProtocolLevel::V5 => {
                codec::v5::SubscribePacket::new(filter, qos, PacketId::new(packet_id))
                    .map_err(Error::from)?
                    .encode(&mut buf)
                    .map_err(Error::from)?;
            }
            ProtocolLevel::V3 | ProtocolLevel::V4 => {
                codec::v3::SubscribePacket::new(filter, qos, PacketId::new(packet_id))
                    .map_err(Error::from)?
                    .encode(&mut buf)
                    .map_err(Error::from)?;
            }
        }
        frames.push((packet_id, buf));
        packet_id = packet_id.wrapping_add(1).max(1);
    }
    Ok(frames)
}

/// Decode a SUBACK frame, logging (but not failing on) per-filter rejections.
///
/// # Errors
///
/// Returns an error if the frame itself is malformed.
pub fn decode_suback(protocol_level: ProtocolLevel, bytes: &[u8], name: &str) -> Result<(), Error> {
    let mut ba = ByteArray::new(bytes);
    match protocol_level {
        ProtocolLevel::V5 => {
            let packet = codec::v5::SubscribeAckPacket::decode(&mut ba).map_err(Error::from)?;
            for reason in packet.reasons() {
                if !matches!(
                    reason,
                    codec::v5::ReasonCode::Success
                        | codec::v5::ReasonCode::GrantedQoS1
                        | codec::v5::ReasonCode::GrantedQoS2
                ) {
                    log::warn!("bridge {name}: remote rejected a topics_in filter: {reason:?}");
                }
            }
        }
        ProtocolLevel::V3 | ProtocolLevel::V4 => {
            let packet = codec::v3::SubscribeAckPacket::decode(&mut ba).map_err(Error::from)?;
            for ack in packet.acknowledgements() {
                if matches!(ack, codec::v3::SubscribeAck::Failed) {
                    log::warn!("bridge {name}: remote rejected a topics_in filter");
                }
            }
        }
    }
    Ok(())
}

/// Build a PINGREQ frame.
#[must_use]
pub fn encode_pingreq(protocol_level: ProtocolLevel) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = match protocol_level {
        ProtocolLevel::V5 => codec::v5::PingRequestPacket::new().encode(&mut buf),
        ProtocolLevel::V3 | ProtocolLevel::V4 => codec::v3::PingRequestPacket::new().encode(&mut buf),
    };
    buf
}
