// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bit-level and packet-level codec for MQTT 3.1, 3.1.1 and 5.0.
//!
//! Wire primitives ([`VarInt`], [`StringData`], ...) and the shared
//! [`FixedHeader`]/[`PacketType`] live at the crate root. Each protocol
//! version gets its own packet catalog in [`v3`] and [`v5`]: a version's
//! `ConnectPacket`, `PublishPacket`, ... are distinct types, not one type
//! parameterized over version, so a caller that already knows the
//! connection's negotiated [`ProtocolLevel`] can match on concrete types
//! rather than threading a version tag through every decode.

mod base;
mod binary_data;
mod bool_data;
mod byte_array;
mod connect_flags;
mod error;
mod header;
mod keep_alive;
mod packet_id;
mod protocol_level;
mod qos;
mod string_data;
mod string_pair_data;
mod u16_data;
mod u32_data;
pub mod utils;
pub mod v3;
pub mod v5;
pub mod var_int;

pub mod topic;

pub use base::{DecodePacket, EncodePacket, PROTOCOL_NAME, PROTOCOL_NAME_V31};
pub use binary_data::BinaryData;
pub use bool_data::BoolData;
pub use byte_array::ByteArray;
pub use connect_flags::ConnectFlags;
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, Packet, PacketType};
pub use keep_alive::{validate_keep_alive, KeepAlive};
pub use packet_id::PacketId;
pub use protocol_level::ProtocolLevel;
pub use qos::QoS;
pub use string_data::StringData;
pub use string_pair_data::StringPairData;
pub use topic::{PubTopic, SubTopic};
pub use u16_data::U16Data;
pub use u32_data::U32Data;
pub use var_int::{VarInt, VarIntError, MAX_PACKET_LEN};
