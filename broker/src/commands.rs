// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Inter-actor message types.
//!
//! Three actor kinds make up the core: the broker actor, one listener
//! actor per bound address, and the bridge's client-socket controller
//! actor. They talk exclusively over the `tokio::sync::mpsc` channels
//! carrying the enums below, never through shared mutable state (the one
//! narrow exception is the byte counters in
//! [`crate::cache_types::Statistics`]).

use codec::ProtocolLevel;

use crate::types::{ConnId, ListenerId};

/// Sent by a listener actor up to the broker actor.
#[derive(Debug)]
pub enum ListenerToBrokerCmd {
    /// A new socket was accepted; the broker creates a Fresh session for it.
    IncomingConnection {
        listener_id: ListenerId,
        conn_id: ConnId,
        remote_ip: String,
        tls: bool,
    },

    /// Raw bytes read off the wire for an existing connection, handed up
    /// unparsed so all protocol decoding stays inside the broker actor.
    Data {
        listener_id: ListenerId,
        conn_id: ConnId,
        bytes: Vec<u8>,
    },

    /// The socket's read half hit EOF or errored.
    CloseConnection {
        listener_id: ListenerId,
        conn_id: ConnId,
    },

    /// A plain TCP connection was transparently upgraded to WebSocket after
    /// its opening bytes were recognised as an HTTP upgrade request.
    WillUpgraded {
        listener_id: ListenerId,
        conn_id: ConnId,
    },
}

/// Sent by the broker actor down to a listener actor.
#[derive(Debug)]
pub enum BrokerToListenerCmd {
    /// Write already-encoded packet bytes to one connection's socket.
    Write { conn_id: ConnId, bytes: Vec<u8> },

    /// Close one connection's socket (session taken over, banned, protocol
    /// error, ...).
    Close { conn_id: ConnId },
}

/// Sent by the bridge's client-socket controller actor up to the broker
/// when a bridged remote delivers a packet that must be routed into local
/// subscriptions (or vice versa).
#[derive(Debug)]
pub enum BridgeToBrokerCmd {
    /// A decoded application PUBLISH arrived on the bridge connection named
    /// `name` and should be routed as if published locally.
    Publish {
        name: String,
        topic: String,
        qos: codec::QoS,
        retain: bool,
        payload: Vec<u8>,
    },

    /// The named bridge connection finished (or failed) its handshake.
    HandshakeComplete {
        name: String,
        local_version: ProtocolLevel,
        remote_version: ProtocolLevel,
    },

    Disconnected { name: String },
}

/// Sent by the broker actor down to the bridge controller.
#[derive(Debug)]
pub enum BrokerToBridgeCmd {
    /// Forward a locally-routed PUBLISH out over the named bridge
    /// connection's remote side.
    Publish {
        name: String,
        topic: String,
        qos: codec::QoS,
        retain: bool,
        payload: Vec<u8>,
    },
}

crate::convert_send_error!(ListenerToBrokerCmd);
crate::convert_send_error!(BrokerToListenerCmd);
crate::convert_send_error!(BridgeToBrokerCmd);
crate::convert_send_error!(BrokerToBridgeCmd);
