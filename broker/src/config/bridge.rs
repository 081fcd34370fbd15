// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::time::Duration;

use codec::{ProtocolLevel, QoS};

use crate::error::{Error, ErrorKind};

/// One remote broker this instance bridges to.
///
/// A bridge connection opens a local and a remote [`crate::stream::Stream`]
/// and mutually forwards PUBLISHes between them, re-encoding across
/// versions when `local_protocol_level` and `remote_protocol_level` differ.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConnection {
    /// Name of this bridge connection, used in log output and statistics.
    name: String,

    /// Address (host:port) of the local broker this bridge speaks to, e.g.
    /// `127.0.0.1:1883`.
    #[serde(default = "BridgeConnection::default_local_address")]
    local_address: String,

    /// Protocol version to use on the local side.
    #[serde(default = "BridgeConnection::default_protocol_level")]
    local_protocol_level: ProtocolLevel,

    /// Address (host:port) of the remote broker.
    remote_address: String,

    /// Protocol version to use on the remote side.
    #[serde(default = "BridgeConnection::default_protocol_level")]
    remote_protocol_level: ProtocolLevel,

    /// Client id presented on both ends of the bridge.
    client_id: String,

    /// Username presented when connecting to the remote broker, if any.
    #[serde(default = "BridgeConnection::default_username")]
    username: Option<String>,

    /// Password presented when connecting to the remote broker, if any.
    #[serde(default = "BridgeConnection::default_password")]
    password: Option<String>,

    /// Topic filters forwarded from the remote broker into this one.
    #[serde(default = "BridgeConnection::default_topics")]
    topics_in: Vec<String>,

    /// Topic filters forwarded from this broker out to the remote one.
    #[serde(default = "BridgeConnection::default_topics")]
    topics_out: Vec<String>,

    /// QoS used for forwarded messages.
    #[serde(default = "BridgeConnection::default_qos")]
    qos: QoS,

    /// Whether each side of the bridge connects with `cleanSession`/`cleanStart`.
    #[serde(default = "BridgeConnection::default_clean_start")]
    clean_start: bool,

    /// Seconds to wait before retrying a dropped bridge connection.
    #[serde(default = "BridgeConnection::default_reconnect_period_secs")]
    reconnect_period_secs: u32,
}

impl BridgeConnection {
    #[must_use]
    pub fn default_local_address() -> String {
        "127.0.0.1:1883".to_string()
    }

    #[must_use]
    pub const fn default_protocol_level() -> ProtocolLevel {
        ProtocolLevel::V4
    }

    #[must_use]
    pub const fn default_username() -> Option<String> {
        None
    }

    #[must_use]
    pub const fn default_password() -> Option<String> {
        None
    }

    #[must_use]
    pub fn default_topics() -> Vec<String> {
        Vec::new()
    }

    #[must_use]
    pub const fn default_qos() -> QoS {
        QoS::AtLeastOnce
    }

    #[must_use]
    pub const fn default_clean_start() -> bool {
        true
    }

    #[must_use]
    pub const fn default_reconnect_period_secs() -> u32 {
        5
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    #[must_use]
    pub const fn local_protocol_level(&self) -> ProtocolLevel {
        self.local_protocol_level
    }

    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    #[must_use]
    pub const fn remote_protocol_level(&self) -> ProtocolLevel {
        self.remote_protocol_level
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref().map(str::as_bytes)
    }

    #[must_use]
    pub fn topics_in(&self) -> &[String] {
        &self.topics_in
    }

    #[must_use]
    pub fn topics_out(&self) -> &[String] {
        &self.topics_out
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    #[must_use]
    pub const fn reconnect_period(&self) -> Duration {
        Duration::from_secs(self.reconnect_period_secs as u64)
    }

    /// # Errors
    ///
    /// Returns an error if `name`/`client_id` are empty or either address is
    /// not a resolvable socket address.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::new(ErrorKind::Config, "bridge connection name must not be empty"));
        }
        if self.client_id.is_empty() {
            return Err(Error::new(ErrorKind::Config, "bridge connection client_id must not be empty"));
        }
        self.local_address.to_socket_addrs().map_err(|err| {
            Error::new(
                ErrorKind::Config,
                format!("bridge {}: invalid local_address {}: {err}", self.name, self.local_address),
            )
        })?;
        self.remote_address.to_socket_addrs().map_err(|err| {
            Error::new(
                ErrorKind::Config,
                format!("bridge {}: invalid remote_address {}: {err}", self.name, self.remote_address),
            )
        })?;
        Ok(())
    }
}

/// `bridge` section in config: the list of remote brokers to mirror traffic
/// with. Empty by default — bridging is opt-in.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Bridge {
    #[serde(default = "Bridge::default_connections")]
    connections: Vec<BridgeConnection>,
}

impl Bridge {
    #[must_use]
    pub fn default_connections() -> Vec<BridgeConnection> {
        Vec::new()
    }

    #[must_use]
    pub fn connections(&self) -> &[BridgeConnection] {
        &self.connections
    }

    /// # Errors
    ///
    /// Returns an error if any connection entry is invalid, or two entries
    /// share a name.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            conn.validate()?;
            if !seen.insert(conn.name()) {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("duplicate bridge connection name: {}", conn.name()),
                ));
            }
        }
        Ok(())
    }
}
