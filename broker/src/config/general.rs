// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// General section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct General {
    /// Time interval to send $SYS messages in seconds.
    ///
    /// Set to 0 to disable $SYS messages.
    ///
    /// Default is 3s.
    #[serde(default = "General::default_sys_interval")]
    sys_interval: u32,

    /// Disable Nagle's algorithm on client sockets.
    ///
    /// Default is false.
    #[serde(default = "General::default_no_delay")]
    no_delay: bool,

    /// Maximum accepted publish message payload size, in bytes.
    ///
    /// Default value is 0, which means that all valid MQTT messages are
    /// accepted (MQTT's own ceiling is 268435455 bytes).
    #[serde(default = "General::default_message_size_limit")]
    message_size_limit: u32,

    /// Clients connecting with a keep-alive greater than this value are
    /// told, via CONNACK server-keep-alive (MQTT 5 only), to use it
    /// instead. Maximum allowable value is 65535.
    ///
    /// Default value is 65535.
    #[serde(default = "General::default_maximum_keep_alive")]
    maximum_keep_alive: u32,

    /// Maximum QoS supported. Clients publishing above this are disconnected.
    ///
    /// Default is 2.
    #[serde(default = "General::default_maximum_qos")]
    maximum_qos: QoS,

    /// Maximum accepted full MQTT packet size, in bytes. 0 means no limit.
    ///
    /// Default is 0.
    #[serde(default = "General::default_maximum_packet_size")]
    maximum_packet_size: u32,

    /// Maximum inbound messages per second, per session, for QoS 0/1/2
    /// respectively. Exceeding this bans the session.
    ///
    /// Defaults are 5000/2500/1250.
    #[serde(default = "General::default_max_flow_rate")]
    max_flow_rate: [u32; 3],

    /// How long a flow-rate ban keeps a session from reconnecting.
    ///
    /// Default is 5 seconds.
    #[serde(default = "General::default_ban_duration_secs")]
    ban_duration_secs: u32,

    /// Whether repeated bans accumulate (each fresh violation extends the
    /// remaining ban instead of resetting it).
    ///
    /// Default is false.
    #[serde(default = "General::default_ban_accumulative")]
    ban_accumulative: bool,

    /// Whether QoS 0 messages are queued for offline sessions with a
    /// non-zero session expiry interval.
    ///
    /// Default is false.
    #[serde(default = "General::default_qos0_offline_queue")]
    qos0_offline_queue: bool,
}

impl General {
    #[must_use]
    pub const fn default_sys_interval() -> u32 {
        3
    }

    #[must_use]
    pub const fn default_no_delay() -> bool {
        false
    }

    #[must_use]
    pub const fn default_message_size_limit() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_maximum_qos() -> QoS {
        QoS::ExactOnce
    }

    #[must_use]
    pub const fn default_maximum_keep_alive() -> u32 {
        65535
    }

    #[must_use]
    pub const fn default_maximum_packet_size() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_max_flow_rate() -> [u32; 3] {
        [5000, 2500, 1250]
    }

    #[must_use]
    pub const fn default_ban_duration_secs() -> u32 {
        5
    }

    #[must_use]
    pub const fn default_ban_accumulative() -> bool {
        false
    }

    #[must_use]
    pub const fn default_qos0_offline_queue() -> bool {
        false
    }

    #[must_use]
    pub const fn sys_interval(&self) -> Duration {
        Duration::from_secs(self.sys_interval as u64)
    }

    #[must_use]
    pub const fn no_delay(&self) -> bool {
        self.no_delay
    }

    #[must_use]
    pub const fn message_size_limit(&self) -> u32 {
        self.message_size_limit
    }

    #[must_use]
    pub const fn maximum_keep_alive(&self) -> u32 {
        self.maximum_keep_alive
    }

    #[must_use]
    pub const fn maximum_qos(&self) -> QoS {
        self.maximum_qos
    }

    #[must_use]
    pub const fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Max messages per second for a given QoS, 0-indexed by QoS value.
    #[must_use]
    pub const fn max_flow_rate(&self, qos: QoS) -> u32 {
        self.max_flow_rate[qos as usize]
    }

    #[must_use]
    pub const fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs as u64)
    }

    #[must_use]
    pub const fn ban_accumulative(&self) -> bool {
        self.ban_accumulative
    }

    #[must_use]
    pub const fn qos0_offline_queue(&self) -> bool {
        self.qos0_offline_queue
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns an error if `maximum_packet_size` is set but too small to
    /// carry ordinary client traffic.
    pub fn validate(&self) -> Result<(), Error> {
        if self.maximum_packet_size != 0 && self.maximum_packet_size < 20 {
            return Err(Error::new(
                crate::error::ErrorKind::Config,
                "maximum_packet_size below 20 bytes interferes with ordinary client operation",
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            sys_interval: Self::default_sys_interval(),
            no_delay: Self::default_no_delay(),
            message_size_limit: Self::default_message_size_limit(),
            maximum_qos: Self::default_maximum_qos(),
            maximum_keep_alive: Self::default_maximum_keep_alive(),
            maximum_packet_size: Self::default_maximum_packet_size(),
            max_flow_rate: Self::default_max_flow_rate(),
            ban_duration_secs: Self::default_ban_duration_secs(),
            ban_accumulative: Self::default_ban_accumulative(),
            qos0_offline_queue: Self::default_qos0_offline_queue(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flow_rates() {
        let general = General::default();
        assert_eq!(general.max_flow_rate(QoS::AtMostOnce), 5000);
        assert_eq!(general.max_flow_rate(QoS::AtLeastOnce), 2500);
        assert_eq!(general.max_flow_rate(QoS::ExactOnce), 1250);
    }

    #[test]
    fn test_validate_rejects_tiny_packet_size() {
        let mut general = General::default();
        general.maximum_packet_size = 10;
        assert!(general.validate().is_err());
    }
}
