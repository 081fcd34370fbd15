// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-connection protocol state.
//!
//! A `Session` is a plain struct owned by the broker actor, not a task of
//! its own: it never touches a socket. The broker decodes raw bytes into
//! control packets and drives a session's state machine by calling the
//! methods here; the broker then serializes whatever this module hands
//! back and forwards it to the owning listener for writing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use codec::{ProtocolLevel, QoS};

use crate::id_controller::IdController;
use crate::types::{ConnId, ListenerId};

/// `Constants::TopicAliasMaximum` from the wire format: the largest alias
/// value a PUBLISH's `TopicAlias` property may carry.
pub const TOPIC_ALIAS_MAXIMUM: u16 = 65534;

/// `ForeverSessionInterval`: a session carrying this expiry interval never
/// times out on its own.
pub const FOREVER_SESSION_INTERVAL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Connection accepted, no CONNECT decoded yet.
    Fresh,
    /// Connected and serving control packets.
    Connected,
    /// Clean network close or explicit DISCONNECT; the session record may
    /// still be held (non-clean) awaiting either resumption or expiry.
    Disconnected,
    /// `session_expiry_interval` elapsed while disconnected; the broker
    /// will drop this record.
    Expired,
    /// Flow-rate limit was exceeded; control packets are discarded until
    /// `ban_timeout` reaches zero.
    Banned,
}

#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
}

/// One PUBLISH queued for a session, before (or while) it has an
/// allocated packet id.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub subscription_identifiers: Vec<u32>,
    /// Set once reclaimed/allocated by `next_ready_publish`.
    pub packet_id: Option<u16>,
}

impl PendingPublish {
    #[must_use]
    pub fn new(topic: String, payload: Vec<u8>, qos: QoS, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            subscription_identifiers: Vec::new(),
            packet_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

/// Outcome of handing the next queued publish its packet id, ready for
/// the broker to serialize and write.
#[derive(Debug)]
pub struct ReadyPublish {
    pub packet_id: Option<u16>,
    pub unit: PendingPublish,
}

/// Action the broker should take to keep a PUBLISH's encoded size under
/// the client's `maxPacketSize`, per the outbound topic-alias scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAliasAction {
    /// Topic is unchanged; no alias applies.
    None,
    /// Alias `u16` is new: send one PUBLISH establishing `topic -> alias`
    /// (QoS 0, empty payload, `TopicAlias` property) before the real one.
    Establish(u16),
    /// Alias `u16` is already mapped; omit the topic name and set the
    /// `TopicAlias` property instead.
    UseAlias(u16),
    /// The client's `TopicAliasMaximum` is already exhausted; the caller
    /// must fall back to sending (or dropping) the packet at full size.
    Uncompressible,
}

#[derive(Debug)]
pub struct Session {
    pub conn_id: ConnId,
    pub listener_id: ListenerId,
    pub remote_ip: String,
    pub tls: bool,

    status: Status,
    protocol_level: ProtocolLevel,
    client_id: String,
    username: Option<String>,
    clean_session: bool,

    /// Already multiplied by 2: the server closes the connection if
    /// nothing arrives within that window (`elapsed >= keepalive * 2`).
    keep_alive: Duration,
    connect_deadline: Instant,
    last_activity: Instant,

    session_expiry_interval: u32,
    disconnected_at: Option<Instant>,

    receive_maximum: u16,
    current_quota: u16,
    max_packet_size: u32,
    /// The broker's own advertised Receive Maximum (`general.listener`'s
    /// `maximum_inflight_messages`), governing how many unacked inbound
    /// QoS 2 publishes this client may have outstanding at once.
    inbound_receive_maximum: u16,

    topic_alias_maximum: u16,
    outbound_aliases: HashMap<String, u16>,
    inbound_aliases: HashMap<u16, String>,

    will: Option<Will>,

    qos2_inbound: HashSet<u16>,
    id_controller: IdController,
    pending: VecDeque<PendingPublish>,
    inflight: HashMap<u16, (PendingPublish, AckState)>,

    ban_timeout: u32,
}

impl Session {
    #[must_use]
    pub fn new(
        conn_id: ConnId,
        listener_id: ListenerId,
        remote_ip: String,
        tls: bool,
        connect_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            listener_id,
            remote_ip,
            tls,
            status: Status::Fresh,
            protocol_level: ProtocolLevel::V4,
            client_id: String::new(),
            username: None,
            clean_session: true,
            keep_alive: Duration::from_secs(0),
            connect_deadline: now + connect_timeout,
            last_activity: now,
            session_expiry_interval: 0,
            disconnected_at: None,
            receive_maximum: u16::MAX,
            current_quota: u16::MAX,
            max_packet_size: u32::MAX,
            inbound_receive_maximum: u16::MAX,
            topic_alias_maximum: 0,
            outbound_aliases: HashMap::new(),
            inbound_aliases: HashMap::new(),
            will: None,
            qos2_inbound: HashSet::new(),
            id_controller: IdController::new(),
            pending: VecDeque::new(),
            inflight: HashMap::new(),
            ban_timeout: 0,
        }
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
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
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    #[must_use]
    pub fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn pending_iter(&self) -> impl Iterator<Item = &PendingPublish> {
        self.pending.iter()
    }

    /// Rebuild a non-clean, disconnected session from persisted state (see
    /// `crate::persistence`), with no live connection yet. `conn_id` and
    /// `listener_id` are placeholders, overwritten with the real values on
    /// the next successful CONNECT that resumes this client id.
    #[must_use]
    pub fn from_persisted(
        client_id: String,
        session_expiry_interval: u32,
        will: Option<Will>,
        pending: VecDeque<PendingPublish>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id: 0,
            listener_id: 0,
            remote_ip: String::new(),
            tls: false,
            status: Status::Disconnected,
            protocol_level: ProtocolLevel::V4,
            client_id,
            username: None,
            clean_session: false,
            keep_alive: Duration::from_secs(0),
            connect_deadline: now,
            last_activity: now,
            session_expiry_interval,
            disconnected_at: Some(now),
            receive_maximum: u16::MAX,
            current_quota: u16::MAX,
            max_packet_size: u32::MAX,
            inbound_receive_maximum: u16::MAX,
            topic_alias_maximum: 0,
            outbound_aliases: HashMap::new(),
            inbound_aliases: HashMap::new(),
            will,
            qos2_inbound: HashSet::new(),
            id_controller: IdController::new(),
            pending,
            inflight: HashMap::new(),
            ban_timeout: 0,
        }
    }

    #[must_use]
    pub const fn is_banned(&self) -> bool {
        matches!(self.status, Status::Banned)
    }

    /// Whether a CONNECT has not arrived within `connect_timeout` of
    /// accept. Only meaningful while `status() == Status::Fresh`.
    #[must_use]
    pub fn is_connect_timed_out(&self, now: Instant) -> bool {
        matches!(self.status, Status::Fresh) && now >= self.connect_deadline
    }

    /// Record activity on every successfully decoded packet, resetting
    /// the keep-alive clock.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    #[must_use]
    pub fn is_keep_alive_timed_out(&self, now: Instant) -> bool {
        matches!(self.status, Status::Connected)
            && !self.keep_alive.is_zero()
            && now.duration_since(self.last_activity) >= self.keep_alive
    }

    /// Parameters decided by the broker once a CONNECT has been accepted
    /// (after any session-takeover/auth checks that require the sessions
    /// map, which this module does not own).
    #[allow(clippy::too_many_arguments)]
    pub fn mark_connected(
        &mut self,
        protocol_level: ProtocolLevel,
        client_id: String,
        username: Option<String>,
        clean_session: bool,
        keep_alive_secs: u16,
        session_expiry_interval: u32,
        receive_maximum: u16,
        max_packet_size: u32,
        topic_alias_maximum: u16,
        inbound_receive_maximum: u16,
        will: Option<Will>,
    ) {
        self.protocol_level = protocol_level;
        self.client_id = client_id;
        self.username = username;
        self.clean_session = clean_session;
        self.keep_alive = if keep_alive_secs == 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_millis(u64::from(keep_alive_secs) * 2000)
        };
        self.session_expiry_interval = session_expiry_interval;
        self.receive_maximum = receive_maximum.max(1);
        self.current_quota = self.receive_maximum;
        self.max_packet_size = max_packet_size;
        self.topic_alias_maximum = topic_alias_maximum;
        self.inbound_receive_maximum = inbound_receive_maximum.max(1);
        self.will = will;
        self.disconnected_at = None;
        self.status = Status::Connected;
        self.last_activity = Instant::now();
    }

    /// Network close or explicit DISCONNECT without an immediate will
    /// publish. Returns the will that should be scheduled, if any.
    pub fn mark_disconnected(&mut self) -> Option<Will> {
        self.status = Status::Disconnected;
        self.disconnected_at = Some(Instant::now());
        self.take_will()
    }

    /// DISCONNECT carrying `DisconnectWithWillMessage`, or abrupt network
    /// loss: the will fires unconditionally, immediately.
    pub fn take_will(&mut self) -> Option<Will> {
        self.will.take()
    }

    /// Client sent a normal DISCONNECT (reason `NormalDisconnection`):
    /// the will is discarded rather than scheduled.
    pub fn discard_will(&mut self) {
        self.will = None;
    }

    pub fn mark_banned(&mut self, duration_secs: u32, accumulative: bool) {
        self.ban_timeout = if accumulative {
            self.ban_timeout.saturating_add(duration_secs)
        } else {
            duration_secs
        };
        self.status = Status::Banned;
    }

    /// Called once per second by the broker's tick. Returns `true` while
    /// still banned.
    pub fn tick_ban(&mut self) -> bool {
        if self.ban_timeout > 0 {
            self.ban_timeout -= 1;
        }
        if self.ban_timeout == 0 && matches!(self.status, Status::Banned) {
            self.status = Status::Disconnected;
            false
        } else {
            matches!(self.status, Status::Banned)
        }
    }

    /// Whether this disconnected, non-expired session should now be
    /// dropped by the broker.
    #[must_use]
    pub fn should_expire(&self, now: Instant) -> bool {
        if self.session_expiry_interval == FOREVER_SESSION_INTERVAL {
            return false;
        }
        match self.disconnected_at {
            Some(at) if !matches!(self.status, Status::Connected) => {
                now.duration_since(at).as_secs() >= u64::from(self.session_expiry_interval)
            }
            _ => false,
        }
    }

    pub fn mark_expired(&mut self) {
        self.status = Status::Expired;
    }

    // ---- Inbound QoS 2 de-duplication ----

    /// Returns `true` if `packet_id` was not already outstanding (first
    /// arrival: route it and reply PUBREC). Returns `false` on a replay
    /// (reply PUBREC with `PacketIdentifierInUse`, or close on v3).
    pub fn note_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.qos2_inbound.insert(packet_id)
    }

    /// PUBREL arrived: free the id and reply PUBCOMP regardless of
    /// whether it was known, per MQTT-4.3.3-1.
    pub fn clear_inbound_qos2(&mut self, packet_id: u16) {
        self.qos2_inbound.remove(&packet_id);
    }

    /// Whether this client currently has more unacked inbound QoS 2
    /// publishes outstanding than the broker's advertised Receive Maximum
    /// allows. Checked right after admitting a new (non-replay) packet id.
    #[must_use]
    pub fn exceeds_inbound_receive_maximum(&self) -> bool {
        self.qos2_inbound.len() > usize::from(self.inbound_receive_maximum)
    }

    // ---- Outbound flow control (publishPendingPackets) ----

    #[must_use]
    pub fn quota_available(&self) -> bool {
        self.current_quota > 0
    }

    pub fn enqueue_publish(&mut self, unit: PendingPublish) {
        self.pending.push_back(unit);
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pop the next queued unit and give it a packet id, consuming one
    /// unit of quota. Returns `None` if the queue is empty, quota is
    /// exhausted, or (for a DUP redelivery) its stored id could not be
    /// reclaimed and no other allocation makes sense here; the unit is
    /// pushed back to the front of the queue in that case.
    pub fn next_ready_publish(&mut self) -> Option<ReadyPublish> {
        if !self.quota_available() {
            return None;
        }
        let mut unit = self.pending.pop_front()?;

        let id = if unit.dup {
            if let Some(id) = unit.packet_id {
                if self.id_controller.add_id(id) {
                    Some(id)
                } else {
                    self.pending.push_front(unit);
                    return None;
                }
            } else {
                let id = self.id_controller.generate_id();
                if id == 0 {
                    self.pending.push_front(unit);
                    return None;
                }
                Some(id)
            }
        } else if unit.qos == QoS::AtMostOnce {
            None
        } else {
            let id = self.id_controller.generate_id();
            if id == 0 {
                self.pending.push_front(unit);
                return None;
            }
            Some(id)
        };

        unit.packet_id = id;
        if let Some(id) = id {
            self.current_quota -= 1;
            let ack_state = if unit.qos == QoS::ExactOnce {
                AckState::AwaitingPubRec
            } else {
                AckState::AwaitingPubAck
            };
            self.inflight.insert(id, (unit.clone(), ack_state));
        }
        Some(ReadyPublish {
            packet_id: id,
            unit,
        })
    }

    /// Topic-alias compression or size failure meant the unit could not
    /// be sent: undo the id allocation and quota consumption, and re-try
    /// the next tick with the same id on DUP.
    pub fn return_undeliverable(&mut self, mut ready: ReadyPublish) {
        if let Some(id) = ready.packet_id {
            self.inflight.remove(&id);
            self.id_controller.remove_id(id);
            self.current_quota += 1;
        }
        ready.unit.dup = true;
        ready.unit.packet_id = None;
        self.pending.push_front(ready.unit);
    }

    /// A PUBLISH stayed over the client's `maxPacketSize` even after
    /// outbound topic-alias compression: release its allocated id and
    /// quota without re-queueing, since a retry would reproduce the same
    /// oversized frame. The caller drops the unit and counts it.
    pub fn discard_oversized(&mut self, ready: &ReadyPublish) {
        if let Some(id) = ready.packet_id {
            self.inflight.remove(&id);
            self.id_controller.remove_id(id);
            self.current_quota += 1;
        }
    }

    /// PUBACK received for a QoS 1 delivery. Returns `true` if the id was
    /// actually outstanding.
    pub fn on_puback(&mut self, packet_id: u16) -> bool {
        if self.inflight.remove(&packet_id).is_some() {
            self.id_controller.remove_id(packet_id);
            self.current_quota += 1;
            true
        } else {
            false
        }
    }

    /// PUBREC received for a QoS 2 delivery: the id stays reserved until
    /// PUBCOMP, but is now "PUBREL owed" rather than "PUBREC owed".
    pub fn on_pubrec(&mut self, packet_id: u16, reason_ok: bool) -> bool {
        if !reason_ok {
            if self.inflight.remove(&packet_id).is_some() {
                self.id_controller.remove_id(packet_id);
                self.current_quota += 1;
            }
            return false;
        }
        if let Some(entry) = self.inflight.get_mut(&packet_id) {
            entry.1 = AckState::AwaitingPubComp;
            true
        } else {
            false
        }
    }

    /// PUBCOMP received: the exchange is complete, free the id.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> bool {
        if self.inflight.remove(&packet_id).is_some() {
            self.id_controller.remove_id(packet_id);
            self.current_quota += 1;
            true
        } else {
            false
        }
    }

    // ---- Topic aliases ----

    /// A PUBLISH arrived carrying (optionally) a `TopicAlias` property
    /// and a topic name that may be empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the alias is out of range, or the topic is
    /// empty with no established mapping.
    pub fn resolve_inbound_alias(
        &mut self,
        alias: Option<u16>,
        topic: &str,
    ) -> Result<Option<String>, &'static str> {
        let Some(alias) = alias else {
            return Ok(None);
        };
        if alias == 0 || alias > TOPIC_ALIAS_MAXIMUM {
            return Err("alias out of range");
        }
        if topic.is_empty() {
            self.inbound_aliases
                .get(&alias)
                .cloned()
                .map(Some)
                .ok_or("unmapped alias with empty topic")
        } else {
            self.inbound_aliases.insert(alias, topic.to_string());
            Ok(None)
        }
    }

    /// Decide how to compress `topic` for an outbound PUBLISH that would
    /// otherwise exceed the client's max packet size.
    pub fn compress_outbound(&mut self, topic: &str) -> TopicAliasAction {
        if let Some(&alias) = self.outbound_aliases.get(topic) {
            return TopicAliasAction::UseAlias(alias);
        }
        if self.topic_alias_maximum == 0 {
            return TopicAliasAction::Uncompressible;
        }
        #[allow(clippy::cast_possible_truncation)]
        let next = self.outbound_aliases.len() as u16 + 1;
        if next > self.topic_alias_maximum {
            return TopicAliasAction::Uncompressible;
        }
        self.outbound_aliases.insert(topic.to_string(), next);
        TopicAliasAction::Establish(next)
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }
}

/// Outbound-delivery decision for `processPublishPacket`, independent of
/// whatever wire-level compression ends up applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    /// Write immediately (QoS 0, connected).
    WriteNow,
    /// Push onto the session's pending-publish queue and run the flow
    /// control loop (QoS 1/2, connected).
    Enqueue,
    /// Session is disconnected but queuing survives reconnection.
    EnqueueOffline,
    /// Session is disconnected and clean, or the message is QoS 0 and
    /// offline QoS-0 delivery is disabled: drop.
    Drop,
}

/// Decide how an outbound PUBLISH should be delivered, per
/// `processPublishPacket`'s disconnected/clean-session rules.
#[must_use]
pub fn decide_delivery(
    status: Status,
    clean_session: bool,
    qos: QoS,
    topic: &str,
    qos0_offline_enabled: bool,
) -> DeliveryDisposition {
    let is_system_topic = topic.starts_with('$');
    match status {
        Status::Connected => {
            if qos == QoS::AtMostOnce {
                DeliveryDisposition::WriteNow
            } else {
                DeliveryDisposition::Enqueue
            }
        }
        _ => {
            if clean_session {
                DeliveryDisposition::Drop
            } else if qos == QoS::AtMostOnce {
                if qos0_offline_enabled && !is_system_topic {
                    DeliveryDisposition::EnqueueOffline
                } else {
                    DeliveryDisposition::Drop
                }
            } else {
                DeliveryDisposition::EnqueueOffline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_connected_session() -> Session {
        let mut session = Session::new(1, 1, "127.0.0.1".to_string(), false, Duration::from_secs(5));
        session.mark_connected(
            ProtocolLevel::V4,
            "client-1".to_string(),
            None,
            false,
            60,
            FOREVER_SESSION_INTERVAL,
            10,
            u32::MAX,
            0,
            20,
            None,
        );
        session
    }

    #[test]
    fn test_fresh_connect_timeout() {
        let session = Session::new(1, 1, "127.0.0.1".to_string(), false, Duration::from_secs(0));
        assert!(session.is_connect_timed_out(Instant::now()));
    }

    #[test]
    fn test_inbound_qos2_dedup() {
        let mut session = new_connected_session();
        assert!(session.note_inbound_qos2(42));
        assert!(!session.note_inbound_qos2(42));
        session.clear_inbound_qos2(42);
        assert!(session.note_inbound_qos2(42));
    }

    #[test]
    fn test_flow_control_respects_quota() {
        let mut session = new_connected_session();
        for _ in 0..12 {
            session.enqueue_publish(PendingPublish::new(
                "a/b".to_string(),
                b"x".to_vec(),
                QoS::AtLeastOnce,
                false,
            ));
        }
        let mut delivered = 0;
        while let Some(ready) = session.next_ready_publish() {
            assert!(ready.packet_id.is_some());
            delivered += 1;
        }
        assert_eq!(delivered, 10);
        assert_eq!(session.pending_len(), 2);
    }

    #[test]
    fn test_puback_frees_quota() {
        let mut session = new_connected_session();
        session.enqueue_publish(PendingPublish::new(
            "a/b".to_string(),
            b"x".to_vec(),
            QoS::AtLeastOnce,
            false,
        ));
        let ready = session.next_ready_publish().unwrap();
        let id = ready.packet_id.unwrap();
        assert!(session.on_puback(id));
        assert!(!session.on_puback(id));
    }

    #[test]
    fn test_qos2_full_roundtrip() {
        let mut session = new_connected_session();
        session.enqueue_publish(PendingPublish::new(
            "a/b".to_string(),
            b"x".to_vec(),
            QoS::ExactOnce,
            false,
        ));
        let ready = session.next_ready_publish().unwrap();
        let id = ready.packet_id.unwrap();
        assert!(session.on_pubrec(id, true));
        assert!(session.on_pubcomp(id));
        assert!(!session.on_pubcomp(id));
    }

    #[test]
    fn test_outbound_alias_allocation_and_reuse() {
        let mut session = new_connected_session();
        session.topic_alias_maximum = 1;
        match session.compress_outbound("a/b") {
            TopicAliasAction::Establish(1) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match session.compress_outbound("a/b") {
            TopicAliasAction::UseAlias(1) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match session.compress_outbound("c/d") {
            TopicAliasAction::Uncompressible => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_inbound_alias_round_trip() {
        let mut session = new_connected_session();
        assert_eq!(session.resolve_inbound_alias(Some(3), "a/b"), Ok(None));
        assert_eq!(
            session.resolve_inbound_alias(Some(3), ""),
            Ok(Some("a/b".to_string()))
        );
        assert!(session.resolve_inbound_alias(Some(0), "x").is_err());
    }

    #[test]
    fn test_decide_delivery() {
        assert_eq!(
            decide_delivery(Status::Connected, false, QoS::AtMostOnce, "a", false),
            DeliveryDisposition::WriteNow
        );
        assert_eq!(
            decide_delivery(Status::Disconnected, true, QoS::AtLeastOnce, "a", false),
            DeliveryDisposition::Drop
        );
        assert_eq!(
            decide_delivery(Status::Disconnected, false, QoS::AtLeastOnce, "a", false),
            DeliveryDisposition::EnqueueOffline
        );
        assert_eq!(
            decide_delivery(Status::Disconnected, false, QoS::AtMostOnce, "a", true),
            DeliveryDisposition::EnqueueOffline
        );
        assert_eq!(
            decide_delivery(Status::Disconnected, false, QoS::AtMostOnce, "$SYS/x", true),
            DeliveryDisposition::Drop
        );
    }

    #[test]
    fn test_keep_alive_is_doubled() {
        let mut session = Session::new(1, 1, "127.0.0.1".to_string(), false, Duration::from_secs(5));
        session.mark_connected(
            ProtocolLevel::V4,
            "client-1".to_string(),
            None,
            false,
            10,
            FOREVER_SESSION_INTERVAL,
            10,
            u32::MAX,
            0,
            20,
            None,
        );
        let now = session.last_activity;
        assert!(!session.is_keep_alive_timed_out(now + Duration::from_secs(19)));
        assert!(session.is_keep_alive_timed_out(now + Duration::from_secs(20)));
    }

    #[test]
    fn test_exceeds_inbound_receive_maximum() {
        let mut session = new_connected_session();
        session.inbound_receive_maximum = 2;
        assert!(session.note_inbound_qos2(1));
        assert!(!session.exceeds_inbound_receive_maximum());
        assert!(session.note_inbound_qos2(2));
        assert!(!session.exceeds_inbound_receive_maximum());
        assert!(session.note_inbound_qos2(3));
        assert!(session.exceeds_inbound_receive_maximum());
        session.clear_inbound_qos2(1);
        assert!(!session.exceeds_inbound_receive_maximum());
    }

    #[test]
    fn test_discard_oversized_releases_id_and_quota() {
        let mut session = new_connected_session();
        session.enqueue_publish(PendingPublish::new(
            "a/b".to_string(),
            b"x".to_vec(),
            QoS::AtLeastOnce,
            false,
        ));
        let quota_before = session.current_quota;
        let ready = session.next_ready_publish().unwrap();
        let id = ready.packet_id.unwrap();
        session.discard_oversized(&ready);
        assert_eq!(session.current_quota, quota_before);
        assert!(!session.inflight.contains_key(&id));
        // The id is free to be handed out again, and the unit is gone
        // rather than re-queued.
        assert_eq!(session.pending_len(), 0);
    }
}
