// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The broker actor: the single task that owns every session, the
//! subscription trie, retained messages and statistics.
//!
//! Listener actors and the bridge controller never decode or encode MQTT
//! themselves; they forward raw bytes up and already-encoded bytes down.
//! All protocol logic lives here, driven by one `tokio::select!` loop over
//! the upward command channel, the bridge channel and a one-second
//! [`crate::clock::Ticker`].

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::time::{Duration, Instant};

use codec::{ProtocolLevel, QoS};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::auth::Authenticator;
use crate::cache_types::{SharedListenerCounters, Statistics};
use crate::clock::{DelayQueue, Ticker};
use crate::commands::{
    BridgeToBrokerCmd, BrokerToBridgeCmd, BrokerToListenerCmd, ListenerToBrokerCmd,
};
use crate::config::{self, Config};
use crate::error::{Error, ErrorKind};
use crate::framer::{Framer, FramerError};
use crate::packet_adapter::{
    self, ConnAckReason, DisconnectReason, Inbound, PublishRequest, RetainHandlingMode,
};
use crate::persistence::{
    self, PersistedSession, PersistenceApi, PersistenceStores,
};
use crate::retained::RetainedStore;
use crate::session::{
    decide_delivery, DeliveryDisposition, PendingPublish, Session, Status, TopicAliasAction, Will,
};
use crate::topic_trie::{RetainHandling, SubscribeOptions, Subscription, SubscriptionRouter};
use crate::types::{ConnId, ListenerId};

/// One will waiting out its `delay_interval` in [`Broker::will_queue`].
struct WillFire {
    client_id: String,
    generation: u64,
    will: Will,
}

/// A message routed to a client that has no live connection right now: it
/// is appended to the client's offline [`Session`] queue on the next tick
/// pass rather than written immediately.
struct OfflineDelivery {
    client_id: String,
    unit: PendingPublish,
}

/// Everything [`Broker::bind`] needs to know about one configured listener
/// besides its command channel.
pub struct ListenerHandle {
    pub sender: Sender<BrokerToListenerCmd>,
    pub config: config::Listener,
}

/// The broker actor's owned state.
pub struct Broker {
    config: Config,

    listeners: HashMap<ListenerId, ListenerHandle>,
    broker_receiver: Receiver<ListenerToBrokerCmd>,

    bridge_sender: Option<Sender<BrokerToBridgeCmd>>,
    bridge_receiver: Option<Receiver<BridgeToBrokerCmd>>,
    /// Per-bridge-connection outbound topic filters, used to decide which
    /// locally-routed publishes get mirrored out over a bridge.
    bridge_topics_out: Vec<(String, Vec<String>)>,

    /// Sessions with a live (or lingering-banned) connection, keyed by the
    /// connection id the listener actor knows them by.
    live: HashMap<ConnId, Session>,
    /// `client_id -> conn_id` index into `live`, populated once a CONNECT
    /// resolves the client id.
    client_index: HashMap<String, ConnId>,
    /// Disconnected, non-clean sessions kept for resumption, keyed by
    /// client id.
    offline: HashMap<String, Session>,
    /// Filters (with their granted options) each client currently
    /// subscribes to, used to clean up the router on clean-session
    /// disconnect without walking the whole trie, and to persist/restore
    /// non-clean sessions across restarts.
    client_subscriptions: HashMap<String, Vec<(String, SubscribeOptions)>>,

    framers: HashMap<ConnId, Framer>,
    /// Inbound-message counters this tick, reset every second; compared
    /// against `general.max_flow_rate` to decide bans.
    flow_counts: HashMap<ConnId, [u32; 3]>,

    router: SubscriptionRouter,
    retained: RetainedStore,
    auth: Authenticator,
    stats: Statistics,
    persistence: Option<PersistenceStores>,

    will_queue: DelayQueue<WillFire>,
    session_generation: HashMap<String, u64>,
    next_anonymous_id: u64,

    ticker: Ticker,
    sys_elapsed: Duration,
}

impl Broker {
    /// # Errors
    ///
    /// Returns an error if the configured password file cannot be loaded.
    pub fn new(
        config: Config,
        listeners: HashMap<ListenerId, ListenerHandle>,
        broker_receiver: Receiver<ListenerToBrokerCmd>,
        bridge_sender: Option<Sender<BrokerToBridgeCmd>>,
        bridge_receiver: Option<Receiver<BridgeToBrokerCmd>>,
        listener_counters: SharedListenerCounters,
        persistence: Option<PersistenceStores>,
    ) -> Result<Self, Error> {
        let auth = Authenticator::new(
            config.security().allow_anonymous(),
            config.security().password_file(),
        )?;

        let mut stats = Statistics::with_listener_counters(listener_counters);
        for (id, handle) in &listeners {
            stats.register_listener(*id, handle.config.address().to_string());
        }

        let bridge_topics_out = config
            .bridge()
            .connections()
            .iter()
            .map(|c| (c.name().to_string(), c.topics_out().to_vec()))
            .collect();

        let mut broker = Self {
            config,
            listeners,
            broker_receiver,
            bridge_sender,
            bridge_receiver,
            bridge_topics_out,
            live: HashMap::new(),
            client_index: HashMap::new(),
            offline: HashMap::new(),
            client_subscriptions: HashMap::new(),
            framers: HashMap::new(),
            flow_counts: HashMap::new(),
            router: SubscriptionRouter::new(),
            retained: RetainedStore::new(),
            auth,
            stats,
            persistence,
            will_queue: DelayQueue::new(),
            session_generation: HashMap::new(),
            next_anonymous_id: 0,
            ticker: Ticker::new(),
            sys_elapsed: Duration::from_secs(0),
        };
        broker.load_persisted_sessions();
        Ok(broker)
    }

    pub async fn run_loop(&mut self) -> ! {
        loop {
            tokio::select! {
                Some(cmd) = self.broker_receiver.recv() => {
                    self.handle_listener_cmd(cmd).await;
                }
                Some(cmd) = recv_or_pending(&mut self.bridge_receiver) => {
                    self.handle_bridge_cmd(cmd).await;
                }
                now = self.ticker.tick() => {
                    self.on_tick(now).await;
                }
            }
        }
    }

    // ---- Listener-facing I/O helpers ----

    async fn write_to(&self, listener_id: ListenerId, conn_id: ConnId, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if let Some(handle) = self.listeners.get(&listener_id) {
            let _ = handle.sender.send(BrokerToListenerCmd::Write { conn_id, bytes }).await;
        }
    }

    async fn close(&self, listener_id: ListenerId, conn_id: ConnId) {
        if let Some(handle) = self.listeners.get(&listener_id) {
            let _ = handle.sender.send(BrokerToListenerCmd::Close { conn_id }).await;
        }
    }

    // ---- ListenerToBrokerCmd dispatch ----

    async fn handle_listener_cmd(&mut self, cmd: ListenerToBrokerCmd) {
        match cmd {
            ListenerToBrokerCmd::IncomingConnection { listener_id, conn_id, remote_ip, tls } => {
                self.on_incoming_connection(listener_id, conn_id, remote_ip, tls).await;
            }
            ListenerToBrokerCmd::Data { listener_id, conn_id, bytes } => {
                self.on_data(listener_id, conn_id, bytes).await;
            }
            ListenerToBrokerCmd::CloseConnection { listener_id, conn_id } => {
                self.on_close_connection(listener_id, conn_id).await;
            }
            ListenerToBrokerCmd::WillUpgraded { listener_id, conn_id } => {
                log::debug!("connection {conn_id} on listener {listener_id} upgraded to WebSocket");
            }
        }
    }

    async fn on_incoming_connection(&mut self, listener_id: ListenerId, conn_id: ConnId, remote_ip: String, tls: bool) {
        let connect_timeout = self
            .listeners
            .get(&listener_id)
            .map_or(60, |h| h.config.connect_timeout());

        let max_connections = self.listeners.get(&listener_id).map_or(0, |h| h.config.maximum_connections());
        if max_connections != 0 {
            let current = self.live.values().filter(|s| s.listener_id == listener_id).count();
            if current >= max_connections {
                self.close(listener_id, conn_id).await;
                return;
            }
        }

        let session = Session::new(conn_id, listener_id, remote_ip, tls, Duration::from_secs(u64::from(connect_timeout)));
        self.live.insert(conn_id, session);
        self.framers.insert(
            conn_id,
            Framer::new(Duration::from_secs(u64::from(connect_timeout) * 2 + 60)),
        );
        self.flow_counts.insert(conn_id, [0; 3]);
        self.stats.clients_total += 1;
        self.stats.clients_maximum = self.stats.clients_maximum.max(self.live.len() as u64);
    }

    async fn on_data(&mut self, listener_id: ListenerId, conn_id: ConnId, bytes: Vec<u8>) {
        let Some(framer) = self.framers.get_mut(&conn_id) else { return };
        if let Err(FramerError::BufferOverflow) = framer.append(&bytes) {
            log::warn!("connection {conn_id}: frame buffer overflow, closing");
            self.close(listener_id, conn_id).await;
            self.teardown_connection(listener_id, conn_id, false).await;
            return;
        }

        loop {
            let Some(framer) = self.framers.get_mut(&conn_id) else { break };
            let frame = match framer.take_packet() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                    break;
                }
            };
            if !self.process_frame(listener_id, conn_id, &frame).await {
                break;
            }
        }
    }

    /// Decode and dispatch one complete frame. Returns `false` if the
    /// connection was closed as a result (so the caller stops draining the
    /// framer for a `conn_id` no longer in `self.live`).
    async fn process_frame(&mut self, listener_id: ListenerId, conn_id: ConnId, frame: &[u8]) -> bool {
        let Some(session) = self.live.get(&conn_id) else { return false };

        if session.is_banned() {
            return true;
        }

        let protocol_level = if matches!(session.status(), Status::Fresh) {
            match packet_adapter::peek_protocol_level(frame) {
                Ok(level) => level,
                Err(_) => {
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                    return false;
                }
            }
        } else {
            session.protocol_level()
        };

        if matches!(session.status(), Status::Fresh)
            && packet_adapter::peek_packet_kind(frame).map(|k| k != packet_adapter::PacketKind::Connect).unwrap_or(true)
        {
            // MQTT-3.1.0-1: first packet from the client MUST be CONNECT.
            self.close(listener_id, conn_id).await;
            self.teardown_connection(listener_id, conn_id, false).await;
            return false;
        }

        let inbound = match packet_adapter::decode_inbound(protocol_level, frame) {
            Ok(inbound) => inbound,
            Err(_) => {
                let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::ProtocolError)
                    .unwrap_or_default();
                self.write_to(listener_id, conn_id, bytes).await;
                self.close(listener_id, conn_id).await;
                self.teardown_connection(listener_id, conn_id, false).await;
                return false;
            }
        };

        if let Some(qos) = inbound_qos(&inbound) {
            if let Some(counts) = self.flow_counts.get_mut(&conn_id) {
                counts[qos as usize] += 1;
                let limit = self.config.general().max_flow_rate(qos);
                if limit != 0 && counts[qos as usize] > limit {
                    self.ban_connection(listener_id, conn_id).await;
                    return true;
                }
            }
        }

        if let Some(session) = self.live.get_mut(&conn_id) {
            session.touch(Instant::now());
        }
        self.stats.messages_received.add(1);

        match inbound {
            Inbound::Connect(req) => self.on_connect(listener_id, conn_id, req).await,
            Inbound::Publish(req) => self.on_publish(listener_id, conn_id, protocol_level, req).await,
            Inbound::PublishAck(id) => self.on_puback(conn_id, id),
            Inbound::PublishReceived(id) => self.on_pubrec(listener_id, conn_id, protocol_level, id).await,
            Inbound::PublishRelease(id) => self.on_pubrel(listener_id, conn_id, protocol_level, id).await,
            Inbound::PublishComplete(id) => self.on_pubcomp(conn_id, id),
            Inbound::Subscribe(req) => self.on_subscribe(listener_id, conn_id, protocol_level, req).await,
            Inbound::Unsubscribe(req) => self.on_unsubscribe(listener_id, conn_id, protocol_level, req).await,
            Inbound::PingRequest => {
                let bytes = packet_adapter::encode_pingresp(protocol_level).unwrap_or_default();
                self.write_to(listener_id, conn_id, bytes).await;
            }
            Inbound::Disconnect => {
                self.on_client_disconnect(listener_id, conn_id).await;
                return false;
            }
        }
        self.flush_pending(listener_id, conn_id).await;
        true
    }

    async fn ban_connection(&mut self, listener_id: ListenerId, conn_id: ConnId) {
        let protocol_level = {
            let Some(session) = self.live.get_mut(&conn_id) else { return };
            session.mark_banned(
                self.config.general().ban_duration().as_secs() as u32,
                self.config.general().ban_accumulative(),
            );
            session.protocol_level()
        };
        let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::MessageRateTooHigh)
            .unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;
        self.close(listener_id, conn_id).await;
    }

    // ---- CONNECT ----

    #[allow(clippy::too_many_lines)]
    async fn on_connect(&mut self, listener_id: ListenerId, conn_id: ConnId, req: packet_adapter::ConnectRequest) {
        let protocol_level = req.protocol_level;

        if !self.auth.authenticate(req.username.as_deref(), req.password.as_deref()) {
            let reason = if req.username.is_some() {
                ConnAckReason::BadUserNameOrPassword
            } else {
                ConnAckReason::NotAuthorized
            };
            self.reject_connect(listener_id, conn_id, protocol_level, reason).await;
            return;
        }

        let listener_cfg_username_as_id = self.listeners.get(&listener_id).map(|h| h.config.username_as_client_id());
        let mut client_id = req.client_id.clone();
        if listener_cfg_username_as_id == Some(true) {
            let Some(username) = req.username.clone() else {
                self.reject_connect(listener_id, conn_id, protocol_level, ConnAckReason::NotAuthorized).await;
                return;
            };
            client_id = username;
        }

        let mut assigned_client_id = None;
        if client_id.is_empty() {
            let allow_empty = self.listeners.get(&listener_id).is_some_and(|h| h.config.allow_empty_client_id());
            if !allow_empty || !req.clean_session {
                self.reject_connect(listener_id, conn_id, protocol_level, ConnAckReason::ClientIdentifierNotValid).await;
                return;
            }
            client_id = format!("hebo-{}", self.next_anonymous_id);
            self.next_anonymous_id += 1;
            assigned_client_id = Some(client_id.clone());
        }

        // A ban survives reconnect until its own `ban_timeout` reaches
        // zero: reject the new CONNECT without touching the banned
        // session's timer. `offline` never holds a `Banned` session (it
        // only holds sessions that already finished their ban tick), so
        // `live`/`client_index` is the only place to look.
        if let Some(&existing_conn_id) = self.client_index.get(&client_id) {
            if existing_conn_id != conn_id && self.live.get(&existing_conn_id).is_some_and(Session::is_banned) {
                self.reject_connect(listener_id, conn_id, protocol_level, ConnAckReason::Banned).await;
                return;
            }
        }

        // Session takeover: an existing live connection under this client
        // id is always evicted, regardless of clean-session.
        if let Some(&old_conn_id) = self.client_index.get(&client_id) {
            if old_conn_id != conn_id {
                self.take_over(&client_id, old_conn_id).await;
            }
        }

        let mut session_present = false;
        let mut session = self.live.remove(&conn_id).expect("fresh session must exist");

        if req.clean_session {
            self.offline.remove(&client_id);
            self.drop_client_subscriptions(&client_id);
        } else if let Some(mut existing) = self.offline.remove(&client_id) {
            existing.conn_id = conn_id;
            existing.listener_id = listener_id;
            existing.remote_ip = session.remote_ip.clone();
            existing.tls = session.tls;
            session = existing;
            session_present = true;
        }

        let generation = self.session_generation.entry(client_id.clone()).or_insert(0);
        *generation += 1;
        let generation = *generation;

        let keep_alive = self.negotiate_keep_alive(listener_id, req.keep_alive);
        let receive_maximum = self.listeners.get(&listener_id).map_or(20, |h| h.config.maximum_inflight_messages());

        let will = req.will.map(|w| Will {
            topic: w.topic,
            payload: w.message,
            qos: w.qos,
            retain: w.retain,
            delay_interval: w.delay_interval,
        });

        session.mark_connected(
            protocol_level,
            client_id.clone(),
            req.username,
            req.clean_session,
            keep_alive,
            req.session_expiry_interval,
            req.receive_maximum,
            req.maximum_packet_size.unwrap_or(u32::MAX),
            req.topic_alias_maximum,
            receive_maximum,
            will,
        );

        self.live.insert(conn_id, session);
        self.client_index.insert(client_id.clone(), conn_id);
        if let Some(framer) = self.framers.get_mut(&conn_id) {
            framer.reset();
        }
        self.stats.clients_connected += 1;

        let bytes = packet_adapter::encode_connack(
            protocol_level,
            session_present,
            ConnAckReason::Success,
            receive_maximum,
            self.config.general().maximum_qos(),
            true,
            crate::session::TOPIC_ALIAS_MAXIMUM,
            assigned_client_id.as_deref(),
        )
        .unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;
    }

    fn negotiate_keep_alive(&self, listener_id: ListenerId, requested: u16) -> u16 {
        let listener_default = self.listeners.get(&listener_id).map_or(60, |h| h.config.keep_alive());
        let maximum = self.config.general().maximum_keep_alive();
        let effective = if requested == 0 { listener_default } else { requested };
        if u32::from(effective) > maximum {
            #[allow(clippy::cast_possible_truncation)]
            { maximum as u16 }
        } else {
            effective
        }
    }

    async fn reject_connect(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, reason: ConnAckReason) {
        let bytes = packet_adapter::encode_connack(
            protocol_level,
            false,
            reason,
            0,
            QoS::AtMostOnce,
            false,
            0,
            None,
        )
        .unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;
        self.close(listener_id, conn_id).await;
        self.teardown_connection(listener_id, conn_id, false).await;
    }

    async fn take_over(&mut self, client_id: &str, old_conn_id: ConnId) {
        if let Some(session) = self.live.get(&old_conn_id) {
            let listener_id = session.listener_id;
            let protocol_level = session.protocol_level();
            let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::SessionTakenOver)
                .unwrap_or_default();
            self.write_to(listener_id, old_conn_id, bytes).await;
            self.close(listener_id, old_conn_id).await;
            self.teardown_connection(listener_id, old_conn_id, true).await;
        }
        self.client_index.remove(client_id);
    }

    // ---- PUBLISH ----

    async fn on_publish(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, req: PublishRequest) {
        let client_id = {
            let Some(session) = self.live.get(&conn_id) else { return };
            session.client_id().to_string()
        };

        if req.topic.starts_with('$') && !req.topic.starts_with("$share/") {
            let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::ProtocolError)
                .unwrap_or_default();
            self.write_to(listener_id, conn_id, bytes).await;
            self.close(listener_id, conn_id).await;
            self.teardown_connection(listener_id, conn_id, false).await;
            return;
        }

        if req.qos as u8 > self.config.general().maximum_qos() as u8 {
            let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::ProtocolError)
                .unwrap_or_default();
            self.write_to(listener_id, conn_id, bytes).await;
            self.close(listener_id, conn_id).await;
            self.teardown_connection(listener_id, conn_id, false).await;
            return;
        }

        let topic = {
            let Some(session) = self.live.get_mut(&conn_id) else { return };
            match session.resolve_inbound_alias(req.topic_alias, &req.topic) {
                Ok(Some(resolved)) => resolved,
                Ok(None) if req.topic.is_empty() => return,
                Ok(None) => req.topic.clone(),
                Err(_) => {
                    let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::TopicAliasInvalid)
                        .unwrap_or_default();
                    self.write_to(listener_id, conn_id, bytes).await;
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                    return;
                }
            }
        };

        match req.qos {
            QoS::AtMostOnce => {
                self.publish_internal(&client_id, &topic, &req.payload, req.qos, req.retain).await;
            }
            QoS::AtLeastOnce => {
                let matched = self.publish_internal(&client_id, &topic, &req.payload, req.qos, req.retain).await;
                let reason_code = if matched {
                    codec::v5::ReasonCode::Success
                } else {
                    codec::v5::ReasonCode::NoMatchingSubscribers
                };
                let bytes = packet_adapter::encode_puback(protocol_level, req.packet_id, reason_code).unwrap_or_default();
                self.write_to(listener_id, conn_id, bytes).await;
            }
            QoS::ExactOnce => {
                let first_arrival = self
                    .live
                    .get_mut(&conn_id)
                    .map(|s| s.note_inbound_qos2(req.packet_id))
                    .unwrap_or(false);
                if !first_arrival && protocol_level != ProtocolLevel::V5 {
                    // V3/V3.1.1 PUBREC has no reason-code field to signal a
                    // repeated packet id; close the connection instead.
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                    return;
                }
                if first_arrival && self.live.get(&conn_id).is_some_and(Session::exceeds_inbound_receive_maximum) {
                    let bytes = packet_adapter::encode_disconnect(protocol_level, DisconnectReason::ReceiveMaximumExceeded)
                        .unwrap_or_default();
                    self.write_to(listener_id, conn_id, bytes).await;
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                    return;
                }
                if first_arrival {
                    self.publish_internal(&client_id, &topic, &req.payload, req.qos, req.retain).await;
                }
                let reason_code = if first_arrival {
                    codec::v5::ReasonCode::Success
                } else {
                    codec::v5::ReasonCode::PacketIdentifierInUse
                };
                let bytes = packet_adapter::encode_pubrec(protocol_level, req.packet_id, reason_code).unwrap_or_default();
                self.write_to(listener_id, conn_id, bytes).await;
            }
        }

        self.mirror_to_bridges(&topic, req.qos, req.retain, &req.payload).await;
    }

    fn on_puback(&mut self, conn_id: ConnId, packet_id: u16) {
        if let Some(session) = self.live.get_mut(&conn_id) {
            session.on_puback(packet_id);
        }
    }

    async fn on_pubrec(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, packet_id: u16) {
        let ok = self.live.get_mut(&conn_id).map(|s| s.on_pubrec(packet_id, true)).unwrap_or(false);
        if ok {
            let bytes = packet_adapter::encode_pubrel(protocol_level, packet_id).unwrap_or_default();
            self.write_to(listener_id, conn_id, bytes).await;
        }
    }

    async fn on_pubrel(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, packet_id: u16) {
        if let Some(session) = self.live.get_mut(&conn_id) {
            session.clear_inbound_qos2(packet_id);
        }
        let bytes = packet_adapter::encode_pubcomp(protocol_level, packet_id).unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;
    }

    fn on_pubcomp(&mut self, conn_id: ConnId, packet_id: u16) {
        if let Some(session) = self.live.get_mut(&conn_id) {
            session.on_pubcomp(packet_id);
        }
    }

    /// `processPublishPacket`: apply retain, then route to every matching
    /// subscriber (plain and shared), respecting `noLocal`. Returns whether
    /// routing found at least one matching subscriber, for the caller to
    /// report `NoMatchingSubscribers` on the QoS 1/2 ack when it didn't.
    async fn publish_internal(&mut self, publisher_client_id: &str, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> bool {
        self.stats.publish_messages_received.add(1);

        if retain {
            self.retained.apply(crate::retained::RetainedMessage {
                topic: topic.to_string(),
                qos,
                payload: payload.to_vec(),
                properties: Vec::new(),
            });
            if let Some(store) = &self.persistence {
                if self.config.storage().persistence() {
                    let key = topic.to_string();
                    let _ = if payload.is_empty() {
                        store.retained.delete(&key)
                    } else {
                        store.retained.put(&key, payload)
                    };
                }
            }
            self.stats.retained_messages = self.retained.len() as u64;
        }

        let client_index = &self.client_index;
        let targets = self.router.route(topic, |client_id| client_index.contains_key(client_id));

        // A client can have more than one subscription filter match the
        // same topic (e.g. `a/+` and `a/b`); merge those into a single
        // delivery per client rather than sending one PUBLISH per filter.
        struct Merged {
            max_qos: QoS,
            retain_as_published: bool,
            all_no_local: bool,
            identifiers: Vec<u32>,
        }
        let mut merged: HashMap<String, Merged> = HashMap::new();
        for target in targets {
            let entry = merged.entry(target.client_id).or_insert(Merged {
                max_qos: QoS::AtMostOnce,
                retain_as_published: false,
                all_no_local: true,
                identifiers: Vec::new(),
            });
            entry.max_qos = max_qos(entry.max_qos, target.options.max_qos);
            entry.retain_as_published |= target.options.retain_as_published;
            entry.all_no_local &= target.options.no_local;
            if let Some(id) = target.identifier {
                if !entry.identifiers.contains(&id) {
                    entry.identifiers.push(id);
                }
            }
        }

        let any_matched = !merged.is_empty();
        for (client_id, merged) in merged {
            if merged.all_no_local && client_id == publisher_client_id {
                continue;
            }
            let delivered_qos = min_qos(qos, merged.max_qos);
            let unit = PendingPublish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: delivered_qos,
                retain: merged.retain_as_published && retain,
                dup: false,
                subscription_identifiers: merged.identifiers,
                packet_id: None,
            };
            self.deliver(&client_id, unit).await;
        }
        any_matched
    }

    async fn deliver(&mut self, client_id: &str, unit: PendingPublish) {
        let status = self
            .client_index
            .get(client_id)
            .and_then(|conn_id| self.live.get(conn_id))
            .map_or(Status::Disconnected, Session::status);
        let clean_session = self
            .client_index
            .get(client_id)
            .and_then(|conn_id| self.live.get(conn_id))
            .map_or_else(|| self.offline.get(client_id).map_or(true, Session::clean_session), Session::clean_session);

        let qos0_offline = self.config.general().qos0_offline_queue();
        match decide_delivery(status, clean_session, unit.qos, &unit.topic, qos0_offline) {
            DeliveryDisposition::Drop => {
                self.stats.publish_messages_dropped.add(1);
            }
            DeliveryDisposition::WriteNow => {
                if let Some(&conn_id) = self.client_index.get(client_id) {
                    self.send_unit_now(conn_id, unit).await;
                }
            }
            DeliveryDisposition::Enqueue => {
                if let Some(&conn_id) = self.client_index.get(client_id) {
                    if let Some(session) = self.live.get_mut(&conn_id) {
                        session.enqueue_publish(unit);
                    }
                }
            }
            DeliveryDisposition::EnqueueOffline => {
                if let Some(session) = self.offline.get_mut(client_id) {
                    session.enqueue_publish(unit);
                }
            }
        }
    }

    async fn send_unit_now(&mut self, conn_id: ConnId, unit: PendingPublish) {
        let Some(session) = self.live.get_mut(&conn_id) else { return };
        let listener_id = session.listener_id;
        let protocol_level = session.protocol_level();
        let Some(frames) = encode_for_delivery(session, protocol_level, 0, &unit) else {
            self.stats.publish_messages_dropped.add(1);
            return;
        };
        for frame in frames {
            self.write_to(listener_id, conn_id, frame).await;
        }
        self.stats.publish_messages_sent.add(1);
    }

    /// Drain a connected session's pending-publish queue under flow control,
    /// applying outbound topic-alias compression and the client's
    /// `maxPacketSize` limit.
    async fn flush_pending(&mut self, listener_id: ListenerId, conn_id: ConnId) {
        loop {
            let Some(session) = self.live.get_mut(&conn_id) else { break };
            if session.pending_len() == 0 {
                break;
            }
            let Some(ready) = session.next_ready_publish() else { break };
            let protocol_level = session.protocol_level();
            let packet_id = ready.packet_id.unwrap_or(0);

            let Some(frames) = encode_for_delivery(session, protocol_level, packet_id, &ready.unit) else {
                session.discard_oversized(&ready);
                self.stats.publish_messages_dropped.add(1);
                continue;
            };
            for frame in frames {
                self.write_to(listener_id, conn_id, frame).await;
            }
            self.stats.publish_messages_sent.add(1);
        }
    }

    // ---- SUBSCRIBE / UNSUBSCRIBE ----

    async fn on_subscribe(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, req: packet_adapter::SubscribeRequest) {
        let client_id = {
            let Some(session) = self.live.get(&conn_id) else { return };
            session.client_id().to_string()
        };

        let mut granted = Vec::with_capacity(req.topics.len());
        let mut retained_to_send = Vec::new();

        for topic in &req.topics {
            let max_qos = min_qos(topic.qos, self.config.general().maximum_qos());
            let options = SubscribeOptions {
                max_qos,
                no_local: topic.no_local,
                retain_as_published: topic.retain_as_published,
                retain_handling: match topic.retain_handling {
                    RetainHandlingMode::SendAtSubscribe => RetainHandling::SendAtSubscribe,
                    RetainHandlingMode::SendIfNew => RetainHandling::SendIfNew,
                    RetainHandlingMode::DoNotSend => RetainHandling::DoNotSend,
                },
            };
            let is_new = self.router.subscribe(
                &topic.filter,
                &client_id,
                Subscription { options, identifier: req.identifier, is_new: true },
            );
            self.client_subscriptions.entry(client_id.clone()).or_default().push((topic.filter.clone(), options));
            granted.push(Some(max_qos));

            let send_retained = match options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
            if send_retained {
                for msg in self.retained.matching(&topic.filter) {
                    retained_to_send.push((msg.topic.clone(), msg.payload.clone(), min_qos(msg.qos, max_qos)));
                }
            }
        }
        self.stats.subscriptions_count = self.router_subscription_count();

        let bytes = packet_adapter::encode_suback(protocol_level, req.packet_id, &granted).unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;

        for (topic, payload, qos) in retained_to_send {
            let unit = PendingPublish { topic, payload, qos, retain: true, dup: false, subscription_identifiers: req.identifier.into_iter().collect(), packet_id: None };
            self.send_unit_now(conn_id, unit).await;
        }
    }

    async fn on_unsubscribe(&mut self, listener_id: ListenerId, conn_id: ConnId, protocol_level: ProtocolLevel, req: packet_adapter::UnsubscribeRequest) {
        let client_id = {
            let Some(session) = self.live.get(&conn_id) else { return };
            session.client_id().to_string()
        };
        for filter in &req.filters {
            self.router.unsubscribe(filter, &client_id);
            if let Some(list) = self.client_subscriptions.get_mut(&client_id) {
                list.retain(|(f, _)| f != filter);
            }
        }
        self.stats.subscriptions_count = self.router_subscription_count();
        let bytes = packet_adapter::encode_unsuback(protocol_level, req.packet_id).unwrap_or_default();
        self.write_to(listener_id, conn_id, bytes).await;
    }

    fn router_subscription_count(&self) -> u64 {
        self.client_subscriptions.values().map(|v| v.len() as u64).sum()
    }

    fn drop_client_subscriptions(&mut self, client_id: &str) {
        if let Some(subscriptions) = self.client_subscriptions.remove(client_id) {
            let filters: Vec<String> = subscriptions.into_iter().map(|(filter, _)| filter).collect();
            self.router.remove_client(&filters, client_id);
        }
    }

    // ---- Disconnection / teardown ----

    async fn on_client_disconnect(&mut self, listener_id: ListenerId, conn_id: ConnId) {
        if let Some(session) = self.live.get_mut(&conn_id) {
            session.discard_will();
        }
        self.close(listener_id, conn_id).await;
        self.teardown_connection(listener_id, conn_id, false).await;
    }

    async fn on_close_connection(&mut self, listener_id: ListenerId, conn_id: ConnId) {
        self.teardown_connection(listener_id, conn_id, true).await;
    }

    /// Move a connection out of `live`, scheduling its will (if any) and
    /// either retiring the session (clean) or parking it in `offline`.
    ///
    /// `abrupt` distinguishes a network-level close (will fires, possibly
    /// after `delay_interval`) from a connection this broker itself closed
    /// after rejecting/taking over (no will).
    async fn teardown_connection(&mut self, listener_id: ListenerId, conn_id: ConnId, abrupt: bool) {
        self.framers.remove(&conn_id);
        self.flow_counts.remove(&conn_id);
        let Some(mut session) = self.live.remove(&conn_id) else { return };
        let _ = listener_id;

        if matches!(session.status(), Status::Fresh) {
            return;
        }

        let client_id = session.client_id().to_string();
        if self.client_index.get(&client_id) == Some(&conn_id) {
            self.client_index.remove(&client_id);
        }
        self.stats.clients_connected = self.stats.clients_connected.saturating_sub(1);
        self.stats.clients_disconnected += 1;

        let will = if abrupt { session.mark_disconnected() } else { None };
        if let Some(will) = will {
            let generation = self.session_generation.get(&client_id).copied().unwrap_or(0);
            if will.delay_interval == 0 {
                self.publish_internal(&client_id, &will.topic.clone(), &will.payload.clone(), will.qos, will.retain).await;
            } else {
                self.will_queue.schedule(
                    Duration::from_secs(u64::from(will.delay_interval)),
                    WillFire { client_id: client_id.clone(), generation, will },
                );
            }
        }

        if session.clean_session() {
            self.drop_client_subscriptions(&client_id);
            self.session_generation.remove(&client_id);
        } else {
            self.persist_offline_session(&client_id, &session);
            self.offline.insert(client_id, session);
        }
    }

    /// Write a non-clean session's subscriptions, will and pending queue
    /// through [`PersistenceStores`] so a restarted broker can resume it
    /// via [`Self::load_persisted_sessions`]. A no-op when persistence is
    /// disabled or unconfigured.
    fn persist_offline_session(&self, client_id: &str, session: &Session) {
        let Some(store) = &self.persistence else { return };
        if !self.config.storage().persistence() {
            return;
        }
        let subscriptions = self.client_subscriptions.get(client_id).cloned().unwrap_or_default();
        let persisted = PersistedSession {
            session_expiry_interval: session.session_expiry_interval(),
            will: session.will().cloned(),
            subscriptions: subscriptions.clone(),
        };
        let _ = store.sessions.put(client_id, &persistence::encode_session(&persisted));
        let _ = store
            .shared_subscriptions
            .put(client_id, &persistence::encode_shared_filters(&subscriptions));

        if let Ok(pending_store) = store.pending_for(client_id) {
            if let Ok(stale_keys) = pending_store.keys_with_prefix("") {
                for key in stale_keys {
                    let _ = pending_store.delete(&key);
                }
            }
            for (index, unit) in session.pending_iter().enumerate() {
                let _ = pending_store.put(&index.to_string(), &persistence::encode_pending(unit));
            }
        }
    }

    /// Reload every non-clean session [`Self::persist_offline_session`]
    /// wrote out, re-seeding the subscription router and `offline` map so
    /// clients can resume across a broker restart. A no-op when
    /// persistence is disabled or unconfigured.
    fn load_persisted_sessions(&mut self) {
        let Some(store) = &self.persistence else { return };
        if !self.config.storage().persistence() {
            return;
        }
        let Ok(client_ids) = store.sessions.keys_with_prefix("") else { return };
        for client_id in client_ids {
            let Ok(Some(bytes)) = store.sessions.get(&client_id) else { continue };
            let Some(persisted) = persistence::decode_session(&bytes) else { continue };

            for (filter, options) in &persisted.subscriptions {
                self.router.subscribe(
                    filter,
                    &client_id,
                    Subscription { options: *options, identifier: None, is_new: true },
                );
            }
            self.client_subscriptions.insert(client_id.clone(), persisted.subscriptions.clone());

            let pending = store.pending_for(&client_id).ok().map_or_else(VecDeque::new, |pending_store| {
                let mut keyed: Vec<(usize, Vec<u8>)> = pending_store
                    .keys_with_prefix("")
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|key| Some((key.parse::<usize>().ok()?, pending_store.get(&key).ok()??)))
                    .collect();
                keyed.sort_by_key(|(index, _)| *index);
                persistence::decode_pending_queue(keyed.into_iter().map(|(_, bytes)| bytes).collect())
            });

            let session = Session::from_persisted(client_id.clone(), persisted.session_expiry_interval, persisted.will, pending);
            self.offline.insert(client_id, session);
        }
        self.stats.subscriptions_count = self.router_subscription_count();
    }

    async fn mirror_to_bridges(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) {
        let Some(sender) = &self.bridge_sender else { return };
        for (name, filters) in &self.bridge_topics_out {
            if filters.iter().any(|f| crate::retained::topic_matches_filter(topic, f)) {
                let _ = sender
                    .send(BrokerToBridgeCmd::Publish { name: name.clone(), topic: topic.to_string(), qos, retain, payload: payload.to_vec() })
                    .await;
            }
        }
    }

    // ---- Bridge-facing ----

    async fn handle_bridge_cmd(&mut self, cmd: BridgeToBrokerCmd) {
        match cmd {
            BridgeToBrokerCmd::Publish { name, topic, qos, retain, payload } => {
                log::debug!("bridge {name}: inbound publish on {topic}");
                self.publish_internal(&format!("$bridge/{name}"), &topic, &payload, qos, retain).await;
            }
            BridgeToBrokerCmd::HandshakeComplete { name, local_version, remote_version } => {
                log::info!("bridge {name}: handshake complete (local {local_version:?}, remote {remote_version:?})");
            }
            BridgeToBrokerCmd::Disconnected { name } => {
                log::warn!("bridge {name}: disconnected");
            }
        }
    }

    // ---- Tick ----

    async fn on_tick(&mut self, now: Instant) {
        self.stats.tick();
        for counts in self.flow_counts.values_mut() {
            *counts = [0; 3];
        }

        let timed_out: Vec<(ListenerId, ConnId, bool)> = self
            .live
            .iter()
            .filter_map(|(&conn_id, session)| {
                if session.is_connect_timed_out(now) {
                    Some((session.listener_id, conn_id, false))
                } else if session.is_keep_alive_timed_out(now) {
                    Some((session.listener_id, conn_id, true))
                } else {
                    None
                }
            })
            .collect();
        for (listener_id, conn_id, abrupt) in timed_out {
            self.close(listener_id, conn_id).await;
            self.teardown_connection(listener_id, conn_id, abrupt).await;
        }

        let banned: Vec<ConnId> = self.live.keys().copied().collect();
        for conn_id in banned {
            if let Some(session) = self.live.get_mut(&conn_id) {
                if matches!(session.status(), Status::Banned) && !session.tick_ban() {
                    let listener_id = session.listener_id;
                    self.close(listener_id, conn_id).await;
                    self.teardown_connection(listener_id, conn_id, false).await;
                }
            }
        }

        let expired: Vec<String> = self
            .offline
            .iter()
            .filter(|(_, session)| session.should_expire(now))
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in expired {
            self.offline.remove(&client_id);
            self.drop_client_subscriptions(&client_id);
            self.session_generation.remove(&client_id);
            self.stats.clients_expired += 1;
        }

        let due = self.will_queue.drain_due(now);
        for fire in due {
            let reconnected = self.session_generation.get(&fire.client_id).copied() != Some(fire.generation);
            if !reconnected {
                self.publish_internal(&fire.client_id, &fire.will.topic, &fire.will.payload, fire.will.qos, fire.will.retain).await;
            }
        }

        let connected: Vec<ConnId> = self.live.keys().copied().collect();
        for conn_id in connected {
            if let Some(session) = self.live.get(&conn_id) {
                let listener_id = session.listener_id;
                self.flush_pending(listener_id, conn_id).await;
            }
        }

        let sys_interval = self.config.general().sys_interval();
        if !sys_interval.is_zero() {
            self.sys_elapsed += Duration::from_secs(1);
            if self.sys_elapsed >= sys_interval {
                self.sys_elapsed = Duration::from_secs(0);
                self.publish_sys_stats().await;
            }
        }
    }

    async fn publish_sys_stats(&mut self) {
        let uptime = self.stats.uptime_string();
        let entries: Vec<(String, String)> = vec![
            ("$SYS/broker/uptime".to_string(), uptime),
            ("$SYS/broker/clients/total".to_string(), self.stats.clients_total.to_string()),
            ("$SYS/broker/clients/connected".to_string(), self.stats.clients_connected.to_string()),
            ("$SYS/broker/clients/disconnected".to_string(), self.stats.clients_disconnected.to_string()),
            ("$SYS/broker/clients/expired".to_string(), self.stats.clients_expired.to_string()),
            ("$SYS/broker/subscriptions/count".to_string(), self.stats.subscriptions_count.to_string()),
            ("$SYS/broker/retained messages/count".to_string(), self.stats.retained_messages.to_string()),
            ("$SYS/broker/messages/received".to_string(), self.stats.messages_received.total().to_string()),
            ("$SYS/broker/messages/sent".to_string(), self.stats.messages_sent.total().to_string()),
            ("$SYS/broker/publish/messages/received".to_string(), self.stats.publish_messages_received.total().to_string()),
            ("$SYS/broker/publish/messages/sent".to_string(), self.stats.publish_messages_sent.total().to_string()),
            ("$SYS/broker/publish/messages/dropped".to_string(), self.stats.publish_messages_dropped.total().to_string()),
            ("$SYS/broker/load/messages/received/1min".to_string(), format!("{:.2}", self.stats.messages_received.average(60))),
            ("$SYS/broker/load/messages/received/5min".to_string(), format!("{:.2}", self.stats.messages_received.average(300))),
            ("$SYS/broker/load/messages/received/15min".to_string(), format!("{:.2}", self.stats.messages_received.average(900))),
        ];
        for (topic, payload) in entries {
            self.publish_internal("$SYS", &topic, payload.as_bytes(), QoS::AtMostOnce, false).await;
        }
        for (id, stats) in &self.stats.listeners {
            let _ = id;
            let recv_topic = format!("$SYS/broker/listener/{}/bytes/received", stats.address);
            let sent_topic = format!("$SYS/broker/listener/{}/bytes/sent", stats.address);
            let recv = stats.bytes_received.total().to_string();
            let sent = stats.bytes_sent.total().to_string();
            self.publish_internal("$SYS", &recv_topic, recv.as_bytes(), QoS::AtMostOnce, false).await;
            self.publish_internal("$SYS", &sent_topic, sent.as_bytes(), QoS::AtMostOnce, false).await;
        }
    }
}

/// Encode a PUBLISH for delivery, applying outbound topic-alias
/// compression and then enforcing the client's `maxPacketSize`: if the
/// encoded frame(s) are still too large afterwards, returns `None` and
/// the caller must drop the unit and count it as dropped.
fn encode_for_delivery(
    session: &mut Session,
    protocol_level: ProtocolLevel,
    packet_id: u16,
    unit: &PendingPublish,
) -> Option<Vec<Vec<u8>>> {
    let topic_for_wire = unit.topic.clone();
    let alias_action = session.compress_outbound(&topic_for_wire);

    let mut frames = Vec::with_capacity(2);
    match alias_action {
        TopicAliasAction::Establish(alias) => {
            let establish_bytes = packet_adapter::encode_publish_with_alias(
                protocol_level, Some(&topic_for_wire), alias, &[], QoS::AtMostOnce, false, false, 0, &[],
            )
            .unwrap_or_default();
            frames.push(establish_bytes);
            let bytes = packet_adapter::encode_publish_with_alias(
                protocol_level, None, alias, &unit.payload, unit.qos, unit.retain, unit.dup, packet_id,
                &unit.subscription_identifiers,
            )
            .unwrap_or_default();
            frames.push(bytes);
        }
        TopicAliasAction::UseAlias(alias) => {
            let bytes = packet_adapter::encode_publish_with_alias(
                protocol_level, None, alias, &unit.payload, unit.qos, unit.retain, unit.dup, packet_id,
                &unit.subscription_identifiers,
            )
            .unwrap_or_default();
            frames.push(bytes);
        }
        TopicAliasAction::None | TopicAliasAction::Uncompressible => {
            let bytes = packet_adapter::encode_publish(
                protocol_level, &topic_for_wire, &unit.payload, unit.qos, unit.retain, unit.dup, packet_id,
                &unit.subscription_identifiers,
            )
            .unwrap_or_default();
            frames.push(bytes);
        }
    }

    let total_len: usize = frames.iter().map(Vec::len).sum();
    if total_len as u64 > u64::from(session.max_packet_size()) {
        return None;
    }
    Some(frames)
}

async fn recv_or_pending<T>(receiver: &mut Option<Receiver<T>>) -> Option<T> {
    match receiver {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}

fn max_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) >= (b as u8) {
        a
    } else {
        b
    }
}

fn inbound_qos(inbound: &Inbound) -> Option<QoS> {
    match inbound {
        Inbound::Publish(req) => Some(req.qos),
        _ => None,
    }
}

