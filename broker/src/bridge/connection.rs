// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! One actor per configured remote broker: connects out, performs the
//! CONNECT/CONNACK (and optional SUBSCRIBE) handshake, then forwards
//! PUBLISHes in both directions until the socket drops, at which point it
//! reconnects after `reconnect_period`.
//!
//! The "local" leg of a bridge connection described in the MQTT bridging
//! literature is not a second socket here: `broker.rs` already mirrors
//! outbound messages to [`crate::commands::BrokerToBridgeCmd::Publish`]
//! and routes inbound ones from
//! [`crate::commands::BridgeToBrokerCmd::Publish`] back through its
//! ordinary per-session re-encoding path, so a loopback TCP connection
//! into the same process would just add overhead for no extra behaviour.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::timeout;

use codec::ProtocolLevel;

use crate::bridge::handshake;
use crate::commands::{BridgeToBrokerCmd, BrokerToBridgeCmd};
use crate::config::BridgeConnection;
use crate::error::{Error, ErrorKind};
use crate::framer::Framer;
use crate::id_controller::IdController;
use crate::packet_adapter::{self, Inbound, PacketKind};

/// Keep-alive this controller advertises to the remote broker and pings on;
/// bridge connections have no per-connection config knob for it, so every
/// bridge uses the same value as a listener's own default keep-alive.
const BRIDGE_KEEP_ALIVE_SECS: u16 = 60;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect forever, running one handshake-then-forward session per
/// attempt. Never returns; the caller spawns it as its own task.
pub async fn run(
    cfg: BridgeConnection,
    broker_sender: Sender<BridgeToBrokerCmd>,
    mut cmd_receiver: Receiver<BrokerToBridgeCmd>,
) -> ! {
    loop {
        log::info!("bridge {}: connecting to {}", cfg.name(), cfg.remote_address());
        match run_once(&cfg, &broker_sender, &mut cmd_receiver).await {
            Ok(()) => log::info!("bridge {}: remote connection closed", cfg.name()),
            Err(err) => log::warn!("bridge {}: {err}", cfg.name()),
        }
        let _ = broker_sender
            .send(BridgeToBrokerCmd::Disconnected {
                name: cfg.name().to_string(),
            })
            .await;
        tokio::time::sleep(cfg.reconnect_period()).await;
    }
}

async fn read_one_frame(stream: &mut TcpStream, framer: &mut Framer) -> Result<Vec<u8>, Error> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = framer.take_packet().map_err(frame_err)? {
            return Ok(frame);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::new(ErrorKind::Bridge, "remote closed the connection"));
        }
        framer.append(&buf[..n]).map_err(frame_err)?;
    }
}

fn frame_err(err: crate::framer::FramerError) -> Error {
    Error::new(ErrorKind::Bridge, format!("{err:?}"))
}

async fn run_once(
    cfg: &BridgeConnection,
    broker_sender: &Sender<BridgeToBrokerCmd>,
    cmd_receiver: &mut Receiver<BrokerToBridgeCmd>,
) -> Result<(), Error> {
    let remote_level = cfg.remote_protocol_level();
    let mut stream = TcpStream::connect(cfg.remote_address()).await?;
    let mut framer = Framer::new(Duration::from_secs(2 * u64::from(BRIDGE_KEEP_ALIVE_SECS)));

    let connect_bytes = handshake::encode_connect(
        remote_level,
        cfg.client_id(),
        cfg.clean_start(),
        BRIDGE_KEEP_ALIVE_SECS,
        cfg.username(),
        cfg.password(),
    )?;
    stream.write_all(&connect_bytes).await?;
    let connack_bytes = timeout(HANDSHAKE_TIMEOUT, read_one_frame(&mut stream, &mut framer))
        .await
        .map_err(|_| Error::new(ErrorKind::Bridge, "timed out waiting for CONNACK"))??;
    handshake::decode_connack(remote_level, &connack_bytes)?;

    if !cfg.topics_in().is_empty() {
        let mut ids = IdController::new();
        let first_id = ids.generate_id();
        for (packet_id, frame) in handshake::encode_subscribe(remote_level, first_id, cfg.topics_in(), cfg.qos())? {
            stream.write_all(&frame).await?;
            let suback_bytes = timeout(HANDSHAKE_TIMEOUT, read_one_frame(&mut stream, &mut framer))
                .await
                .map_err(|_| Error::new(ErrorKind::Bridge, "timed out waiting for SUBACK"))??;
            handshake::decode_suback(remote_level, &suback_bytes, cfg.name())?;
            ids.remove_id(packet_id);
        }
    }

    broker_sender
        .send(BridgeToBrokerCmd::HandshakeComplete {
            name: cfg.name().to_string(),
            local_version: cfg.local_protocol_level(),
            remote_version: remote_level,
        })
        .await?;
    log::info!("bridge {}: handshake complete", cfg.name());

    forward_loop(cfg, &mut stream, &mut framer, broker_sender, cmd_receiver).await
}

async fn forward_loop(
    cfg: &BridgeConnection,
    stream: &mut TcpStream,
    framer: &mut Framer,
    broker_sender: &Sender<BridgeToBrokerCmd>,
    cmd_receiver: &mut Receiver<BrokerToBridgeCmd>,
) -> Result<(), Error> {
    let remote_level = cfg.remote_protocol_level();
    let mut outbound_ids = IdController::new();
    // QoS 2 publishes received from the remote sit here from PUBLISH until
    // the matching PUBREL arrives, per the receiver-side QoS 2 flow.
    let mut pending_qos2: HashMap<u16, (String, Vec<u8>, bool)> = std::collections::HashMap::new();

    let mut keep_alive = tokio::time::interval(Duration::from_secs(u64::from(BRIDGE_KEEP_ALIVE_SECS)));
    let mut read_buf = [0u8; 4096];

    loop {
        if framer.is_idle_timed_out() {
            return Err(Error::new(ErrorKind::Bridge, "idle timeout waiting for remote traffic"));
        }

        tokio::select! {
            _ = keep_alive.tick() => {
                stream.write_all(&handshake::encode_pingreq(remote_level)).await?;
            }

            cmd = cmd_receiver.recv() => {
                let Some(BrokerToBridgeCmd::Publish { topic, qos, retain, payload, .. }) = cmd else {
                    return Ok(());
                };
                let packet_id = if qos == codec::QoS::AtMostOnce { 0 } else { outbound_ids.generate_id() };
                let bytes = packet_adapter::encode_publish(
                    remote_level, &topic, &payload, qos, retain, false, packet_id, &[],
                )?;
                stream.write_all(&bytes).await?;
            }

            result = stream.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::Bridge, "remote closed the connection"));
                }
                framer.append(&read_buf[..n]).map_err(frame_err)?;
                while let Some(frame) = framer.take_packet().map_err(frame_err)? {
                    handle_frame(cfg, stream, remote_level, &frame, broker_sender, &mut outbound_ids, &mut pending_qos2).await?;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    cfg: &BridgeConnection,
    stream: &mut TcpStream,
    remote_level: ProtocolLevel,
    frame: &[u8],
    broker_sender: &Sender<BridgeToBrokerCmd>,
    outbound_ids: &mut IdController,
    pending_qos2: &mut HashMap<u16, (String, Vec<u8>, bool)>,
) -> Result<(), Error> {
    if packet_adapter::peek_packet_kind(frame)? == PacketKind::PingResponse {
        return Ok(());
    }

    match packet_adapter::decode_inbound(remote_level, frame)? {
        Inbound::Publish(publish) => {
            match publish.qos {
                codec::QoS::AtMostOnce => {
                    deliver(cfg, broker_sender, &publish.topic, publish.qos, publish.retain, publish.payload).await?;
                }
                codec::QoS::AtLeastOnce => {
                    deliver(cfg, broker_sender, &publish.topic, publish.qos, publish.retain, publish.payload).await?;
                    let ack = packet_adapter::encode_puback(remote_level, publish.packet_id)?;
                    stream.write_all(&ack).await?;
                }
                codec::QoS::ExactOnce => {
                    pending_qos2.insert(publish.packet_id, (publish.topic, publish.payload, publish.retain));
                    let rec = packet_adapter::encode_pubrec(remote_level, publish.packet_id)?;
                    stream.write_all(&rec).await?;
                }
            }
        }
        Inbound::PublishRelease(packet_id) => {
            if let Some((topic, payload, retain)) = pending_qos2.remove(&packet_id) {
                deliver(cfg, broker_sender, &topic, codec::QoS::ExactOnce, retain, payload).await?;
            }
            let comp = packet_adapter::encode_pubcomp(remote_level, packet_id)?;
            stream.write_all(&comp).await?;
        }
        Inbound::PublishAck(packet_id) | Inbound::PublishComplete(packet_id) => {
            outbound_ids.remove_id(packet_id);
        }
        Inbound::PublishReceived(packet_id) => {
            let rel = packet_adapter::encode_pubrel(remote_level, packet_id)?;
            stream.write_all(&rel).await?;
        }
        Inbound::Disconnect => {
            return Err(Error::new(ErrorKind::Bridge, "remote sent DISCONNECT"));
        }
        Inbound::PingRequest
        | Inbound::Connect(_)
        | Inbound::Subscribe(_)
        | Inbound::Unsubscribe(_) => {
            log::warn!("bridge {}: unexpected packet from remote broker", cfg.name());
        }
    }
    Ok(())
}

async fn deliver(
    cfg: &BridgeConnection,
    broker_sender: &Sender<BridgeToBrokerCmd>,
    topic: &str,
    qos: codec::QoS,
    retain: bool,
    payload: Vec<u8>,
) -> Result<(), Error> {
    broker_sender
        .send(BridgeToBrokerCmd::Publish {
            name: cfg.name().to_string(),
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        })
        .await?;
    Ok(())
}
