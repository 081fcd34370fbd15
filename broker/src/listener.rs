// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! One listener actor per bound address.
//!
//! A listener owns the accept loop for one `(scheme, address, port)` and
//! spawns a lightweight per-connection task for every socket it accepts.
//! Those per-connection tasks never decode MQTT themselves: they forward raw
//! bytes up to the broker actor via [`ListenerToBrokerCmd::Data`] and apply
//! whatever the broker writes back down via [`BrokerToListenerCmd`]. All
//! protocol framing and decoding happens inside the broker actor, so this
//! module only needs to know about bytes and sockets.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver, Sender};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::cache_types::SharedListenerCounters;
use crate::commands::{BrokerToListenerCmd, ListenerToBrokerCmd};
use crate::config;
use crate::constants;
use crate::error::{Error, ErrorKind};
use crate::socket;
use crate::stream::{PeekedStream, Stream};
use crate::types::{ConnId, ListenerId};

/// WebSocket subprotocols this broker is willing to speak, offered (and
/// echoed back, if the client proposed one of them) during the WS upgrade
/// handshake.
const WS_SUBPROTOCOLS: &[&str] = &[
    "mqtt",
    "mqttv3",
    "mqttv31",
    "mqttv311",
    "mqttv3.1",
    "mqttv3.1.1",
    "mqttv5",
    "mqttv50",
    "mqttv5.0",
];

/// How many leading bytes of a freshly-accepted socket to sniff for an HTTP
/// WebSocket upgrade request before committing to a transport.
const UPGRADE_SNIFF_LEN: usize = 1024;

enum BoundSocket {
    Mqtt(TcpListener),
    Mqtts(TcpListener, TlsAcceptor),
    Ws(TcpListener),
    Wss(TcpListener, TlsAcceptor),
}

/// Commands sent from the listener's accept loop down to one connection's
/// own read/write task.
enum ConnCmd {
    Write(Vec<u8>),
    Close,
}

/// Owns one bound address and every connection currently accepted on it.
pub struct Listener {
    id: ListenerId,
    address: String,
    maximum_connections: usize,
    socket: BoundSocket,

    broker_sender: Sender<ListenerToBrokerCmd>,
    broker_receiver: Receiver<BrokerToListenerCmd>,

    connections: HashMap<ConnId, Sender<ConnCmd>>,
    next_local_conn_id: u32,

    done_sender: Sender<ConnId>,
    done_receiver: Receiver<ConnId>,

    counters: SharedListenerCounters,
}

impl Listener {
    /// Bind the socket described by `listener_cfg` and wire it up to the
    /// broker actor's command channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or, for `mqtts`/`wss`,
    /// if the configured TLS certificate/key cannot be loaded.
    pub async fn bind(
        id: ListenerId,
        listener_cfg: &config::Listener,
        broker_sender: Sender<ListenerToBrokerCmd>,
        broker_receiver: Receiver<BrokerToListenerCmd>,
        counters: SharedListenerCounters,
    ) -> Result<Self, Error> {
        let address = listener_cfg.address().to_string();
        let tcp = socket::new_tcp_listener(&address, listener_cfg.bind_device()).await?;
        let socket = match listener_cfg.protocol() {
            config::Protocol::Mqtt => BoundSocket::Mqtt(tcp),
            config::Protocol::Mqtts => {
                BoundSocket::Mqtts(tcp, load_tls_acceptor(listener_cfg)?)
            }
            config::Protocol::Ws => BoundSocket::Ws(tcp),
            config::Protocol::Wss => BoundSocket::Wss(tcp, load_tls_acceptor(listener_cfg)?),
        };

        let (done_sender, done_receiver) = mpsc::channel(constants::CHANNEL_CAPACITY);

        Ok(Self {
            id,
            address,
            maximum_connections: listener_cfg.maximum_connections(),
            socket,
            broker_sender,
            broker_receiver,
            connections: HashMap::new(),
            next_local_conn_id: 0,
            done_sender,
            done_receiver,
            counters,
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.next_local_conn_id += 1;
        (u64::from(self.id) << 32) | u64::from(self.next_local_conn_id)
    }

    pub async fn run_loop(&mut self) -> ! {
        loop {
            tokio::select! {
                accepted = accept(&mut self.socket) => {
                    match accepted {
                        Ok((stream, remote_ip, tls, transparent_upgrade)) => {
                            self.spawn_connection(stream, remote_ip, tls, transparent_upgrade).await;
                        }
                        Err(err) => {
                            log::warn!("listener {}: accept failed: {err}", self.id);
                        }
                    }
                }
                Some(cmd) = self.broker_receiver.recv() => {
                    self.handle_broker_cmd(cmd).await;
                }
                Some(conn_id) = self.done_receiver.recv() => {
                    self.connections.remove(&conn_id);
                }
            }
        }
    }

    async fn spawn_connection(
        &mut self,
        stream: Stream,
        remote_ip: String,
        tls: bool,
        transparent_upgrade: bool,
    ) {
        if self.maximum_connections != 0 && self.connections.len() >= self.maximum_connections {
            log::warn!(
                "listener {}: rejecting connection from {remote_ip}, at capacity ({})",
                self.id,
                self.maximum_connections
            );
            return;
        }

        let conn_id = self.next_conn_id();
        let (write_sender, write_receiver) = mpsc::channel(constants::CHANNEL_CAPACITY);
        self.connections.insert(conn_id, write_sender);

        let listener_id = self.id;
        let broker_sender = self.broker_sender.clone();
        let done_sender = self.done_sender.clone();
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            run_connection(
                stream,
                listener_id,
                conn_id,
                remote_ip,
                tls,
                transparent_upgrade,
                broker_sender,
                write_receiver,
                done_sender,
                counters,
            )
            .await;
        });
    }

    async fn handle_broker_cmd(&mut self, cmd: BrokerToListenerCmd) {
        match cmd {
            BrokerToListenerCmd::Write { conn_id, bytes } => {
                if let Some(sender) = self.connections.get(&conn_id) {
                    if sender.send(ConnCmd::Write(bytes)).await.is_err() {
                        self.connections.remove(&conn_id);
                    }
                }
            }
            BrokerToListenerCmd::Close { conn_id } => {
                if let Some(sender) = self.connections.remove(&conn_id) {
                    let _ = sender.send(ConnCmd::Close).await;
                }
            }
        }
    }
}

async fn accept(socket: &mut BoundSocket) -> Result<(Stream, String, bool, bool), Error> {
    match socket {
        BoundSocket::Mqtt(listener) => {
            let (tcp, addr) = listener.accept().await?;
            let (is_ws, peeked) = sniff_upgrade(tcp).await?;
            let stream = if is_ws {
                Stream::Ws(Box::new(accept_websocket(peeked).await?))
            } else {
                Stream::Mqtt(peeked)
            };
            Ok((stream, addr.ip().to_string(), false, is_ws))
        }
        BoundSocket::Mqtts(listener, acceptor) => {
            let (tcp, addr) = listener.accept().await?;
            let tls_stream = acceptor.accept(tcp).await?;
            let (is_ws, peeked) = sniff_upgrade(tls_stream).await?;
            let stream = if is_ws {
                Stream::Wss(Box::new(accept_websocket(peeked).await?))
            } else {
                Stream::Mqtts(Box::new(peeked))
            };
            Ok((stream, addr.ip().to_string(), true, is_ws))
        }
        BoundSocket::Ws(listener) => {
            let (tcp, addr) = listener.accept().await?;
            let (_is_ws, peeked) = sniff_upgrade(tcp).await?;
            let stream = Stream::Ws(Box::new(accept_websocket(peeked).await?));
            Ok((stream, addr.ip().to_string(), false, false))
        }
        BoundSocket::Wss(listener, acceptor) => {
            let (tcp, addr) = listener.accept().await?;
            let tls_stream = acceptor.accept(tcp).await?;
            let (_is_ws, peeked) = sniff_upgrade(tls_stream).await?;
            let stream = Stream::Wss(Box::new(accept_websocket(peeked).await?));
            Ok((stream, addr.ip().to_string(), true, false))
        }
    }
}

/// Peek the first bytes of a freshly-accepted socket for an HTTP WebSocket
/// upgrade request, without losing them for whichever transport ends up
/// reading the connection.
async fn sniff_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    mut io: S,
) -> Result<(bool, PeekedStream<S>), Error> {
    let mut buf = vec![0u8; UPGRADE_SNIFF_LEN];
    let n = io.read(&mut buf).await?;
    buf.truncate(n);
    let is_ws = contains_websocket_upgrade(&buf);
    Ok((is_ws, PeekedStream::new(buf, io)))
}

fn contains_websocket_upgrade(bytes: &[u8]) -> bool {
    let lower: Vec<u8> = bytes.iter().map(u8::to_ascii_lowercase).collect();
    lower
        .windows(b"upgrade: websocket".len())
        .any(|w| w == b"upgrade: websocket")
}

async fn accept_websocket<S>(
    io: S,
) -> Result<tokio_tungstenite::WebSocketStream<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio_tungstenite::accept_hdr_async(io, negotiate_subprotocol)
        .await
        .map_err(Error::from)
}

fn negotiate_subprotocol(
    request: &tokio_tungstenite::tungstenite::handshake::server::Request,
    mut response: tokio_tungstenite::tungstenite::handshake::server::Response,
) -> Result<
    tokio_tungstenite::tungstenite::handshake::server::Response,
    tokio_tungstenite::tungstenite::handshake::server::ErrorResponse,
> {
    if let Some(requested) = request.headers().get("Sec-WebSocket-Protocol") {
        if let Ok(requested) = requested.to_str() {
            if let Some(matched) = requested
                .split(',')
                .map(str::trim)
                .find(|p| WS_SUBPROTOCOLS.contains(p))
            {
                if let Ok(value) = matched.parse() {
                    response.headers_mut().insert("Sec-WebSocket-Protocol", value);
                }
            }
        }
    }
    Ok(response)
}

fn load_tls_acceptor(listener_cfg: &config::Listener) -> Result<TlsAcceptor, Error> {
    let cert_path = listener_cfg
        .cert_file()
        .ok_or_else(|| Error::new(ErrorKind::Tls, "cert_file is required for TLS listener".to_string()))?;
    let key_path = listener_cfg
        .key_file()
        .ok_or_else(|| Error::new(ErrorKind::Tls, "key_file is required for TLS listener".to_string()))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()
        .map_err(|err| Error::new(ErrorKind::Tls, format!("invalid cert file {cert_path:?}: {err}")))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))
        .map_err(|err| Error::new(ErrorKind::Tls, format!("invalid key file {key_path:?}: {err}")))?
        .ok_or_else(|| Error::new(ErrorKind::Tls, format!("no private key found in {key_path:?}")))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::new(ErrorKind::Tls, format!("invalid tls certificate/key pair: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    mut stream: Stream,
    listener_id: ListenerId,
    conn_id: ConnId,
    remote_ip: String,
    tls: bool,
    transparent_upgrade: bool,
    broker_sender: Sender<ListenerToBrokerCmd>,
    mut write_receiver: Receiver<ConnCmd>,
    done_sender: Sender<ConnId>,
    counters: SharedListenerCounters,
) {
    if broker_sender
        .send(ListenerToBrokerCmd::IncomingConnection {
            listener_id,
            conn_id,
            remote_ip,
            tls,
        })
        .await
        .is_err()
    {
        return;
    }
    if transparent_upgrade
        && broker_sender
            .send(ListenerToBrokerCmd::WillUpgraded { listener_id, conn_id })
            .await
            .is_err()
    {
        return;
    }

    let mut read_buf = Vec::with_capacity(4096);
    loop {
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        bump_received(&counters, listener_id, n);
                        let bytes = std::mem::take(&mut read_buf);
                        if broker_sender
                            .send(ListenerToBrokerCmd::Data { listener_id, conn_id, bytes })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        log::debug!("connection {conn_id} on listener {listener_id}: read error: {err}");
                        break;
                    }
                }
            }
            cmd = write_receiver.recv() => {
                match cmd {
                    Some(ConnCmd::Write(bytes)) => {
                        let len = bytes.len();
                        if let Err(err) = stream.write(&bytes).await {
                            log::debug!("connection {conn_id} on listener {listener_id}: write error: {err}");
                            break;
                        }
                        bump_sent(&counters, listener_id, len);
                    }
                    Some(ConnCmd::Close) | None => break,
                }
            }
        }
    }

    let _ = broker_sender
        .send(ListenerToBrokerCmd::CloseConnection { listener_id, conn_id })
        .await;
    let _ = done_sender.send(conn_id).await;
}

fn bump_received(counters: &SharedListenerCounters, listener_id: ListenerId, n: usize) {
    if let Ok(mut guard) = counters.lock() {
        #[allow(clippy::cast_possible_truncation)]
        let n = n as u64;
        guard.entry(listener_id).or_default().bytes_received += n;
    }
}

fn bump_sent(counters: &SharedListenerCounters, listener_id: ListenerId, n: usize) {
    if let Ok(mut guard) = counters.lock() {
        #[allow(clippy::cast_possible_truncation)]
        let n = n as u64;
        guard.entry(listener_id).or_default().bytes_sent += n;
    }
}
