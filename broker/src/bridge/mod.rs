// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Owns every configured bridge connection, routing between the broker's
//! single aggregated bridge channel pair and one [`connection::run`] task
//! per [`crate::config::BridgeConnection`].

mod connection;
mod handshake;

use std::collections::HashMap;

use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::commands::{BridgeToBrokerCmd, BrokerToBridgeCmd};
use crate::config::Bridge;
use crate::constants::CHANNEL_CAPACITY;

#[allow(clippy::module_name_repetitions)]
pub struct BridgeApp {
    broker_receiver: Receiver<BrokerToBridgeCmd>,
    connections: HashMap<String, Sender<BrokerToBridgeCmd>>,
}

impl BridgeApp {
    /// Spawn one [`connection::run`] task per configured bridge connection,
    /// each with its own command channel keyed by connection name.
    #[must_use]
    pub fn new(
        cfg: Bridge,
        broker_sender: Sender<BridgeToBrokerCmd>,
        broker_receiver: Receiver<BrokerToBridgeCmd>,
    ) -> Self {
        let mut connections = HashMap::new();
        for conn_cfg in cfg.connections() {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            connections.insert(conn_cfg.name().to_string(), tx);
            let conn_cfg = conn_cfg.clone();
            let broker_sender = broker_sender.clone();
            tokio::spawn(async move {
                connection::run(conn_cfg, broker_sender, rx).await;
            });
        }
        Self {
            broker_receiver,
            connections,
        }
    }

    /// Route every [`BrokerToBridgeCmd`] to the connection task it names,
    /// for as long as the broker keeps sending them.
    pub async fn run_loop(&mut self) -> ! {
        loop {
            match self.broker_receiver.recv().await {
                Some(cmd) => self.dispatch(cmd).await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn dispatch(&mut self, cmd: BrokerToBridgeCmd) {
        let BrokerToBridgeCmd::Publish { ref name, .. } = cmd;
        let name = name.clone();
        let Some(sender) = self.connections.get(&name) else {
            log::warn!("bridge: no such connection {name:?}, dropping forwarded publish");
            return;
        };
        if sender.send(cmd).await.is_err() {
            log::warn!("bridge: connection {name:?} task gone, dropping forwarded publish");
        }
    }
}
