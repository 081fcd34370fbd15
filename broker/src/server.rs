// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Process entry point: load config, wire up every actor and block on the
//! broker's run loop.
//!
//! Startup order mirrors the actors' dependency on each other: config is
//! parsed and validated first, then logging, then persistence, then the
//! listeners (each binds its socket immediately so a failure is reported
//! before the broker starts accepting commands), then the bridge
//! controller, and finally the broker itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::mpsc;

use crate::bridge::BridgeApp;
use crate::broker::{Broker, ListenerHandle};
use crate::config::Config;
use crate::constants::{CHANNEL_CAPACITY, DEFAULT_CONFIG};
use crate::error::{Error, ErrorKind};
use crate::listener::Listener;
use crate::log as broker_log;
use crate::persistence::PersistenceStores;

#[derive(Debug, Parser)]
#[command(name = "hebo", about = "A lightweight, high performance MQTT broker")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Parse and validate the config, binding every listener address, then exit.
    #[arg(short, long)]
    test_config: bool,
}

fn load_config(path: &PathBuf) -> Result<Config, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::new(ErrorKind::Config, format!("read {}: {err}", path.display())))?;
    toml::from_str(&content).map_err(Error::from)
}

/// Parse CLI arguments, load and validate config, then run every actor to
/// completion (which, barring a fatal startup error, is never).
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or validated, if logging
/// cannot be initialized, if persistence cannot be opened, or if a listener
/// fails to bind.
pub async fn run_server() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    // `--test-config` actually attempts to bind every listener address, the
    // way `nginx -t` does; a normal run only resolves them here; the real
    // bind happens moments later in `Listener::bind` with an authoritative
    // error if it fails.
    config.validate(cli.test_config)?;

    if cli.test_config {
        println!("config file {} is valid", cli.config.display());
        return Ok(());
    }

    broker_log::init_log(config.log())?;
    log::info!("hebo starting, config: {}", cli.config.display());

    let persistence = if config.storage().persistence() {
        Some(PersistenceStores::open(config.storage().root_path())?)
    } else {
        None
    };

    let listener_counters = Arc::new(Mutex::new(HashMap::new()));
    let (broker_sender, broker_receiver) = mpsc::channel(CHANNEL_CAPACITY);

    let mut listeners = HashMap::new();
    for (index, listener_cfg) in config.listeners().iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let listener_id = index as u32;
        let (to_listener_tx, to_listener_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut listener = Listener::bind(
            listener_id,
            listener_cfg,
            broker_sender.clone(),
            to_listener_rx,
            Arc::clone(&listener_counters),
        )
        .await?;
        listeners.insert(
            listener_id,
            ListenerHandle {
                sender: to_listener_tx,
                config: listener_cfg.clone(),
            },
        );
        tokio::spawn(async move {
            listener.run_loop().await;
        });
    }

    let (bridge_sender, bridge_receiver) = if config.bridge().connections().is_empty() {
        (None, None)
    } else {
        let (broker_to_bridge_tx, broker_to_bridge_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (bridge_to_broker_tx, bridge_to_broker_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut bridge_app = BridgeApp::new(config.bridge().clone(), bridge_to_broker_tx, broker_to_bridge_rx);
        tokio::spawn(async move {
            bridge_app.run_loop().await;
        });
        (Some(broker_to_bridge_tx), Some(bridge_to_broker_rx))
    };

    let mut broker = Broker::new(
        config,
        listeners,
        broker_receiver,
        bridge_sender,
        bridge_receiver,
        listener_counters,
        persistence,
    )?;

    broker.run_loop().await
}
