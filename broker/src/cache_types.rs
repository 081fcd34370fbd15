// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Statistics counters backing the `$SYS/...` tree.
//!
//! Global mutable state is absent by design: a [`Statistics`] value is
//! owned directly by the broker actor. The one exception is per-listener
//! byte counts, touched from both the listener's read/write loop and the
//! broker's tick — those live behind a short-lived [`std::sync::Mutex`]
//! rather than flowing through a command channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::types::ListenerId;

const WINDOW_SECS: usize = 900;

/// A counter with 60s/300s/900s moving averages, derived from one
/// per-second delta sample recorded at each tick.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    total: u64,
    pending: u64,
    deltas: VecDeque<u64>,
}

impl Counter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.pending += n;
    }

    /// Roll the last second's accumulation into the moving-average window.
    pub fn tick(&mut self) {
        self.deltas.push_back(self.pending);
        self.pending = 0;
        while self.deltas.len() > WINDOW_SECS {
            self.deltas.pop_front();
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Mean per-second rate over the trailing `secs` seconds (or however
    /// many samples have been recorded so far, if fewer).
    #[must_use]
    pub fn average(&self, secs: usize) -> f64 {
        let n = secs.min(self.deltas.len());
        if n == 0 {
            return 0.0;
        }
        let sum: u64 = self.deltas.iter().rev().take(n).sum();
        #[allow(clippy::cast_precision_loss)]
        let avg = sum as f64 / n as f64;
        avg
    }
}

/// Per-listener counters, the one piece of state touched from outside the
/// broker actor (the listener's own read/write loop).
#[derive(Debug, Default)]
pub struct ListenerCounters {
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

pub type SharedListenerCounters = Arc<Mutex<HashMap<ListenerId, ListenerCounters>>>;

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub address: String,
    pub bytes_received: Counter,
    pub bytes_sent: Counter,
}

/// All broker-wide `$SYS` counters, owned by the broker actor.
#[derive(Debug)]
pub struct Statistics {
    start_time: Instant,

    pub clients_total: u64,
    pub clients_maximum: u64,
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub clients_expired: u64,

    pub subscriptions_count: u64,
    pub subscriptions_shared_count: u64,

    pub retained_messages: u64,

    pub messages_received: Counter,
    pub messages_sent: Counter,
    pub messages_dropped: Counter,

    pub publish_messages_received: Counter,
    pub publish_messages_sent: Counter,
    pub publish_messages_dropped: Counter,

    pub listeners: HashMap<ListenerId, ListenerStats>,
    listener_counters: SharedListenerCounters,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            clients_total: 0,
            clients_maximum: 0,
            clients_connected: 0,
            clients_disconnected: 0,
            clients_expired: 0,
            subscriptions_count: 0,
            subscriptions_shared_count: 0,
            retained_messages: 0,
            messages_received: Counter::new(),
            messages_sent: Counter::new(),
            messages_dropped: Counter::new(),
            publish_messages_received: Counter::new(),
            publish_messages_sent: Counter::new(),
            publish_messages_dropped: Counter::new(),
            listeners: HashMap::new(),
            listener_counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a [`Statistics`] backed by a counters handle the caller
    /// already shares with the listener tasks, rather than a fresh one
    /// nothing ever reads.
    #[must_use]
    pub fn with_listener_counters(listener_counters: SharedListenerCounters) -> Self {
        Self {
            listener_counters,
            ..Self::new()
        }
    }

    /// Handle shared with listener tasks so they can bump byte counts
    /// without going through a command channel.
    #[must_use]
    pub fn listener_counters_handle(&self) -> SharedListenerCounters {
        Arc::clone(&self.listener_counters)
    }

    pub fn register_listener(&mut self, id: ListenerId, address: String) {
        self.listeners.insert(
            id,
            ListenerStats {
                address,
                bytes_received: Counter::new(),
                bytes_sent: Counter::new(),
            },
        );
        self.listener_counters
            .lock()
            .expect("listener counters mutex poisoned")
            .entry(id)
            .or_default();
    }

    /// Roll one second's worth of activity into every moving-average
    /// window; called once per tick from the broker's one-second timer.
    pub fn tick(&mut self) {
        self.messages_received.tick();
        self.messages_sent.tick();
        self.messages_dropped.tick();
        self.publish_messages_received.tick();
        self.publish_messages_sent.tick();
        self.publish_messages_dropped.tick();

        let mut guard = self
            .listener_counters
            .lock()
            .expect("listener counters mutex poisoned");
        for (id, stats) in &mut self.listeners {
            if let Some(counters) = guard.get_mut(id) {
                stats.bytes_received.add(counters.bytes_received);
                stats.bytes_sent.add(counters.bytes_sent);
                counters.bytes_received = 0;
                counters.bytes_sent = 0;
            }
            stats.bytes_received.tick();
            stats.bytes_sent.tick();
        }
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render uptime as `[<d>d ][Nh ][Nm ][Ns]`, dropping leading
    /// zero-valued units.
    #[must_use]
    pub fn uptime_string(&self) -> String {
        format_uptime(self.uptime_secs())
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn format_uptime(total_secs: u64) -> String {
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{secs}s"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_moving_average() {
        let mut c = Counter::new();
        for _ in 0..10 {
            c.add(5);
            c.tick();
        }
        assert_eq!(c.total(), 50);
        assert!((c.average(10) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3665), "1h 1m 5s");
        assert_eq!(format_uptime(90065), "1d 1h 1m 5s");
    }
}
