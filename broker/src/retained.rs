// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Flat topic-name to last-retained-message map.
//!
//! Retained messages are addressed by concrete topic name, not filter, so a
//! plain `HashMap` suffices for storage; matching against a subscriber's
//! filter on SUBSCRIBE reuses the same wildcard rules as
//! [`crate::topic_trie::TopicTrie`] but walks this map's keys directly
//! since there are normally far fewer retained topics than live
//! subscriptions.

use std::collections::HashMap;

use codec::QoS;

/// A retained PUBLISH, stripped of anything the framer/codec already owns
/// (packet id, dup flag) and kept in message order.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    /// MQTT 5 user properties and friends, carried opaquely.
    pub properties: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    topics: HashMap<String, RetainedMessage>,
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Apply a retained PUBLISH: an empty payload removes any existing
    /// retained message for that topic, otherwise it replaces it.
    pub fn apply(&mut self, message: RetainedMessage) {
        if message.payload.is_empty() {
            self.topics.remove(&message.topic);
        } else {
            self.topics.insert(message.topic.clone(), message);
        }
    }

    /// All retained messages whose topic name matches subscription `filter`.
    #[must_use]
    pub fn matching(&self, filter: &str) -> Vec<&RetainedMessage> {
        self.topics
            .values()
            .filter(|m| topic_matches_filter(&m.topic, filter))
            .collect()
    }
}

/// Whether concrete `topic` matches subscription `filter`, per MQTT's
/// `+`/`#` wildcard rules with the `$`-prefix exclusion for root-level
/// wildcards.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_segs: Vec<&str> = topic.split('/').collect();
    let filter_segs: Vec<&str> = filter.split('/').collect();
    matches_segs(&topic_segs, &filter_segs, true)
}

fn matches_segs(topic: &[&str], filter: &[&str], at_root: bool) -> bool {
    match (topic.first(), filter.first()) {
        (None, None) => true,
        (None, Some(seg)) => *seg == "#" && filter.len() == 1,
        (Some(_), None) => false,
        (Some(t), Some(&"#")) => {
            if at_root && t.starts_with('$') {
                false
            } else {
                filter.len() == 1
            }
        }
        (Some(t), Some(&"+")) => {
            if at_root && t.starts_with('$') {
                false
            } else {
                matches_segs(&topic[1..], &filter[1..], false)
            }
        }
        (Some(t), Some(seg)) => *t == *seg && matches_segs(&topic[1..], &filter[1..], false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, payload: &[u8]) -> RetainedMessage {
        RetainedMessage {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            payload: payload.to_vec(),
            properties: Vec::new(),
        }
    }

    #[test]
    fn test_apply_replaces_existing() {
        let mut store = RetainedStore::new();
        store.apply(msg("a/b", b"v1"));
        store.apply(msg("a/b", b"v2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.matching("a/b")[0].payload, b"v2");
    }

    #[test]
    fn test_empty_payload_clears_retained() {
        let mut store = RetainedStore::new();
        store.apply(msg("a/b", b"v1"));
        store.apply(msg("a/b", b""));
        assert!(store.is_empty());
    }

    #[test]
    fn test_matching_honours_wildcards() {
        let mut store = RetainedStore::new();
        store.apply(msg("a/b/c", b"v"));
        store.apply(msg("a/x/c", b"v"));
        assert_eq!(store.matching("a/+/c").len(), 2);
        assert_eq!(store.matching("a/#").len(), 2);
    }

    #[test]
    fn test_dollar_topics_excluded_from_root_wildcards() {
        let mut store = RetainedStore::new();
        store.apply(msg("$SYS/uptime", b"v"));
        assert!(store.matching("#").is_empty());
        assert!(store.matching("+/uptime").is_empty());
        assert_eq!(store.matching("$SYS/uptime").len(), 1);
        assert_eq!(store.matching("$SYS/#").len(), 1);
    }
}
