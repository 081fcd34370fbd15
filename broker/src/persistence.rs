// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! File-backed persistence for session, retained and shared-subscription
//! state.
//!
//! Persistence failures are swallowed and logged at the call site; the
//! in-memory broker state is authoritative for the lifetime of the
//! process. This backend exists purely so a restarted broker can recover
//! sessions, not to provide durability guarantees stronger than the
//! underlying filesystem.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use codec::QoS;

use crate::error::{Error, ErrorKind};
use crate::session::{PendingPublish, Will};
use crate::topic_trie::SubscribeOptions;

/// Abstract key-value store, one instance per named store.
pub trait PersistenceApi {
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the underlying store
    /// cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// # Errors
    ///
    /// Returns an error if the key is invalid or the value cannot be
    /// written.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    fn delete(&self, key: &str) -> Result<(), Error>;

    /// # Errors
    ///
    /// Returns an error if the store's directory cannot be listed.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// One named subdirectory of hex-encoded files under a persistence root.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Open (creating if necessary) the named store under `root`, e.g.
    /// `root/sessions` or `root/pending/<clientId>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path, store: &str) -> Result<Self, Error> {
        let dir = root.join(store);
        fs::create_dir_all(&dir)
            .map_err(|err| Error::new(ErrorKind::Persistence, format!("create {dir:?}: {err}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        if key.contains('+') || key.contains('#') {
            return Err(Error::new(
                ErrorKind::Persistence,
                format!("key {key:?} must not contain wildcard characters"),
            ));
        }
        let escaped = key.replace('/', "_SLASH_").replace(':', "_COLON_");
        Ok(self.dir.join(format!("{escaped}.hex")))
    }
}

impl PersistenceApi for FilePersistence {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(hex) => Ok(Some(hex_decode(hex.trim())?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::new(ErrorKind::Persistence, format!("read {path:?}: {err}"))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let path = self.path_for(key)?;
        fs::write(&path, hex_encode(value))
            .map_err(|err| Error::new(ErrorKind::Persistence, format!("write {path:?}: {err}")))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(ErrorKind::Persistence, format!("delete {path:?}: {err}"))),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| Error::new(ErrorKind::Persistence, format!("list {:?}: {err}", self.dir)))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::new(ErrorKind::Persistence, err.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".hex") else { continue };
            let key = stem.replace("_SLASH_", "/").replace("_COLON_", ":");
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        Ok(out)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, Error> {
    if hex.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::Persistence, "odd-length hex data"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|err| Error::new(ErrorKind::Persistence, format!("invalid hex: {err}")))
        })
        .collect()
}

/// Opens the four named stores the broker needs, rooted at `root`.
#[derive(Debug, Clone)]
pub struct PersistenceStores {
    pub sessions: FilePersistence,
    pub retained: FilePersistence,
    pub shared_subscriptions: FilePersistence,
    root: PathBuf,
}

impl PersistenceStores {
    /// # Errors
    ///
    /// Returns an error if any of the fixed store directories cannot be
    /// created.
    pub fn open(root: &Path) -> Result<Self, Error> {
        Ok(Self {
            sessions: FilePersistence::open(root, "sessions")?,
            retained: FilePersistence::open(root, "retained")?,
            shared_subscriptions: FilePersistence::open(root, "sharedSubscriptions")?,
            root: root.to_path_buf(),
        })
    }

    /// Opens (creating if necessary) the per-client pending-message store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn pending_for(&self, client_id: &str) -> Result<FilePersistence, Error> {
        FilePersistence::open(&self.root, &format!("pending/{client_id}"))
    }
}

/// Non-clean session state worth surviving a restart: enough to rebuild an
/// offline [`crate::session::Session`] and re-seed the subscription router.
pub struct PersistedSession {
    pub session_expiry_interval: u32,
    pub will: Option<Will>,
    pub subscriptions: Vec<(String, SubscribeOptions)>,
}

/// Encode a [`PersistedSession`] record for `PersistenceStores::sessions`.
#[must_use]
pub fn encode_session(session: &PersistedSession) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&session.session_expiry_interval.to_be_bytes());
    match &session.will {
        Some(will) => {
            buf.push(1);
            buf.push(will.qos as u8);
            buf.push(u8::from(will.retain));
            buf.extend_from_slice(&will.delay_interval.to_be_bytes());
            push_bytes(&mut buf, will.topic.as_bytes());
            push_bytes(&mut buf, &will.payload);
        }
        None => buf.push(0),
    }
    #[allow(clippy::cast_possible_truncation)]
    let count = session.subscriptions.len() as u16;
    buf.extend_from_slice(&count.to_be_bytes());
    for (filter, options) in &session.subscriptions {
        push_bytes(&mut buf, filter.as_bytes());
        buf.push(options.to_byte());
    }
    buf
}

/// Inverse of [`encode_session`]. Returns `None` on malformed bytes.
#[must_use]
pub fn decode_session(bytes: &[u8]) -> Option<PersistedSession> {
    let mut cursor = Cursor::new(bytes);
    let session_expiry_interval = cursor.read_u32()?;
    let has_will = cursor.read_u8()?;
    let will = if has_will == 1 {
        let qos = qos_from_byte(cursor.read_u8()?)?;
        let retain = cursor.read_u8()? != 0;
        let delay_interval = cursor.read_u32()?;
        let topic = String::from_utf8(cursor.read_bytes()?.to_vec()).ok()?;
        let payload = cursor.read_bytes()?.to_vec();
        Some(Will { topic, payload, qos, retain, delay_interval })
    } else {
        None
    };
    let count = cursor.read_u16()?;
    let mut subscriptions = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let filter = String::from_utf8(cursor.read_bytes()?.to_vec()).ok()?;
        let options = SubscribeOptions::from_byte(cursor.read_u8()?)?;
        subscriptions.push((filter, options));
    }
    Some(PersistedSession { session_expiry_interval, will, subscriptions })
}

/// Encode one queued [`PendingPublish`] for `PersistenceStores::pending_for`.
#[must_use]
pub fn encode_pending(unit: &PendingPublish) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(unit.qos as u8);
    buf.push(u8::from(unit.retain));
    push_bytes(&mut buf, unit.topic.as_bytes());
    push_bytes(&mut buf, &unit.payload);
    buf
}

/// Inverse of [`encode_pending`]. Returns `None` on malformed bytes.
#[must_use]
pub fn decode_pending(bytes: &[u8]) -> Option<PendingPublish> {
    let mut cursor = Cursor::new(bytes);
    let qos = qos_from_byte(cursor.read_u8()?)?;
    let retain = cursor.read_u8()? != 0;
    let topic = String::from_utf8(cursor.read_bytes()?.to_vec()).ok()?;
    let payload = cursor.read_bytes()?.to_vec();
    Some(PendingPublish::new(topic, payload, qos, retain))
}

/// Encode the subset of `subscriptions` whose filter carries the
/// `$share/` prefix, for `PersistenceStores::shared_subscriptions`: a fast
/// secondary index of shared-group membership, kept alongside (but
/// derivable from) the full per-client record in `sessions`.
#[must_use]
pub fn encode_shared_filters(subscriptions: &[(String, SubscribeOptions)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let shared: Vec<&str> = subscriptions
        .iter()
        .map(|(filter, _)| filter.as_str())
        .filter(|f| f.starts_with("$share/"))
        .collect();
    #[allow(clippy::cast_possible_truncation)]
    let count = shared.len() as u16;
    buf.extend_from_slice(&count.to_be_bytes());
    for filter in shared {
        push_bytes(&mut buf, filter.as_bytes());
    }
    buf
}

/// Inverse of [`encode_shared_filters`]. Returns `None` on malformed bytes.
#[must_use]
pub fn decode_shared_filters(bytes: &[u8]) -> Option<Vec<String>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u16()?;
    let mut out = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        out.push(String::from_utf8(cursor.read_bytes()?.to_vec()).ok()?);
    }
    Some(out)
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    let len = bytes.len() as u32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn qos_from_byte(byte: u8) -> Option<QoS> {
    match byte {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactOnce),
        _ => None,
    }
}

/// Minimal forward-only byte cursor for the fixed-field records above.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let slice = self.bytes.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes(slice.try_into().ok()?))
    }

    fn read_u32(&mut self) -> Option<u32> {
        let slice = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(slice.try_into().ok()?))
    }

    fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u32()? as usize;
        let slice = self.bytes.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }
}

/// Queued units for one client, in delivery order, used when reloading a
/// persisted session at startup.
#[must_use]
pub fn decode_pending_queue(records: Vec<Vec<u8>>) -> VecDeque<PendingPublish> {
    records.into_iter().filter_map(|bytes| decode_pending(&bytes)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("hebo-persistence-test-{}-{}", std::process::id(), rand_suffix()));
        p
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    #[test]
    fn test_put_get_roundtrip() {
        let root = temp_root();
        let store = FilePersistence::open(&root, "sessions").unwrap();
        store.put("client-1", b"hello").unwrap();
        assert_eq!(store.get("client-1").unwrap(), Some(b"hello".to_vec()));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_missing_key_returns_none() {
        let root = temp_root();
        let store = FilePersistence::open(&root, "sessions").unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_wildcard_keys_rejected() {
        let root = temp_root();
        let store = FilePersistence::open(&root, "sessions").unwrap();
        assert!(store.put("a/+/b", b"x").is_err());
        assert!(store.put("a/#", b"x").is_err());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_keys_with_prefix_and_escaping() {
        let root = temp_root();
        let store = FilePersistence::open(&root, "retained").unwrap();
        store.put("a/b:c", b"x").unwrap();
        store.put("a/d", b"y").unwrap();
        let mut keys = store.keys_with_prefix("a/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a/b:c".to_string(), "a/d".to_string()]);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_delete_is_idempotent() {
        let root = temp_root();
        let store = FilePersistence::open(&root, "sessions").unwrap();
        store.put("c1", b"x").unwrap();
        store.delete("c1").unwrap();
        store.delete("c1").unwrap();
        assert_eq!(store.get("c1").unwrap(), None);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_pending_for_creates_per_client_store() {
        let root = temp_root();
        let stores = PersistenceStores::open(&root).unwrap();
        let pending = stores.pending_for("client-42").unwrap();
        pending.put("1", b"payload").unwrap();
        assert_eq!(pending.get("1").unwrap(), Some(b"payload".to_vec()));
        fs::remove_dir_all(&root).ok();
    }
}
