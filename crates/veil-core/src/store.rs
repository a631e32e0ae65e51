//! Bounded store-and-forward message store.
//!
//! Every peer runs one of these to hold encrypted messages for offline
//! recipients. The store is bounded: capacity is fixed at startup to 1 %
//! of the free disk space, clamped to [1 MiB, 1 GiB]. Near capacity the
//! globally oldest message is evicted first; messages also expire 24
//! hours after their timestamp.
//!
//! Persistence is an append-only log of store/delete frames
//! (`[len:4][bincode]`), compacted when deletions accumulate. On open the
//! log is replayed, expired entries dropped, and the index rebuilt.

use crate::error::{Error, Result};
use crate::message::AsyncMessage;
use crate::util::unix_ms;
use crate::{MessageId, PeerKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Smallest permitted capacity.
pub const MIN_CAPACITY: u64 = 1024 * 1024;

/// Largest permitted capacity.
pub const MAX_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Share of free disk space claimed at startup (one percent).
const DISK_SHARE_DIVISOR: u64 = 100;

/// Capacity assumed when the free-space probe is unavailable.
const FALLBACK_CAPACITY: u64 = 256 * 1024 * 1024;

/// Deletions tolerated in the log before it is rewritten.
const COMPACT_THRESHOLD: u64 = 1024;

/// Storage counters exposed to the embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    /// Messages currently held
    pub total_messages: usize,
    /// Distinct recipients with at least one message
    pub unique_recipients: usize,
    /// Serialized bytes currently held
    pub bytes_used: u64,
    /// Fixed capacity in bytes
    pub capacity: u64,
    /// Messages evicted to make room since startup
    pub evicted_total: u64,
    /// Messages dropped by expiration sweeps since startup
    pub expired_total: u64,
}

#[derive(Serialize, Deserialize)]
enum LogRecord {
    Store(AsyncMessage),
    Delete { id: MessageId, recipient: PeerKey },
}

struct Entry {
    message: AsyncMessage,
    size: u64,
    seq: u64,
}

/// Bounded per-node message storage.
pub struct MessageStore {
    entries: HashMap<MessageId, Entry>,
    by_recipient: HashMap<PeerKey, Vec<MessageId>>,
    order: BTreeMap<u64, MessageId>,
    next_seq: u64,
    bytes_used: u64,
    capacity: u64,
    evicted_total: u64,
    expired_total: u64,
    log: Option<File>,
    log_path: Option<PathBuf>,
    deletes_since_compact: u64,
}

impl MessageStore {
    /// Derive the fixed capacity from the disk holding `path`.
    #[must_use]
    pub fn capacity_for(path: &Path) -> u64 {
        let free = disk_free_bytes(path).unwrap_or(FALLBACK_CAPACITY * DISK_SHARE_DIVISOR);
        (free / DISK_SHARE_DIVISOR).clamp(MIN_CAPACITY, MAX_CAPACITY)
    }

    /// Open a durable store backed by the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the log cannot be opened or rewritten.
    pub fn open(path: &Path, capacity: u64) -> Result<Self> {
        let mut store = Self::in_memory(capacity);
        store.log_path = Some(path.to_path_buf());

        if path.exists() {
            store.replay_log(path);
            // Rewrite so expired and deleted entries do not accumulate.
            store.compact()?;
        } else {
            store.log = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(Error::from)?,
            );
        }
        Ok(store)
    }

    /// An ephemeral store with no persistence, for serving and tests.
    #[must_use]
    pub fn in_memory(capacity: u64) -> Self {
        Self {
            entries: HashMap::new(),
            by_recipient: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            bytes_used: 0,
            capacity: capacity.clamp(MIN_CAPACITY, MAX_CAPACITY),
            evicted_total: 0,
            expired_total: 0,
            log: None,
            log_path: None,
            deletes_since_compact: 0,
        }
    }

    fn replay_log(&mut self, path: &Path) {
        let Ok(mut file) = File::open(path) else {
            return;
        };
        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).is_err() {
            tracing::warn!("async store log unreadable, starting empty");
            return;
        }

        let now = unix_ms();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
                as usize;
            pos += 4;
            if pos + len > buf.len() {
                tracing::warn!("async store log truncated, dropping tail");
                break;
            }
            match bincode::deserialize::<LogRecord>(&buf[pos..pos + len]) {
                Ok(LogRecord::Store(message)) => {
                    if !message.is_expired(now) {
                        let _ = self.insert(message, false);
                    }
                }
                Ok(LogRecord::Delete { id, recipient }) => {
                    let _ = self.remove(&id, &recipient, false);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bad record in async store log, dropping tail");
                    break;
                }
            }
            pos += len;
        }
    }

    fn append_log(&mut self, record: &LogRecord) -> Result<()> {
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };
        let bytes = bincode::serialize(record)
            .map_err(|e| Error::new(crate::ErrorKind::Io, e.to_string()))?;
        log.write_all(&(bytes.len() as u32).to_be_bytes())?;
        log.write_all(&bytes)?;
        log.flush()?;
        Ok(())
    }

    /// Rewrite the log from live entries.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the replacement file cannot be written.
    pub fn compact(&mut self) -> Result<()> {
        let Some(path) = self.log_path.clone() else {
            return Ok(());
        };

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            let mut ordered: Vec<&Entry> = self.entries.values().collect();
            ordered.sort_by_key(|e| e.seq);
            for entry in ordered {
                let bytes = bincode::serialize(&LogRecord::Store(entry.message.clone()))
                    .map_err(|e| Error::new(crate::ErrorKind::Io, e.to_string()))?;
                file.write_all(&(bytes.len() as u32).to_be_bytes())?;
                file.write_all(&bytes)?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        self.log = Some(OpenOptions::new().append(true).open(&path)?);
        self.deletes_since_compact = 0;
        Ok(())
    }

    fn insert(&mut self, message: AsyncMessage, log: bool) -> Result<bool> {
        if self.entries.contains_key(&message.id) {
            return Ok(false);
        }

        let size = message.encoded_len() as u64;
        if size > self.capacity {
            return Err(Error::capacity_exceeded());
        }

        while self.bytes_used + size > self.capacity {
            let Some((_, &oldest_id)) = self.order.iter().next() else {
                return Err(Error::capacity_exceeded());
            };
            let recipient = self
                .entries
                .get(&oldest_id)
                .map(|e| e.message.recipient)
                .expect("ordered id has an entry");
            tracing::debug!(
                id = %hex::encode(oldest_id),
                "evicting oldest message for capacity"
            );
            self.remove(&oldest_id, &recipient, log)?;
            self.evicted_total += 1;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        if log {
            self.append_log(&LogRecord::Store(message.clone()))?;
        }

        self.by_recipient
            .entry(message.recipient)
            .or_default()
            .push(message.id);
        self.order.insert(seq, message.id);
        self.bytes_used += size;
        self.entries.insert(message.id, Entry { message, size, seq });
        Ok(true)
    }

    fn remove(&mut self, id: &MessageId, recipient: &PeerKey, log: bool) -> Result<bool> {
        let Some(entry) = self.entries.get(id) else {
            return Ok(false);
        };
        if &entry.message.recipient != recipient {
            return Err(Error::invalid_argument("recipient mismatch on delete"));
        }

        let entry = self.entries.remove(id).expect("checked above");
        self.order.remove(&entry.seq);
        self.bytes_used -= entry.size;
        if let Some(ids) = self.by_recipient.get_mut(recipient) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_recipient.remove(recipient);
            }
        }

        if log {
            self.append_log(&LogRecord::Delete {
                id: *id,
                recipient: *recipient,
            })?;
            self.deletes_since_compact += 1;
            if self.deletes_since_compact >= COMPACT_THRESHOLD {
                self.compact()?;
            }
        }
        Ok(true)
    }

    /// Store a message, evicting the oldest entries if needed.
    ///
    /// Idempotent on message ID: a duplicate store is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when the message cannot fit even after
    /// eviction, `Io` on log failure.
    pub fn store(&mut self, message: AsyncMessage) -> Result<MessageId> {
        let id = message.id;
        self.insert(message, true)?;
        Ok(id)
    }

    /// Messages held for `recipient`, oldest first, up to `batch`.
    #[must_use]
    pub fn retrieve(&self, recipient: &PeerKey, batch: usize) -> Vec<AsyncMessage> {
        let Some(ids) = self.by_recipient.get(recipient) else {
            return Vec::new();
        };
        let mut messages: Vec<&Entry> = ids
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect();
        messages.sort_by_key(|e| e.seq);
        messages
            .into_iter()
            .take(batch)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Delete a message, verifying the recipient key matches.
    ///
    /// Idempotent: deleting an absent ID returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the recipient does not match the
    /// stored message (third-party deletion attempt), `Io` on log failure.
    pub fn delete(&mut self, id: &MessageId, recipient: &PeerKey) -> Result<bool> {
        self.remove(id, recipient, true)
    }

    /// Drop every message older than 24 hours. Returns the count removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = unix_ms();
        let expired: Vec<(MessageId, PeerKey)> = self
            .entries
            .values()
            .filter(|e| e.message.is_expired(now))
            .map(|e| (e.message.id, e.message.recipient))
            .collect();

        let count = expired.len();
        for (id, recipient) in expired {
            if let Err(e) = self.remove(&id, &recipient, true) {
                tracing::warn!(error = %e, "failed to drop expired message");
            }
        }
        self.expired_total += count as u64;
        if count > 0 {
            tracing::debug!(count, "expired messages removed");
        }
        count
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            total_messages: self.entries.len(),
            unique_recipients: self.by_recipient.len(),
            bytes_used: self.bytes_used,
            capacity: self.capacity,
            evicted_total: self.evicted_total,
            expired_total: self.expired_total,
        }
    }

    /// Whether a message with this ID is currently held.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("messages", &self.entries.len())
            .field("bytes_used", &self.bytes_used)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn disk_free_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let probe = if path.is_dir() {
        path
    } else {
        path.parent().filter(|p| !p.as_os_str().is_empty())?
    };
    let cpath = std::ffi::CString::new(probe.as_os_str().as_bytes()).ok()?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn disk_free_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn message(id_byte: u8, recipient_byte: u8, payload_len: usize) -> AsyncMessage {
        AsyncMessage {
            id: [id_byte; 16],
            recipient: [recipient_byte; 32],
            sender: [9u8; 32],
            ephemeral: [8u8; 32],
            pre_key_id: u32::from(id_byte),
            nonce: [7u8; 24],
            timestamp_ms: unix_ms(),
            message_type: MessageType::Normal,
            ciphertext: vec![0xAB; payload_len],
        }
    }

    #[test]
    fn test_store_and_retrieve() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let msg = message(1, 2, 64);
        let id = store.store(msg.clone()).unwrap();
        assert_eq!(id, msg.id);

        let got = store.retrieve(&msg.recipient, 100);
        assert_eq!(got, vec![msg]);
    }

    #[test]
    fn test_duplicate_store_is_idempotent() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let msg = message(1, 2, 64);
        store.store(msg.clone()).unwrap();
        store.store(msg.clone()).unwrap();

        assert_eq!(store.stats().total_messages, 1);
    }

    #[test]
    fn test_retrieve_batch_limit() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        for i in 0..10 {
            store.store(message(i, 2, 16)).unwrap();
        }
        assert_eq!(store.retrieve(&[2u8; 32], 4).len(), 4);
        assert_eq!(store.retrieve(&[2u8; 32], 100).len(), 10);
    }

    #[test]
    fn test_retrieve_ordered_oldest_first() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        for i in 0..5 {
            store.store(message(i, 2, 16)).unwrap();
        }
        let got = store.retrieve(&[2u8; 32], 100);
        let ids: Vec<u8> = got.iter().map(|m| m.id[0]).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delete_requires_matching_recipient() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let msg = message(1, 2, 64);
        store.store(msg.clone()).unwrap();

        // Third party cannot delete.
        assert!(store.delete(&msg.id, &[3u8; 32]).is_err());
        assert!(store.contains(&msg.id));

        assert!(store.delete(&msg.id, &msg.recipient).unwrap());
        assert!(!store.contains(&msg.id));

        // Idempotent.
        assert!(!store.delete(&msg.id, &msg.recipient).unwrap());
    }

    #[test]
    fn test_expiration() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let mut old = message(1, 2, 64);
        old.timestamp_ms = unix_ms() - MESSAGE_LIFETIME.as_millis() as u64 - 1000;
        store.store(old).unwrap();
        store.store(message(2, 2, 64)).unwrap();

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.stats().total_messages, 1);
        assert_eq!(store.stats().expired_total, 1);
    }

    #[test]
    fn test_capacity_eviction_oldest_first() {
        // 1 MiB capacity, ~100 KiB messages: the 11th pushes out the 1st.
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let payload = 100 * 1024 - crate::message::ASYNC_HEADER_SIZE;

        for i in 0..12 {
            store.store(message(i, 2, payload)).unwrap();
        }

        let stats = store.stats();
        assert!(stats.bytes_used <= stats.capacity);
        assert!(stats.evicted_total >= 2);
        assert!(!store.contains(&[0u8; 16]));
        assert!(store.contains(&[11u8; 16]));
    }

    #[test]
    fn test_eviction_is_global_across_recipients() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let payload = 300 * 1024;

        store.store(message(1, 10, payload)).unwrap();
        store.store(message(2, 20, payload)).unwrap();
        store.store(message(3, 30, payload)).unwrap();
        // A fourth large message evicts recipient 10's (the oldest).
        store.store(message(4, 40, payload)).unwrap();

        assert!(store.retrieve(&[10u8; 32], 10).is_empty());
        assert!(!store.retrieve(&[40u8; 32], 10).is_empty());
    }

    #[test]
    fn test_single_message_larger_than_capacity() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        let result = store.store(message(1, 2, 2 * 1024 * 1024));
        assert_eq!(
            result.unwrap_err().kind(),
            crate::ErrorKind::CapacityExceeded
        );
    }

    #[test]
    fn test_capacity_clamp() {
        assert_eq!(MessageStore::in_memory(0).stats().capacity, MIN_CAPACITY);
        assert_eq!(
            MessageStore::in_memory(u64::MAX).stats().capacity,
            MAX_CAPACITY
        );
    }

    #[test]
    fn test_capacity_probe_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let capacity = MessageStore::capacity_for(dir.path());
        assert!(capacity >= MIN_CAPACITY);
        assert!(capacity <= MAX_CAPACITY);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.log");

        {
            let mut store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
            store.store(message(1, 2, 64)).unwrap();
            store.store(message(2, 2, 64)).unwrap();
            store.delete(&[1u8; 16], &[2u8; 32]).unwrap();
        }

        let store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
        assert_eq!(store.stats().total_messages, 1);
        assert!(store.contains(&[2u8; 16]));
        assert!(!store.contains(&[1u8; 16]));
    }

    #[test]
    fn test_persistence_drops_expired_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.log");

        {
            let mut store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
            let mut old = message(1, 2, 64);
            old.timestamp_ms = unix_ms() - MESSAGE_LIFETIME.as_millis() as u64 - 1000;
            store.store(old).unwrap();
        }

        let store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
        assert_eq!(store.stats().total_messages, 0);
    }

    #[test]
    fn test_truncated_log_tail_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.log");

        {
            let mut store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
            store.store(message(1, 2, 64)).unwrap();
        }
        // Append garbage simulating a torn write.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF, 0x00, 1, 2, 3]).unwrap();
        }

        let store = MessageStore::open(&path, MIN_CAPACITY).unwrap();
        assert_eq!(store.stats().total_messages, 1);
    }

    #[test]
    fn test_stats_unique_recipients() {
        let mut store = MessageStore::in_memory(MIN_CAPACITY);
        store.store(message(1, 10, 16)).unwrap();
        store.store(message(2, 10, 16)).unwrap();
        store.store(message(3, 20, 16)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.unique_recipients, 2);
    }
}
