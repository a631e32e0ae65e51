//! One-time pre-key store.
//!
//! Generates batches of one-time X25519 pre-keys plus a long-lived
//! Ed25519-signed pre-key, publishes them as bundles, and dispenses each
//! one-time private key exactly once. Consumption is committed to disk
//! before the private key is returned, so a crash cannot hand the same
//! pre-key out twice.
//!
//! Persistence is a single bincode file replaced atomically
//! (write-temp-then-rename). A corrupt file is discarded and the store
//! rebuilt from scratch with a fresh batch.

use crate::PeerKey;
use crate::error::{Error, Result};
use crate::packet::Reader;
use crate::util::unix_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use veil_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use veil_crypto::x25519::PrivateKey;
use zeroize::Zeroize;

/// Default number of one-time pre-keys kept available.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default lifetime of the signed pre-key before rotation.
pub const DEFAULT_SIGNED_PRE_KEY_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Grace period the previous signed pre-key is retained after rotation,
/// one message lifetime, so in-flight bundles stay usable.
const PREVIOUS_SIGNED_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: u32,
    public: [u8; 32],
    secret: Option<[u8; 32]>,
    created_ms: u64,
    consumed: bool,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredSignedPreKey {
    public: [u8; 32],
    secret: [u8; 32],
    created_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredState {
    signing_seed: [u8; 32],
    signed: StoredSignedPreKey,
    previous_signed: Option<StoredSignedPreKey>,
    records: Vec<StoredRecord>,
}

/// A published pre-key bundle.
///
/// Wire form:
/// `[identity:32][signing_key:32][signed_pre_key:32][signature:64]`
/// `[count:2][(pre_key_id:4)(public:32)…]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Owner's X25519 identity public key
    pub identity: PeerKey,
    /// Owner's Ed25519 verifying key
    pub signing_key: [u8; 32],
    /// Current signed pre-key public
    pub signed_pre_key: [u8; 32],
    /// Ed25519 signature over the signed pre-key
    pub signature: [u8; 64],
    /// Snapshot of unconsumed one-time pre-keys
    pub one_time: Vec<(u32, [u8; 32])>,
}

impl PreKeyBundle {
    /// Verify the signed pre-key signature.
    ///
    /// # Errors
    ///
    /// Returns `Crypto` if the signing key or signature do not check out.
    pub fn verify(&self) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.signing_key)?;
        key.verify(&self.signed_pre_key, &Signature::from_bytes(self.signature))?;
        Ok(())
    }

    /// Serialize to wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 32 + 64 + 2 + self.one_time.len() * 36);
        out.extend_from_slice(&self.identity);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&self.signed_pre_key);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.one_time.len() as u16).to_be_bytes());
        for (id, public) in &self.one_time {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(public);
        }
        out
    }

    /// Parse from wire form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a truncated or inconsistent buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf);
        let identity = reader.array::<32>()?;
        let signing_key = reader.array::<32>()?;
        let signed_pre_key = reader.array::<32>()?;
        let signature = reader.array::<64>()?;
        let count = reader.u16()? as usize;
        let mut one_time = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let id = reader.u32()?;
            let public = reader.array::<32>()?;
            one_time.push((id, public));
        }
        if reader.remaining() != 0 {
            return Err(Error::invalid_argument("trailing bytes after bundle"));
        }
        Ok(Self {
            identity,
            signing_key,
            signed_pre_key,
            signature,
            one_time,
        })
    }
}

/// Durable store of this node's pre-keys.
pub struct PreKeyStore {
    identity: PeerKey,
    signing: SigningKey,
    signed: StoredSignedPreKey,
    previous_signed: Option<StoredSignedPreKey>,
    records: HashMap<u32, StoredRecord>,
    batch_size: usize,
    signed_lifetime: Duration,
    path: PathBuf,
}

impl PreKeyStore {
    /// Open the store at `path`, creating it if absent.
    ///
    /// A corrupt file is discarded with a warning and the store rebuilt
    /// with a fresh batch and a fresh signing key.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written.
    pub fn open(
        path: &Path,
        identity: PeerKey,
        batch_size: usize,
        signed_lifetime: Duration,
    ) -> Result<Self> {
        if let Some(state) = Self::load(path) {
            let mut store = Self {
                identity,
                signing: SigningKey::from_bytes(&state.signing_seed),
                signed: state.signed,
                previous_signed: state.previous_signed,
                records: state.records.into_iter().map(|r| (r.id, r)).collect(),
                batch_size: batch_size.max(1),
                signed_lifetime,
                path: path.to_path_buf(),
            };
            store.refill()?;
            return Ok(store);
        }

        let signing = SigningKey::generate(&mut rand_core::OsRng);
        let signed = Self::generate_signed_pre_key();
        let mut store = Self {
            identity,
            signing,
            signed,
            previous_signed: None,
            records: HashMap::new(),
            batch_size: batch_size.max(1),
            signed_lifetime,
            path: path.to_path_buf(),
        };
        store.generate_records(store.batch_size);
        store.persist()?;
        Ok(store)
    }

    fn load(path: &Path) -> Option<StoredState> {
        let bytes = std::fs::read(path).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "pre-key store corrupt, rebuilding");
                None
            }
        }
    }

    fn generate_signed_pre_key() -> StoredSignedPreKey {
        let secret = PrivateKey::generate(&mut rand_core::OsRng);
        StoredSignedPreKey {
            public: secret.public_key().to_bytes(),
            secret: secret.to_bytes(),
            created_ms: unix_ms(),
        }
    }

    fn generate_records(&mut self, count: usize) {
        let now = unix_ms();
        for _ in 0..count {
            let secret = PrivateKey::generate(&mut rand_core::OsRng);
            let mut id = veil_crypto::random::random_u32().unwrap_or(0);
            while self.records.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            self.records.insert(
                id,
                StoredRecord {
                    id,
                    public: secret.public_key().to_bytes(),
                    secret: Some(secret.to_bytes()),
                    created_ms: now,
                    consumed: false,
                },
            );
        }
    }

    fn persist(&self) -> Result<()> {
        let state = StoredState {
            signing_seed: self.signing.to_bytes(),
            signed: self.signed.clone(),
            previous_signed: self.previous_signed.clone(),
            records: self.records.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&state)
            .map_err(|e| Error::new(crate::ErrorKind::Io, e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Number of one-time pre-keys still available.
    #[must_use]
    pub fn unconsumed_count(&self) -> usize {
        self.records.values().filter(|r| !r.consumed).count()
    }

    /// Snapshot the current bundle for publication.
    #[must_use]
    pub fn publish_bundle(&self) -> PreKeyBundle {
        let signature = self.signing.sign(&self.signed.public);
        let mut one_time: Vec<(u32, [u8; 32])> = self
            .records
            .values()
            .filter(|r| !r.consumed)
            .map(|r| (r.id, r.public))
            .collect();
        one_time.sort_by_key(|(id, _)| *id);

        PreKeyBundle {
            identity: self.identity,
            signing_key: self.signing.verifying_key().to_bytes(),
            signed_pre_key: self.signed.public,
            signature: *signature.as_bytes(),
            one_time,
        }
    }

    /// Atomically consume a one-time pre-key, returning its private half
    /// exactly once.
    ///
    /// The consumption is committed to disk before the key is returned;
    /// a repeat call with the same ID returns `None`, across restarts.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the commit fails; the record stays unconsumed.
    pub fn consume(&mut self, pre_key_id: u32) -> Result<Option<PrivateKey>> {
        let Some(record) = self.records.get_mut(&pre_key_id) else {
            return Ok(None);
        };
        if record.consumed {
            return Ok(None);
        }
        let Some(mut secret_bytes) = record.secret.take() else {
            return Ok(None);
        };
        record.consumed = true;

        if let Err(e) = self.persist() {
            // Commit failed: put the record back untouched.
            let record = self.records.get_mut(&pre_key_id).expect("record present");
            record.secret = Some(secret_bytes);
            record.consumed = false;
            return Err(e);
        }

        let secret = PrivateKey::from_bytes(secret_bytes);
        secret_bytes.zeroize();
        Ok(Some(secret))
    }

    /// Top the unconsumed pool back up to the batch size when it has
    /// drained below the low-water mark (a quarter of the batch).
    ///
    /// # Errors
    ///
    /// Returns `Io` if persisting fails.
    pub fn refill(&mut self) -> Result<usize> {
        let available = self.unconsumed_count();
        let low_water = self.batch_size / 4;
        if available >= low_water.max(1) {
            return Ok(0);
        }
        let added = self.batch_size - available;
        self.generate_records(added);
        self.persist()?;
        tracing::debug!(added, "replenished one-time pre-keys");
        Ok(added)
    }

    /// Periodic upkeep: rotate an expired signed pre-key, drop stale
    /// consumed records, and refill the pool.
    ///
    /// # Errors
    ///
    /// Returns `Io` if persisting fails.
    pub fn maintain(&mut self) -> Result<()> {
        let now = unix_ms();
        let mut dirty = false;

        let lifetime_ms = self.signed_lifetime.as_millis() as u64;
        if now.saturating_sub(self.signed.created_ms) > lifetime_ms {
            tracing::info!("rotating signed pre-key");
            self.previous_signed = Some(self.signed.clone());
            self.signed = Self::generate_signed_pre_key();
            dirty = true;
        }

        if let Some(previous) = &self.previous_signed {
            let grace_ms = lifetime_ms + PREVIOUS_SIGNED_GRACE.as_millis() as u64;
            if now.saturating_sub(previous.created_ms) > grace_ms {
                self.previous_signed = None;
                dirty = true;
            }
        }

        let stale_ms = PREVIOUS_SIGNED_GRACE.as_millis() as u64;
        let before = self.records.len();
        self.records
            .retain(|_, r| !r.consumed || now.saturating_sub(r.created_ms) <= stale_ms);
        dirty |= self.records.len() != before;

        if dirty {
            self.persist()?;
        }
        self.refill()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use veil_crypto::x25519::Keypair;

    fn store_at(dir: &tempfile::TempDir) -> PreKeyStore {
        let identity = Keypair::generate(&mut OsRng);
        PreKeyStore::open(
            &dir.path().join("prekeys.bin"),
            identity.public().to_bytes(),
            16,
            DEFAULT_SIGNED_PRE_KEY_LIFETIME,
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_store_has_full_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        assert_eq!(store.unconsumed_count(), 16);
    }

    #[test]
    fn test_consume_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);

        let bundle = store.publish_bundle();
        let (id, public) = bundle.one_time[0];

        let secret = store.consume(id).unwrap().expect("first consume succeeds");
        assert_eq!(secret.public_key().to_bytes(), public);

        assert!(store.consume(id).unwrap().is_none());
        assert_eq!(store.unconsumed_count(), 15);
    }

    #[test]
    fn test_consume_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prekeys.bin");
        let identity = Keypair::generate(&mut OsRng);

        let id = {
            let mut store = PreKeyStore::open(
                &path,
                identity.public().to_bytes(),
                16,
                DEFAULT_SIGNED_PRE_KEY_LIFETIME,
            )
            .unwrap();
            let id = store.publish_bundle().one_time[0].0;
            assert!(store.consume(id).unwrap().is_some());
            id
        };

        let mut reopened = PreKeyStore::open(
            &path,
            identity.public().to_bytes(),
            16,
            DEFAULT_SIGNED_PRE_KEY_LIFETIME,
        )
        .unwrap();
        assert!(reopened.consume(id).unwrap().is_none());
    }

    #[test]
    fn test_unknown_id_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        assert!(store.consume(0xFFFF_FFFF).unwrap().is_none());
    }

    #[test]
    fn test_refill_below_low_water() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);

        // Drain to below a quarter of the batch.
        let ids: Vec<u32> = store
            .publish_bundle()
            .one_time
            .iter()
            .map(|(id, _)| *id)
            .collect();
        for id in ids.iter().take(14) {
            store.consume(*id).unwrap().unwrap();
        }
        assert_eq!(store.unconsumed_count(), 2);

        let added = store.refill().unwrap();
        assert_eq!(added, 14);
        assert_eq!(store.unconsumed_count(), 16);
    }

    #[test]
    fn test_bundle_signature_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);

        let bundle = store.publish_bundle();
        assert!(bundle.verify().is_ok());

        let mut tampered = bundle.clone();
        tampered.signed_pre_key[0] ^= 0xFF;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_bundle_wire_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);

        let bundle = store.publish_bundle();
        let decoded = PreKeyBundle::decode(&bundle.encode()).unwrap();
        assert_eq!(decoded, bundle);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_bundle_excludes_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);

        let id = store.publish_bundle().one_time[0].0;
        store.consume(id).unwrap().unwrap();

        let bundle = store.publish_bundle();
        assert!(bundle.one_time.iter().all(|(i, _)| *i != id));
    }

    #[test]
    fn test_corrupt_file_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prekeys.bin");
        std::fs::write(&path, b"not a valid store").unwrap();

        let identity = Keypair::generate(&mut OsRng);
        let store = PreKeyStore::open(
            &path,
            identity.public().to_bytes(),
            16,
            DEFAULT_SIGNED_PRE_KEY_LIFETIME,
        )
        .unwrap();
        assert_eq!(store.unconsumed_count(), 16);
    }

    #[test]
    fn test_signed_pre_key_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Keypair::generate(&mut OsRng);
        let mut store = PreKeyStore::open(
            &dir.path().join("prekeys.bin"),
            identity.public().to_bytes(),
            16,
            Duration::from_millis(0),
        )
        .unwrap();

        let old_public = store.publish_bundle().signed_pre_key;
        std::thread::sleep(Duration::from_millis(5));
        store.maintain().unwrap();

        let new_public = store.publish_bundle().signed_pre_key;
        assert_ne!(old_public, new_public);
        assert!(store.previous_signed.is_some());
    }
}
