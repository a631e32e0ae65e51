//! Async delivery manager.
//!
//! Orchestrates store-and-forward messaging: tracks which friends are
//! online, keeps a set of known storage nodes, caches peers' pre-key
//! bundles, replicates outgoing messages to a quorum of storage nodes,
//! and on reconnect retrieves, decrypts, de-duplicates, and deletes
//! messages held for this node.
//!
//! Per-message encryption: one fresh ephemeral keypair and one consumed
//! recipient pre-key per message; the symmetric key is
//! HKDF-SHA256(DH(ephemeral, pre_key) ‖ DH(identity, peer_identity)).
//! The same encrypted message is replicated to every selected storage
//! node, so duplicate deliveries collapse onto one message ID.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::friend::FriendState;
use crate::handler::{EventHandler, NullHandler};
use crate::message::{AsyncMessage, MessageType};
use crate::negotiate::NegotiatingTransport;
use crate::packet::{MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE, PacketType, Reader};
use crate::prekey::{PreKeyBundle, PreKeyStore};
use crate::store::{MessageStore, StorageStats};
use crate::util::{key_prefix, unix_ms};
use crate::{MessageId, PeerKey};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use veil_crypto::aead::AeadCipher;
use veil_crypto::x25519::{Keypair, PrivateKey, PublicKey};
use veil_crypto::{constant_time, hash, kdf, random};

/// Base delay before a store request is retransmitted.
const STORE_RETRY_BASE: Duration = Duration::from_millis(500);

/// Retransmission delay ceiling.
const STORE_RETRY_MAX: Duration = Duration::from_secs(8);

/// Attempts per storage node before the target is written off.
const STORE_ATTEMPT_LIMIT: u32 = 5;

/// Housekeeping cadence: expiration sweep, pre-key refill, dedup pruning.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// How long delivered message IDs are remembered for de-duplication.
const DELIVERED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// KDF label for async message payload keys.
const ASYNC_KEY_INFO: &[u8] = b"veil async message v1";

/// KDF label for delete authenticator keys.
const DELETE_AUTH_INFO: &[u8] = b"veil delete auth v1";

/// Store response status: stored.
const STORE_STATUS_OK: u8 = 0;
/// Store response status: node full.
const STORE_STATUS_FULL: u8 = 1;
/// Store response status: node refuses to serve storage.
const STORE_STATUS_REJECTED: u8 = 2;

/// A peer participating in the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageNode {
    /// The node's identity public key
    pub public_key: PeerKey,
    /// The node's network address
    pub address: SocketAddr,
}

struct CachedBundle {
    one_time: VecDeque<(u32, [u8; 32])>,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Queued,
    Inflight,
    Acked,
    Failed,
}

struct StoreTarget {
    node: StorageNode,
    state: TargetState,
    attempts: u32,
    next_retry: Instant,
}

struct PendingStore {
    encoded: Vec<u8>,
    targets: Vec<StoreTarget>,
    needed: usize,
    notify: Arc<Notify>,
}

impl PendingStore {
    fn acks(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::Acked)
            .count()
    }

    fn settled(&self) -> bool {
        self.targets
            .iter()
            .all(|t| matches!(t.state, TargetState::Acked | TargetState::Failed))
    }
}

#[derive(Default)]
struct Pipeline {
    pending: HashMap<MessageId, PendingStore>,
    // Outcomes of settled stores, kept briefly so a waiter that loses the
    // race with the last acknowledgement still observes the result.
    completed: HashMap<MessageId, (bool, Instant)>,
}

impl Pipeline {
    fn settle(&mut self, id: MessageId, success: bool) {
        if let Some(pending) = self.pending.remove(&id) {
            pending.notify.notify_one();
        }
        self.completed.insert(id, (success, Instant::now()));
    }

    fn inflight_counts(&self) -> HashMap<SocketAddr, usize> {
        let mut counts = HashMap::new();
        for p in self.pending.values() {
            for t in &p.targets {
                if t.state == TargetState::Inflight {
                    *counts.entry(t.node.address).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn queued_total(&self) -> usize {
        self.pending
            .values()
            .flat_map(|p| &p.targets)
            .filter(|t| t.state == TargetState::Queued)
            .count()
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let exp = STORE_RETRY_BASE.saturating_mul(1u32 << attempt.saturating_sub(1).min(4));
    let capped = exp.min(STORE_RETRY_MAX);
    // ±20% jitter keeps retransmissions from synchronizing.
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

/// The async delivery manager (C8).
pub struct AsyncManager {
    identity: Keypair,
    config: NodeConfig,
    negotiating: Arc<NegotiatingTransport>,
    prekeys: Mutex<PreKeyStore>,
    store: RwLock<MessageStore>,
    friends: RwLock<HashMap<PeerKey, FriendState>>,
    storage_nodes: RwLock<Vec<StorageNode>>,
    bundles: Mutex<HashMap<PeerKey, CachedBundle>>,
    delivered: Mutex<HashMap<MessageId, Instant>>,
    pipeline: Mutex<Pipeline>,
    deferred_exchanges: Mutex<HashSet<PeerKey>>,
    handler: RwLock<Arc<dyn EventHandler>>,
    online: AtomicBool,
    canceled: AtomicBool,
    last_housekeeping: Mutex<Instant>,
}

impl AsyncManager {
    /// Assemble the manager around its collaborators.
    #[must_use]
    pub fn new(
        identity: Keypair,
        config: NodeConfig,
        negotiating: Arc<NegotiatingTransport>,
        prekeys: PreKeyStore,
        store: MessageStore,
    ) -> Self {
        Self {
            identity,
            config,
            negotiating,
            prekeys: Mutex::new(prekeys),
            store: RwLock::new(store),
            friends: RwLock::new(HashMap::new()),
            storage_nodes: RwLock::new(Vec::new()),
            bundles: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            pipeline: Mutex::new(Pipeline::default()),
            deferred_exchanges: Mutex::new(HashSet::new()),
            handler: RwLock::new(Arc::new(NullHandler)),
            online: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            last_housekeeping: Mutex::new(Instant::now()),
        }
    }

    fn our_key(&self) -> PeerKey {
        self.identity.public().to_bytes()
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Register the event handler, replacing any previous one.
    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write().await = handler;
    }

    async fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&*self.handler.read().await)
    }

    /// Whether this node currently considers itself online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Add a storage node to the known set (deduplicated by key).
    pub async fn add_storage_node(&self, node: StorageNode) {
        let mut nodes = self.storage_nodes.write().await;
        if !nodes.iter().any(|n| n.public_key == node.public_key) {
            nodes.push(node);
        }
    }

    /// Known storage nodes.
    pub async fn storage_nodes(&self) -> Vec<StorageNode> {
        self.storage_nodes.read().await.clone()
    }

    /// Add a friend to the read view, initially offline.
    pub async fn add_friend(&self, friend: PeerKey) {
        self.friends
            .write()
            .await
            .entry(friend)
            .or_insert_with(|| FriendState::new(friend));
    }

    /// Update a friend's online state (edge-triggered).
    ///
    /// A flip to online publishes our pre-key bundle and fetches theirs
    /// when due; deferred exchanges queued by a failed `send_async` are
    /// drained here.
    pub async fn set_friend_status(
        &self,
        friend: PeerKey,
        online: bool,
        address: Option<SocketAddr>,
    ) {
        let edge = {
            let mut friends = self.friends.write().await;
            friends
                .entry(friend)
                .or_insert_with(|| FriendState::new(friend))
                .set_online(online, address)
        };
        if !edge {
            return;
        }

        self.handler().await.on_friend_status_change(friend, online);

        if online && self.is_online() {
            let deferred = self.deferred_exchanges.lock().await.remove(&friend);
            if let Some(addr) = address {
                self.exchange_pre_keys(friend, addr, deferred).await;
            }
        }
    }

    /// Snapshot of a friend's online state.
    pub async fn friend_online(&self, friend: &PeerKey) -> bool {
        self.friends
            .read()
            .await
            .get(friend)
            .is_some_and(|f| f.known_online)
    }

    /// Last known address of an online friend.
    pub async fn friend_address(&self, friend: &PeerKey) -> Option<SocketAddr> {
        self.friends.read().await.get(friend).and_then(|f| f.address)
    }

    /// Publish our bundle to a friend and fetch theirs when the cached
    /// copy is stale (or `force`d by a deferred exchange).
    async fn exchange_pre_keys(&self, friend: PeerKey, addr: SocketAddr, force: bool) {
        let refresh_after = self.config.signed_pre_key_lifetime / 2;
        let due = force
            || match self.bundles.lock().await.get(&friend) {
                Some(bundle) => bundle.fetched_at.elapsed() >= refresh_after,
                None => true,
            };

        let our_bundle = self.prekeys.lock().await.publish_bundle();
        if let Err(e) = self
            .negotiating
            .send_control(PacketType::BundlePublish, our_bundle.encode(), addr)
            .await
        {
            tracing::debug!(error = %e, "bundle publish failed");
        }

        if due {
            let payload = self.our_key().to_vec();
            if let Err(e) = self
                .negotiating
                .send_control(PacketType::BundleFetch, payload, addr)
                .await
            {
                tracing::debug!(error = %e, "bundle fetch failed");
            }
        }
    }

    /// Transition this node to online: retrieve held messages from every
    /// known storage node and refresh pre-key state with online friends.
    pub async fn go_online(&self) {
        if self.online.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!("going online, draining storage nodes");

        let our_key = self.our_key().to_vec();
        for node in self.storage_nodes().await {
            if let Err(e) = self
                .negotiating
                .send_control(PacketType::RetrieveRequest, our_key.clone(), node.address)
                .await
            {
                tracing::debug!(error = %e, "retrieve request failed");
            }
        }

        let online_friends: Vec<(PeerKey, SocketAddr)> = self
            .friends
            .read()
            .await
            .values()
            .filter(|f| f.known_online)
            .filter_map(|f| f.address.map(|a| (f.public_key, a)))
            .collect();
        for (friend, addr) in online_friends {
            let deferred = self.deferred_exchanges.lock().await.remove(&friend);
            self.exchange_pre_keys(friend, addr, deferred).await;
        }
    }

    /// Transition to offline: the direct path stops, async keeps queuing.
    pub fn go_offline(&self) {
        self.online.store(false, Ordering::Relaxed);
    }

    /// Number of unconsumed one-time pre-keys currently cached for a peer.
    pub async fn cached_pre_keys(&self, peer: &PeerKey) -> usize {
        self.bundles
            .lock()
            .await
            .get(peer)
            .map_or(0, |b| b.one_time.len())
    }

    /// Local storage statistics.
    pub async fn storage_stats(&self) -> StorageStats {
        self.store.read().await.stats()
    }

    /// Send a message to an offline recipient through the storage layer.
    ///
    /// Succeeds once a majority of the selected storage nodes have
    /// acknowledged; retries for the rest continue in the background.
    ///
    /// # Errors
    ///
    /// - `NotApplicable` if the recipient is online (use the direct path)
    /// - `NoPreKeys` if no unconsumed pre-key is cached for the recipient;
    ///   a pre-key exchange is queued for the next co-online window
    /// - `Backpressure` when the per-destination pipeline is saturated
    /// - `Io` when no storage node is known, all stores fail, or the
    ///   majority acknowledgement does not arrive in time
    /// - `Canceled` during shutdown
    pub async fn send_async(
        &self,
        recipient: PeerKey,
        message_type: MessageType,
        plaintext: &[u8],
    ) -> Result<MessageId> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(Error::invalid_argument("message exceeds size bound"));
        }
        if self.friend_online(&recipient).await {
            return Err(Error::not_applicable("recipient online, use direct path"));
        }

        let targets: Vec<StorageNode> = {
            let nodes = self.storage_nodes.read().await;
            let mut candidates: Vec<StorageNode> = nodes
                .iter()
                .copied()
                .filter(|n| n.public_key != recipient && n.public_key != self.our_key())
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(self.config.storage_quorum.max(1));
            candidates
        };
        if targets.is_empty() {
            return Err(Error::io("no storage nodes known"));
        }

        // Backpressure check before a pre-key is burned.
        {
            let pipeline = self.pipeline.lock().await;
            let counts = pipeline.inflight_counts();
            let cap = self.config.max_inflight_per_node;
            let overflow: usize = targets
                .iter()
                .filter(|t| counts.get(&t.address).copied().unwrap_or(0) >= cap)
                .count();
            if overflow > 0
                && pipeline.queued_total() + overflow > self.config.max_queued_store_requests
            {
                return Err(Error::backpressure("store pipeline saturated"));
            }
        }

        let Some((pre_key_id, pre_key_pub)) = self
            .bundles
            .lock()
            .await
            .get_mut(&recipient)
            .and_then(|b| b.one_time.pop_front())
        else {
            self.deferred_exchanges.lock().await.insert(recipient);
            return Err(Error::no_pre_keys());
        };

        let ephemeral = PrivateKey::generate(&mut rand_core::OsRng);
        let dh_ephemeral = ephemeral.exchange(&PublicKey::from_bytes(pre_key_pub))?;
        let dh_static = self
            .identity
            .secret()
            .exchange(&PublicKey::from_bytes(recipient))?;
        let key = kdf::derive_key2(dh_ephemeral.as_bytes(), dh_static.as_bytes(), ASYNC_KEY_INFO);

        let mut message = AsyncMessage {
            id: random::random_id()?,
            recipient,
            sender: self.our_key(),
            ephemeral: ephemeral.public_key().to_bytes(),
            pre_key_id,
            nonce: random::random_nonce()?,
            timestamp_ms: unix_ms(),
            message_type,
            ciphertext: Vec::new(),
        };
        message.ciphertext =
            AeadCipher::new(&key).encrypt(&message.nonce, plaintext, &message.aad())?;

        let id = message.id;
        let encoded = message.encode();
        let needed = targets.len().div_ceil(2);
        let notify = Arc::new(Notify::new());

        let send_now: Vec<SocketAddr> = {
            let mut pipeline = self.pipeline.lock().await;
            let mut counts = pipeline.inflight_counts();
            let cap = self.config.max_inflight_per_node;
            let now = Instant::now();

            let mut send_now = Vec::new();
            let mut store_targets = Vec::with_capacity(targets.len());
            for node in targets {
                let inflight = counts.entry(node.address).or_insert(0);
                let state = if *inflight < cap {
                    *inflight += 1;
                    send_now.push(node.address);
                    TargetState::Inflight
                } else {
                    TargetState::Queued
                };
                store_targets.push(StoreTarget {
                    node,
                    state,
                    attempts: u32::from(state == TargetState::Inflight),
                    next_retry: now + retry_backoff(1),
                });
            }
            pipeline.pending.insert(
                id,
                PendingStore {
                    encoded: encoded.clone(),
                    targets: store_targets,
                    needed,
                    notify: Arc::clone(&notify),
                },
            );
            send_now
        };

        for addr in send_now {
            if let Err(e) = self
                .negotiating
                .send_control(PacketType::StoreRequest, encoded.clone(), addr)
                .await
            {
                tracing::debug!(error = %e, %addr, "store request send failed");
            }
        }

        tracing::debug!(
            id = %hex::encode(id),
            recipient = %key_prefix(&recipient),
            "async message dispatched to storage nodes"
        );

        // Wait for the majority acknowledgement.
        let waited = tokio::time::timeout(self.config.store_request_timeout, async {
            loop {
                if self.is_canceled() {
                    return Err(Error::canceled());
                }
                {
                    let mut pipeline = self.pipeline.lock().await;
                    if let Some(p) = pipeline.pending.get(&id) {
                        if p.acks() >= p.needed {
                            return Ok(());
                        }
                        if p.targets.iter().all(|t| t.state == TargetState::Failed) {
                            return Err(Error::io("all store requests failed"));
                        }
                    } else if let Some((success, _)) = pipeline.completed.remove(&id) {
                        return if success {
                            Ok(())
                        } else {
                            Err(Error::io("all store requests failed"))
                        };
                    } else {
                        return Err(Error::canceled());
                    }
                }
                notify.notified().await;
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => {
                let mut pipeline = self.pipeline.lock().await;
                pipeline.pending.remove(&id);
                pipeline.completed.remove(&id);
                Err(e)
            }
            Err(_) => {
                let mut pipeline = self.pipeline.lock().await;
                pipeline.pending.remove(&id);
                pipeline.completed.remove(&id);
                Err(Error::io("store request timed out"))
            }
        }
    }

    /// Dispatch a decrypted direct-path payload to the handler.
    ///
    /// Direct payloads carry `[message_type:1][data…]`.
    pub async fn dispatch_direct(&self, sender: PeerKey, payload: &[u8]) {
        let Some((&type_byte, data)) = payload.split_first() else {
            return;
        };
        let Some(message_type) = MessageType::from_byte(type_byte) else {
            tracing::warn!(type_byte, "direct payload with unknown message type dropped");
            return;
        };

        {
            let mut friends = self.friends.write().await;
            if let Some(friend) = friends.get_mut(&sender) {
                friend.last_seen = Some(Instant::now());
            }
        }

        self.handler().await.on_message(sender, message_type, data);
    }

    /// Handle an inbound control packet surfaced by the classifier.
    pub async fn handle_control(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        from: SocketAddr,
    ) {
        if self.is_canceled() {
            return;
        }
        match packet_type {
            PacketType::StoreRequest => self.handle_store_request(payload, from).await,
            PacketType::StoreResponse => self.handle_store_response(payload, from).await,
            PacketType::RetrieveRequest => self.handle_retrieve_request(payload, from).await,
            PacketType::RetrieveResponse => self.handle_retrieve_response(payload, from).await,
            PacketType::DeleteRequest => self.handle_delete_request(payload).await,
            PacketType::BundlePublish => self.handle_bundle_publish(payload).await,
            PacketType::BundleFetch => self.handle_bundle_fetch(payload, from).await,
            _ => {}
        }
    }

    async fn handle_store_request(&self, payload: &[u8], from: SocketAddr) {
        let Ok(message) = AsyncMessage::decode(payload) else {
            tracing::warn!(%from, "malformed store request dropped");
            return;
        };
        let id = message.id;

        let status = if !self.config.async_storage_enabled {
            STORE_STATUS_REJECTED
        } else {
            match self.store.write().await.store(message) {
                Ok(_) => STORE_STATUS_OK,
                Err(e) if e.kind() == crate::ErrorKind::CapacityExceeded => STORE_STATUS_FULL,
                Err(e) => {
                    tracing::warn!(error = %e, "store request failed");
                    STORE_STATUS_REJECTED
                }
            }
        };

        let mut response = Vec::with_capacity(17);
        response.extend_from_slice(&id);
        response.push(status);
        if let Err(e) = self
            .negotiating
            .send_control(PacketType::StoreResponse, response, from)
            .await
        {
            tracing::debug!(error = %e, "store response send failed");
        }
    }

    async fn handle_store_response(&self, payload: &[u8], from: SocketAddr) {
        let mut reader = Reader::new(payload);
        let (Ok(id), Ok(status)) = (reader.array::<16>(), reader.u8()) else {
            return;
        };

        let mut pipeline = self.pipeline.lock().await;
        let Some(pending) = pipeline.pending.get_mut(&id) else {
            return;
        };
        let Some(target) = pending
            .targets
            .iter_mut()
            .find(|t| t.node.address == from)
        else {
            return;
        };

        target.state = if status == STORE_STATUS_OK {
            TargetState::Acked
        } else {
            tracing::debug!(%from, status, "storage node declined message");
            TargetState::Failed
        };
        pending.notify.notify_one();

        if pending.settled() {
            let success = pending.acks() >= pending.needed;
            pipeline.settle(id, success);
        }
    }

    async fn handle_retrieve_request(&self, payload: &[u8], from: SocketAddr) {
        let mut reader = Reader::new(payload);
        let Ok(recipient) = reader.array::<32>() else {
            return;
        };

        let messages = self
            .store
            .read()
            .await
            .retrieve(&recipient, self.config.retrieve_batch_size);

        // Keep the response within one datagram.
        let mut batch = Vec::new();
        let mut total = 2usize;
        for message in messages {
            let len = message.encoded_len();
            if total + len > MAX_PAYLOAD_SIZE {
                break;
            }
            total += len;
            batch.push(message);
        }

        let body = AsyncMessage::encode_batch(&batch);
        if let Err(e) = self
            .negotiating
            .send_control(PacketType::RetrieveResponse, body, from)
            .await
        {
            tracing::debug!(error = %e, "retrieve response send failed");
        }
    }

    async fn handle_retrieve_response(&self, payload: &[u8], from: SocketAddr) {
        let Ok(messages) = AsyncMessage::decode_batch(payload) else {
            tracing::warn!(%from, "malformed retrieve response dropped");
            return;
        };
        for message in messages {
            self.process_incoming(message, from).await;
        }
    }

    /// Decrypt, dispatch, and clean up one retrieved message.
    async fn process_incoming(&self, message: AsyncMessage, node_addr: SocketAddr) {
        if message.recipient != self.our_key() {
            return;
        }

        // De-duplicate across storage nodes before touching pre-keys.
        if self.delivered.lock().await.contains_key(&message.id) {
            self.delete_at_node(message.id, node_addr).await;
            return;
        }

        let secret = match self.prekeys.lock().await.consume(message.pre_key_id) {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                tracing::warn!(
                    pre_key_id = message.pre_key_id,
                    "unknown or already-consumed pre-key, discarding message"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "pre-key consumption failed");
                return;
            }
        };

        let Ok(dh_ephemeral) = secret.exchange(&PublicKey::from_bytes(message.ephemeral)) else {
            tracing::warn!("degenerate ephemeral key, discarding message");
            return;
        };
        let Ok(dh_static) = self
            .identity
            .secret()
            .exchange(&PublicKey::from_bytes(message.sender))
        else {
            tracing::warn!("degenerate sender key, discarding message");
            return;
        };
        let key = kdf::derive_key2(dh_ephemeral.as_bytes(), dh_static.as_bytes(), ASYNC_KEY_INFO);

        match AeadCipher::new(&key).decrypt(&message.nonce, &message.ciphertext, &message.aad()) {
            Ok(plaintext) => {
                self.delivered
                    .lock()
                    .await
                    .insert(message.id, Instant::now());
                self.handler()
                    .await
                    .on_message(message.sender, message.message_type, &plaintext);
                self.delete_at_node(message.id, node_addr).await;
            }
            Err(_) => {
                // Authentication failure: discard, but leave the stored
                // copy alone.
                tracing::warn!(
                    sender = %key_prefix(&message.sender),
                    "async message failed authentication, discarding"
                );
            }
        }
    }

    /// Ask a storage node to drop a delivered message, proving we are the
    /// recipient with a keyed authenticator.
    async fn delete_at_node(&self, id: MessageId, node_addr: SocketAddr) {
        let node_key = self
            .storage_nodes
            .read()
            .await
            .iter()
            .find(|n| n.address == node_addr)
            .map(|n| n.public_key);
        let Some(node_key) = node_key else {
            tracing::debug!(%node_addr, "unknown storage node, skipping delete");
            return;
        };

        let Ok(shared) = self
            .identity
            .secret()
            .exchange(&PublicKey::from_bytes(node_key))
        else {
            return;
        };
        let auth_key = kdf::derive_key(shared.as_bytes(), DELETE_AUTH_INFO);
        let tag = hash::keyed_tag(&auth_key, &id);

        let mut payload = Vec::with_capacity(16 + 32 + 16);
        payload.extend_from_slice(&id);
        payload.extend_from_slice(&self.our_key());
        payload.extend_from_slice(&tag);

        if let Err(e) = self
            .negotiating
            .send_control(PacketType::DeleteRequest, payload, node_addr)
            .await
        {
            tracing::debug!(error = %e, "delete request send failed");
        }
    }

    async fn handle_delete_request(&self, payload: &[u8]) {
        let mut reader = Reader::new(payload);
        let (Ok(id), Ok(recipient), Ok(auth)) = (
            reader.array::<16>(),
            reader.array::<32>(),
            reader.array::<16>(),
        ) else {
            return;
        };

        let Ok(shared) = self
            .identity
            .secret()
            .exchange(&PublicKey::from_bytes(recipient))
        else {
            return;
        };
        let auth_key = kdf::derive_key(shared.as_bytes(), DELETE_AUTH_INFO);
        let expected = hash::keyed_tag(&auth_key, &id);
        if !constant_time::verify_16(&auth, &expected) {
            tracing::warn!("delete request with bad authenticator dropped");
            return;
        }

        if let Err(e) = self.store.write().await.delete(&id, &recipient) {
            tracing::debug!(error = %e, "delete request rejected");
        }
    }

    async fn handle_bundle_publish(&self, payload: &[u8]) {
        let Ok(bundle) = PreKeyBundle::decode(payload) else {
            tracing::warn!("malformed pre-key bundle dropped");
            return;
        };
        if bundle.verify().is_err() {
            tracing::warn!(
                peer = %key_prefix(&bundle.identity),
                "pre-key bundle signature invalid, dropped"
            );
            return;
        }

        let count = bundle.one_time.len();
        self.bundles.lock().await.insert(
            bundle.identity,
            CachedBundle {
                one_time: bundle.one_time.into_iter().collect(),
                fetched_at: Instant::now(),
            },
        );
        tracing::debug!(
            peer = %key_prefix(&bundle.identity),
            count,
            "cached peer pre-key bundle"
        );
    }

    async fn handle_bundle_fetch(&self, payload: &[u8], from: SocketAddr) {
        let mut reader = Reader::new(payload);
        let Ok(requester) = reader.array::<32>() else {
            return;
        };

        self.handler().await.on_pre_key_request(requester);

        let bundle = self.prekeys.lock().await.publish_bundle();
        if let Err(e) = self
            .negotiating
            .send_control(PacketType::BundlePublish, bundle.encode(), from)
            .await
        {
            tracing::debug!(error = %e, "bundle publish send failed");
        }
    }

    /// Drive retransmissions, queue promotion, and periodic housekeeping.
    pub async fn tick(&self, now: Instant) {
        if self.is_canceled() {
            return;
        }

        let sends: Vec<(SocketAddr, Vec<u8>)> = {
            let mut pipeline = self.pipeline.lock().await;
            let cap = self.config.max_inflight_per_node;
            let mut counts = pipeline.inflight_counts();
            let mut sends = Vec::new();

            for pending in pipeline.pending.values_mut() {
                for target in pending.targets.iter_mut() {
                    match target.state {
                        TargetState::Inflight if now >= target.next_retry => {
                            if target.attempts >= STORE_ATTEMPT_LIMIT {
                                target.state = TargetState::Failed;
                                if let Some(c) = counts.get_mut(&target.node.address) {
                                    *c = c.saturating_sub(1);
                                }
                                pending.notify.notify_one();
                            } else {
                                target.attempts += 1;
                                target.next_retry = now + retry_backoff(target.attempts);
                                sends.push((target.node.address, pending.encoded.clone()));
                            }
                        }
                        TargetState::Queued => {
                            let inflight = counts.entry(target.node.address).or_insert(0);
                            if *inflight < cap {
                                *inflight += 1;
                                target.state = TargetState::Inflight;
                                target.attempts = 1;
                                target.next_retry = now + retry_backoff(1);
                                sends.push((target.node.address, pending.encoded.clone()));
                            }
                        }
                        _ => {}
                    }
                }
            }

            let settled: Vec<(MessageId, bool)> = pipeline
                .pending
                .iter()
                .filter(|(_, p)| p.settled())
                .map(|(id, p)| (*id, p.acks() >= p.needed))
                .collect();
            for (id, success) in settled {
                pipeline.settle(id, success);
            }
            pipeline
                .completed
                .retain(|_, (_, at)| now.duration_since(*at) < Duration::from_secs(60));
            sends
        };

        for (addr, bytes) in sends {
            if let Err(e) = self
                .negotiating
                .send_control(PacketType::StoreRequest, bytes, addr)
                .await
            {
                tracing::debug!(error = %e, %addr, "store retransmission failed");
            }
        }

        self.housekeeping(now).await;
    }

    async fn housekeeping(&self, now: Instant) {
        {
            let mut last = self.last_housekeeping.lock().await;
            if now.duration_since(*last) < HOUSEKEEPING_INTERVAL {
                return;
            }
            *last = now;
        }

        let expired = self.store.write().await.cleanup_expired();
        if expired > 0 {
            tracing::debug!(expired, "storage expiration sweep");
        }

        if let Err(e) = self.prekeys.lock().await.maintain() {
            tracing::warn!(error = %e, "pre-key maintenance failed");
        }

        self.delivered
            .lock()
            .await
            .retain(|_, seen| now.duration_since(*seen) <= DELIVERED_RETENTION);
    }

    /// Cancel all in-flight work. Terminal.
    pub async fn shutdown_now(&self) {
        self.canceled.store(true, Ordering::Relaxed);
        let mut pipeline = self.pipeline.lock().await;
        for pending in pipeline.pending.values() {
            pending.notify.notify_one();
        }
        pipeline.pending.clear();
        pipeline.completed.clear();
    }
}
