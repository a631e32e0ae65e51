//! The node: wiring and the cooperative tick driver.
//!
//! A [`Node`] owns the transport, the negotiating layer, and the async
//! manager, and exposes the embedder-facing API. The embedder drives it:
//!
//! ```no_run
//! # async fn run() -> veil_core::Result<()> {
//! let node = veil_core::Node::new(veil_core::NodeConfig::default()).await?;
//! loop {
//!     node.iterate().await;
//!     tokio::time::sleep(node.iteration_interval()).await;
//! }
//! # }
//! ```
//!
//! Each tick drains the inbound queue through protocol classification,
//! drives negotiation timeouts and store-request retransmissions, expires
//! idle sessions, and (once a minute) sweeps expired messages and tops up
//! pre-keys.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::handler::EventHandler;
use crate::manager::{AsyncManager, StorageNode};
use crate::message::MessageType;
use crate::negotiate::{InboundEvent, NegotiatingTransport, NegotiationStats};
use crate::prekey::PreKeyStore;
use crate::store::{MessageStore, StorageStats};
use crate::{MessageId, PeerKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use veil_crypto::x25519::Keypair;
use veil_transport::{Transport, TransportStats, UdpTransport};

/// How often the embedder should call [`Node::iterate`].
const ITERATION_INTERVAL: Duration = Duration::from_millis(50);

/// Datagrams processed per tick before yielding back to the embedder.
const MAX_DATAGRAMS_PER_TICK: usize = 256;

/// A VEIL node: secure transport plus async delivery.
pub struct Node {
    transport: Arc<dyn Transport>,
    negotiating: Arc<NegotiatingTransport>,
    manager: Arc<AsyncManager>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node with a fresh identity, bound per the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the UDP transport is disabled (use
    /// [`Node::with_transport`] to supply another), `Io` if binding or
    /// opening persistent state fails.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let identity = Keypair::generate(&mut rand_core::OsRng);
        Self::with_identity(config, identity).await
    }

    /// Create a node with a persistent identity keypair.
    ///
    /// # Errors
    ///
    /// As [`Node::new`].
    pub async fn with_identity(config: NodeConfig, identity: Keypair) -> Result<Self> {
        if !config.udp_enabled {
            return Err(Error::invalid_argument(
                "udp transport disabled; supply a transport explicitly",
            ));
        }
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind_with_queue_depth(
            config.listen_addr,
            config.recv_queue_depth,
        )?);
        Self::with_transport(config, identity, transport)
    }

    /// Create a node on an already-constructed transport.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an inconsistent version
    /// configuration, `Io` if persistent state cannot be opened.
    pub fn with_transport(
        config: NodeConfig,
        identity: Keypair,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let capabilities = config.capabilities()?;

        std::fs::create_dir_all(&config.data_dir)?;
        let prekeys = PreKeyStore::open(
            &config.data_dir.join("prekeys.bin"),
            identity.public().to_bytes(),
            config.pre_key_batch_size,
            config.signed_pre_key_lifetime,
        )?;

        let log_path = config.data_dir.join("messages.log");
        let capacity = MessageStore::capacity_for(&config.data_dir);
        let store = MessageStore::open(&log_path, capacity)?;

        let negotiating = Arc::new(NegotiatingTransport::new(
            identity.clone(),
            capabilities,
            Arc::clone(&transport),
            config.session_idle_timeout,
        ));

        let manager = Arc::new(AsyncManager::new(
            identity,
            config,
            Arc::clone(&negotiating),
            prekeys,
            store,
        ));

        Ok(Self {
            transport,
            negotiating,
            manager,
            shutdown: AtomicBool::new(false),
        })
    }

    /// This node's identity public key, its stable identifier.
    #[must_use]
    pub fn identity_public(&self) -> PeerKey {
        self.negotiating.identity_public()
    }

    /// The locally bound transport address.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the transport cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// The interval at which the embedder should call [`Node::iterate`].
    #[must_use]
    pub fn iteration_interval(&self) -> Duration {
        ITERATION_INTERVAL
    }

    /// Register the event handler.
    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.manager.register_handler(handler).await;
    }

    /// Add a friend to the read view.
    pub async fn add_friend(&self, friend: PeerKey) {
        self.manager.add_friend(friend).await;
    }

    /// Report a friend's online state (called by the friend subsystem).
    pub async fn set_friend_status(
        &self,
        friend: PeerKey,
        online: bool,
        address: Option<SocketAddr>,
    ) {
        self.manager.set_friend_status(friend, online, address).await;
    }

    /// Add a storage node (typically discovered through the DHT).
    pub async fn add_storage_node(&self, public_key: PeerKey, address: SocketAddr) {
        self.manager
            .add_storage_node(StorageNode {
                public_key,
                address,
            })
            .await;
    }

    /// Go online: drain stored messages and refresh pre-key exchanges.
    pub async fn go_online(&self) {
        self.manager.go_online().await;
    }

    /// Go offline: the direct path stops.
    pub fn go_offline(&self) {
        self.manager.go_offline();
    }

    /// Send a message to an online friend over the direct path.
    ///
    /// # Errors
    ///
    /// - `NotApplicable` when the friend is offline (use
    ///   [`Node::send_async`])
    /// - `NoCommonVersion`, `Handshake`, `Crypto`, `Io` from negotiation
    ///   and transport
    /// - `Canceled` during shutdown
    pub async fn send_message(
        &self,
        friend: PeerKey,
        message_type: MessageType,
        data: &[u8],
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(Error::canceled());
        }
        if !self.manager.friend_online(&friend).await {
            return Err(Error::not_applicable(
                "recipient offline, use the async path",
            ));
        }
        let Some(addr) = self.manager.friend_address(&friend).await else {
            return Err(Error::not_applicable("no known address for friend"));
        };

        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(message_type.to_byte());
        payload.extend_from_slice(data);
        self.negotiating.send_payload(friend, addr, &payload).await
    }

    /// Send a message to an offline friend through the storage layer.
    ///
    /// # Errors
    ///
    /// See [`AsyncManager::send_async`].
    pub async fn send_async(
        &self,
        recipient: PeerKey,
        message_type: MessageType,
        data: &[u8],
    ) -> Result<MessageId> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(Error::canceled());
        }
        self.manager.send_async(recipient, message_type, data).await
    }

    /// One cooperative tick: pump the receive queue, drive timers and
    /// retransmissions, expire idle state.
    pub async fn iterate(&self) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut remaining = MAX_DATAGRAMS_PER_TICK;
        while remaining > 0 {
            let Some(datagram) = self.transport.try_recv() else {
                break;
            };
            remaining -= 1;

            let events = self
                .negotiating
                .handle_datagram(&datagram.data, datagram.from)
                .await;
            for event in events {
                match event {
                    InboundEvent::Message { sender, payload } => {
                        self.manager.dispatch_direct(sender, &payload).await;
                    }
                    InboundEvent::Control {
                        packet_type,
                        payload,
                        from,
                    } => {
                        self.manager
                            .handle_control(packet_type, &payload, from)
                            .await;
                    }
                }
            }
        }

        let now = Instant::now();
        self.negotiating.tick(now).await;
        self.manager.tick(now).await;
    }

    /// Shut the node down: cancel in-flight work, drop sessions, release
    /// the socket. Terminal.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!("node shutting down");
        self.manager.shutdown_now().await;
        self.negotiating.shutdown_now().await;
        self.transport.close();
    }

    /// Local storage statistics.
    pub async fn storage_stats(&self) -> StorageStats {
        self.manager.storage_stats().await
    }

    /// Transport statistics.
    #[must_use]
    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Negotiation counters.
    #[must_use]
    pub fn negotiation_stats(&self) -> NegotiationStats {
        self.negotiating.stats()
    }

    /// The cached protocol version for a peer address.
    pub async fn cached_version(
        &self,
        addr: SocketAddr,
    ) -> Option<crate::version::ProtocolVersion> {
        self.negotiating.cached_version(addr).await
    }

    /// Number of unconsumed pre-keys cached for a peer.
    pub async fn cached_pre_keys(&self, peer: &PeerKey) -> usize {
        self.manager.cached_pre_keys(peer).await
    }
}
