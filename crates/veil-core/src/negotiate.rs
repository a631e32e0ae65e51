//! Version-negotiating secure transport.
//!
//! Wraps the datagram transport with per-peer protocol state, bridging
//! the legacy static-key protocol and Noise-IK sessions:
//!
//! - Outbound to an unknown peer opens with the preferred version. A
//!   Noise-IK attempt that draws a legacy reply, a negotiation response,
//!   or silence past the negotiation timeout falls back to legacy when
//!   fallback is enabled, re-sending the queued payloads; with fallback
//!   disabled the send fails with `NoCommonVersion`.
//! - A per-peer version cache skips negotiation on later contact. Three
//!   consecutive decryption failures invalidate the entry and force
//!   renegotiation.
//! - Inbound datagrams are classified by type byte; when classification
//!   disagrees with the cache, the cache is updated under the write lock.
//! - Simultaneous handshakes tie-break on the lexicographically smaller
//!   static public key: that side stays initiator, the other drops its
//!   in-flight attempt and adopts the incoming handshake.

use crate::error::{Error, Result};
use crate::packet::{MAX_MESSAGE_SIZE, Packet, PacketType, Reader};
use crate::session::{DECRYPT_FAILURE_LIMIT, Session};
use crate::version::{NO_COMMON_VERSION_BYTE, ProtocolCapabilities, ProtocolVersion};
use crate::{PeerKey, util::key_prefix};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, oneshot};
use veil_crypto::aead::{box_decrypt, box_encrypt};
use veil_crypto::noise::IkHandshake;
use veil_crypto::random;
use veil_crypto::x25519::{Keypair, PublicKey};
use veil_transport::Transport;

/// Something the classifier surfaced to the layer above.
#[derive(Debug)]
pub enum InboundEvent {
    /// A decrypted application payload from an authenticated peer.
    Message {
        /// Sender identity
        sender: PeerKey,
        /// Decrypted payload bytes
        payload: Vec<u8>,
    },
    /// An async-storage or pre-key control packet, passed up opaque.
    Control {
        /// Classified packet type
        packet_type: PacketType,
        /// Raw packet payload
        payload: Vec<u8>,
        /// Source address
        from: SocketAddr,
    },
}

struct QueuedSend {
    payload: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

struct PendingNegotiation {
    peer: PeerKey,
    handshake: IkHandshake,
    started: Instant,
    queued: Vec<QueuedSend>,
}

/// Counters for drops and renegotiations.
#[derive(Debug, Default)]
struct Counters {
    malformed_dropped: AtomicU64,
    handshake_failures: AtomicU64,
    cache_invalidations: AtomicU64,
    fallbacks: AtomicU64,
}

/// Snapshot of negotiation counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationStats {
    /// Malformed or unknown packets dropped
    pub malformed_dropped: u64,
    /// Handshake messages that failed to authenticate
    pub handshake_failures: u64,
    /// Version cache entries invalidated after decrypt failures
    pub cache_invalidations: u64,
    /// Negotiations that fell back to legacy
    pub fallbacks: u64,
}

/// The version-negotiating transport (C5).
pub struct NegotiatingTransport {
    identity: Keypair,
    capabilities: ProtocolCapabilities,
    transport: Arc<dyn Transport>,
    version_cache: RwLock<HashMap<SocketAddr, ProtocolVersion>>,
    sessions: RwLock<HashMap<SocketAddr, Session>>,
    pending: Mutex<HashMap<SocketAddr, PendingNegotiation>>,
    legacy_failures: Mutex<HashMap<SocketAddr, u32>>,
    session_idle_timeout: Duration,
    shutdown: AtomicBool,
    counters: Counters,
}

impl NegotiatingTransport {
    /// Wrap a transport with negotiation state.
    #[must_use]
    pub fn new(
        identity: Keypair,
        capabilities: ProtocolCapabilities,
        transport: Arc<dyn Transport>,
        session_idle_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            capabilities,
            transport,
            version_cache: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            legacy_failures: Mutex::new(HashMap::new()),
            session_idle_timeout,
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// This node's identity public key.
    #[must_use]
    pub fn identity_public(&self) -> PeerKey {
        self.identity.public().to_bytes()
    }

    /// The cached protocol version for a peer address, if any.
    pub async fn cached_version(&self, addr: SocketAddr) -> Option<ProtocolVersion> {
        self.version_cache.read().await.get(&addr).copied()
    }

    /// Whether a Noise-IK session exists for the address.
    pub async fn has_session(&self, addr: SocketAddr) -> bool {
        self.sessions.read().await.contains_key(&addr)
    }

    /// Number of live Noise-IK sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> NegotiationStats {
        NegotiationStats {
            malformed_dropped: self.counters.malformed_dropped.load(Ordering::Relaxed),
            handshake_failures: self.counters.handshake_failures.load(Ordering::Relaxed),
            cache_invalidations: self.counters.cache_invalidations.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    async fn set_version(&self, addr: SocketAddr, version: ProtocolVersion) {
        let mut cache = self.version_cache.write().await;
        let previous = cache.insert(addr, version);
        if previous != Some(version) {
            tracing::debug!(%addr, %version, "version cache updated");
        }
    }

    async fn invalidate_version(&self, addr: SocketAddr) {
        if self.version_cache.write().await.remove(&addr).is_some() {
            self.counters
                .cache_invalidations
                .fetch_add(1, Ordering::Relaxed);
            tracing::info!(%addr, "version cache entry invalidated, will renegotiate");
        }
    }

    /// Send an application payload to a peer, negotiating the protocol
    /// first when needed.
    ///
    /// # Errors
    ///
    /// - `NoCommonVersion` when negotiation exhausts with fallback off
    /// - `Canceled` during shutdown
    /// - `Io`, `Crypto` on transport or cipher failures
    pub async fn send_payload(
        &self,
        peer: PeerKey,
        addr: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::canceled());
        }
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::invalid_argument("payload exceeds message bound"));
        }

        let cached = self.cached_version(addr).await;
        match cached {
            Some(ProtocolVersion::Legacy) => {
                // Strict mode never sends legacy, even to a peer the
                // classifier has observed speaking it.
                if !self.capabilities.fallback_enabled()
                    && self.capabilities.preferred() != ProtocolVersion::Legacy
                {
                    return Err(Error::no_common_version());
                }
                self.send_legacy(peer, addr, payload).await
            }
            Some(ProtocolVersion::NoiseIk) => {
                let sealed = {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(&addr) {
                        Some(session) => Some(Self::seal_transport(session, payload)?),
                        None => None,
                    }
                };
                match sealed {
                    Some(bytes) => {
                        self.transport.send_to(&bytes, addr).await?;
                        Ok(())
                    }
                    // Session expired; handshake again.
                    None => self.negotiate_and_send(peer, addr, payload).await,
                }
            }
            None => {
                if self.capabilities.preferred() == ProtocolVersion::NoiseIk {
                    self.negotiate_and_send(peer, addr, payload).await
                } else {
                    self.set_version(addr, ProtocolVersion::Legacy).await;
                    self.send_legacy(peer, addr, payload).await
                }
            }
        }
    }

    /// Send a raw control packet (async storage / pre-key plane).
    ///
    /// # Errors
    ///
    /// Returns `Canceled` during shutdown or `Io` on transport failure.
    pub async fn send_control(
        &self,
        packet_type: PacketType,
        payload: Vec<u8>,
        addr: SocketAddr,
    ) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::canceled());
        }
        let packet = Packet::new(packet_type, payload)?;
        self.transport.send_to(&packet.encode(), addr).await?;
        Ok(())
    }

    fn seal_transport(session: &mut Session, payload: &[u8]) -> Result<Vec<u8>> {
        let (counter, ciphertext) = session.seal(payload)?;
        let mut body = Vec::with_capacity(8 + ciphertext.len());
        body.extend_from_slice(&counter.to_be_bytes());
        body.extend_from_slice(&ciphertext);
        Ok(Packet::new(PacketType::Transport, body)?.encode())
    }

    async fn send_legacy(&self, peer: PeerKey, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let nonce = random::random_nonce()?;
        let ciphertext = box_encrypt(
            payload,
            &nonce,
            &PublicKey::from_bytes(peer),
            self.identity.secret(),
            &[],
        )?;

        let mut body = Vec::with_capacity(32 + 24 + ciphertext.len());
        body.extend_from_slice(&self.identity.public().to_bytes());
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&ciphertext);

        let packet = Packet::new(PacketType::LegacyData, body)?;
        self.transport.send_to(&packet.encode(), addr).await?;
        Ok(())
    }

    /// Queue a payload behind a Noise-IK negotiation, starting one if
    /// none is in flight, and wait for the outcome.
    async fn negotiate_and_send(
        &self,
        peer: PeerKey,
        addr: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut handshake_bytes = None;

        {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&addr) {
                Some(entry) => {
                    entry.queued.push(QueuedSend {
                        payload: payload.to_vec(),
                        done: tx,
                    });
                }
                None => {
                    let mut handshake =
                        IkHandshake::initiate(self.identity.secret(), &PublicKey::from_bytes(peer))?;
                    let msg1 = handshake.write_message_1(&[])?;
                    handshake_bytes = Some(Packet::new(PacketType::HandshakeInit, msg1)?.encode());
                    pending.insert(
                        addr,
                        PendingNegotiation {
                            peer,
                            handshake,
                            started: Instant::now(),
                            queued: vec![QueuedSend {
                                payload: payload.to_vec(),
                                done: tx,
                            }],
                        },
                    );
                    tracing::debug!(%addr, peer = %key_prefix(&peer), "starting noise-ik negotiation");
                }
            }
        }

        if let Some(bytes) = handshake_bytes {
            self.transport.send_to(&bytes, addr).await?;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::canceled()),
        }
    }

    /// Classify and process one inbound datagram, returning events for
    /// the layer above.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        if self.is_shutdown() {
            return events;
        }

        let Ok(packet) = Packet::parse(data) else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return events;
        };
        let Some(packet_type) = packet.packet_type() else {
            tracing::warn!(type_byte = packet.type_byte, %from, "unknown packet type dropped");
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return events;
        };

        match packet_type {
            PacketType::LegacyData => self.handle_legacy(&packet, from, &mut events).await,
            PacketType::HandshakeInit => self.handle_handshake_init(&packet, from).await,
            PacketType::HandshakeResponse => self.handle_handshake_response(&packet, from).await,
            PacketType::Transport => self.handle_transport(&packet, from, &mut events).await,
            PacketType::NegotiationRequest => self.handle_negotiation_request(&packet, from).await,
            PacketType::NegotiationResponse => {
                self.handle_negotiation_response(&packet, from).await;
            }
            other if other.is_async_control() => {
                events.push(InboundEvent::Control {
                    packet_type: other,
                    payload: packet.payload,
                    from,
                });
            }
            _ => {
                self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        events
    }

    async fn handle_legacy(
        &self,
        packet: &Packet,
        from: SocketAddr,
        events: &mut Vec<InboundEvent>,
    ) {
        if !self.capabilities.supports(ProtocolVersion::Legacy) {
            self.send_version_steer(from).await;
            return;
        }

        let mut reader = Reader::new(&packet.payload);
        let (sender, nonce) = match (reader.array::<32>(), reader.array::<24>()) {
            (Ok(sender), Ok(nonce)) => (sender, nonce),
            _ => {
                self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let ciphertext = reader.rest();

        match box_decrypt(
            ciphertext,
            &nonce,
            &PublicKey::from_bytes(sender),
            self.identity.secret(),
            &[],
        ) {
            Ok(plaintext) => {
                self.legacy_failures.lock().await.remove(&from);
                self.set_version(from, ProtocolVersion::Legacy).await;
                self.resolve_pending_with_legacy(from).await;
                events.push(InboundEvent::Message {
                    sender,
                    payload: plaintext,
                });
            }
            Err(_) => {
                let mut failures = self.legacy_failures.lock().await;
                let streak = failures.entry(from).or_insert(0);
                *streak += 1;
                if *streak >= DECRYPT_FAILURE_LIMIT {
                    failures.remove(&from);
                    drop(failures);
                    self.invalidate_version(from).await;
                }
            }
        }
    }

    /// A legacy packet from a peer we were mid-negotiation with settles
    /// the question: flush the queue under legacy, or fail it in strict
    /// mode.
    async fn resolve_pending_with_legacy(&self, from: SocketAddr) {
        let taken = self.pending.lock().await.remove(&from);
        let Some(pending) = taken else { return };

        if self.capabilities.fallback_enabled() {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            tracing::info!(%from, "peer answered in legacy, falling back");
            for queued in pending.queued {
                let result = self
                    .send_legacy(pending.peer, from, &queued.payload)
                    .await;
                let _ = queued.done.send(result);
            }
        } else {
            for queued in pending.queued {
                let _ = queued.done.send(Err(Error::no_common_version()));
            }
        }
    }

    async fn handle_handshake_init(&self, packet: &Packet, from: SocketAddr) {
        if !self.capabilities.supports(ProtocolVersion::NoiseIk) {
            self.send_version_steer(from).await;
            return;
        }

        let mut handshake = match IkHandshake::respond(self.identity.secret()) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "responder state construction failed");
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if handshake.read_message_1(&packet.payload).is_err() {
            self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(initiator) = handshake.remote_static() else {
            self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let initiator_key = initiator.to_bytes();

        // Simultaneous handshake: the smaller static key stays initiator.
        let adopted = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&from) {
                if self.identity.public().to_bytes() < initiator_key {
                    tracing::debug!(%from, "handshake race, keeping our initiator role");
                    return;
                }
                tracing::debug!(%from, "handshake race, adopting incoming handshake");
                pending.remove(&from).map(|p| p.queued).unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        let msg2 = match handshake.write_message_2(&[]) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "handshake response construction failed");
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                for queued in adopted {
                    let _ = queued.done.send(Err(Error::handshake("handshake failed")));
                }
                return;
            }
        };

        let chains = handshake.into_chains();
        let (send, recv) = match chains {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "chain derivation failed");
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                for queued in adopted {
                    let _ = queued.done.send(Err(Error::handshake("handshake failed")));
                }
                return;
            }
        };

        let mut session = Session::new(initiator_key, send, recv);

        let mut outgoing = Vec::with_capacity(1 + adopted.len());
        match Packet::new(PacketType::HandshakeResponse, msg2) {
            Ok(p) => outgoing.push(p.encode()),
            Err(_) => return,
        }

        let mut resolutions = Vec::with_capacity(adopted.len());
        for queued in adopted {
            match Self::seal_transport(&mut session, &queued.payload) {
                Ok(bytes) => {
                    outgoing.push(bytes);
                    resolutions.push((queued.done, Ok(())));
                }
                Err(e) => resolutions.push((queued.done, Err(e))),
            }
        }

        self.sessions.write().await.insert(from, session);
        self.set_version(from, ProtocolVersion::NoiseIk).await;
        tracing::info!(
            %from,
            peer = %key_prefix(&initiator_key),
            "noise-ik session established as responder"
        );

        for bytes in outgoing {
            if let Err(e) = self.transport.send_to(&bytes, from).await {
                tracing::warn!(error = %e, %from, "send failed during establishment");
            }
        }
        for (done, result) in resolutions {
            let _ = done.send(result);
        }
    }

    async fn handle_handshake_response(&self, packet: &Packet, from: SocketAddr) {
        let taken = self.pending.lock().await.remove(&from);
        let Some(pending) = taken else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut handshake = pending.handshake;
        if handshake.read_message_2(&packet.payload).is_err() {
            self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
            for queued in pending.queued {
                let _ = queued
                    .done
                    .send(Err(Error::handshake("handshake response rejected")));
            }
            return;
        }

        let (send, recv) = match handshake.into_chains() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "chain derivation failed");
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                for queued in pending.queued {
                    let _ = queued.done.send(Err(Error::handshake("handshake failed")));
                }
                return;
            }
        };

        let mut session = Session::new(pending.peer, send, recv);

        let mut outgoing = Vec::with_capacity(pending.queued.len());
        let mut resolutions = Vec::with_capacity(pending.queued.len());
        for queued in pending.queued {
            match Self::seal_transport(&mut session, &queued.payload) {
                Ok(bytes) => {
                    outgoing.push(bytes);
                    resolutions.push((queued.done, Ok(())));
                }
                Err(e) => resolutions.push((queued.done, Err(e))),
            }
        }

        self.sessions.write().await.insert(from, session);
        self.set_version(from, ProtocolVersion::NoiseIk).await;
        tracing::info!(
            %from,
            peer = %key_prefix(&pending.peer),
            "noise-ik session established as initiator"
        );

        for bytes in outgoing {
            if let Err(e) = self.transport.send_to(&bytes, from).await {
                tracing::warn!(error = %e, %from, "queued payload send failed");
            }
        }
        for (done, result) in resolutions {
            let _ = done.send(result);
        }
    }

    async fn handle_transport(
        &self,
        packet: &Packet,
        from: SocketAddr,
        events: &mut Vec<InboundEvent>,
    ) {
        let mut reader = Reader::new(&packet.payload);
        let Ok(counter) = reader.u64() else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let ciphertext = reader.rest();

        let outcome = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&from) else {
                self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match session.open(counter, ciphertext) {
                Ok(plaintext) => Ok((session.peer(), plaintext)),
                Err(e) => {
                    if session.failure_streak() >= DECRYPT_FAILURE_LIMIT {
                        sessions.remove(&from);
                        Err(Some(e))
                    } else {
                        Err(None)
                    }
                }
            }
        };

        match outcome {
            Ok((sender, payload)) => {
                self.set_version(from, ProtocolVersion::NoiseIk).await;
                events.push(InboundEvent::Message { sender, payload });
            }
            Err(Some(_)) => {
                // Three strikes: drop the session and renegotiate next send.
                self.invalidate_version(from).await;
            }
            Err(None) => {}
        }
    }

    async fn handle_negotiation_request(&self, packet: &Packet, from: SocketAddr) {
        let mut reader = Reader::new(&packet.payload);
        let Ok(count) = reader.u8() else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mut peer_versions = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            match reader.u8() {
                Ok(byte) => {
                    if let Some(version) = ProtocolVersion::from_byte(byte) {
                        peer_versions.push(version);
                    }
                }
                Err(_) => {
                    self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        let response = match self.capabilities.best_common(&peer_versions) {
            Some(version) => {
                self.set_version(from, version).await;
                version.to_byte()
            }
            // No overlap: say so, then go quiet.
            None => NO_COMMON_VERSION_BYTE,
        };
        let _ = self
            .send_control(PacketType::NegotiationResponse, vec![response], from)
            .await;
    }

    async fn handle_negotiation_response(&self, packet: &Packet, from: SocketAddr) {
        let Some(&byte) = packet.payload.first() else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if byte == NO_COMMON_VERSION_BYTE {
            let taken = self.pending.lock().await.remove(&from);
            if let Some(pending) = taken {
                for queued in pending.queued {
                    let _ = queued.done.send(Err(Error::no_common_version()));
                }
            }
            return;
        }

        let Some(version) = ProtocolVersion::from_byte(byte) else {
            self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self.capabilities.supports(version) {
            let taken = self.pending.lock().await.remove(&from);
            if let Some(pending) = taken {
                for queued in pending.queued {
                    let _ = queued.done.send(Err(Error::no_common_version()));
                }
            }
            return;
        }

        match version {
            ProtocolVersion::Legacy => {
                self.set_version(from, ProtocolVersion::Legacy).await;
                self.resolve_pending_with_legacy(from).await;
            }
            ProtocolVersion::NoiseIk => {
                // Keep waiting for the handshake response.
                self.set_version(from, ProtocolVersion::NoiseIk).await;
            }
        }
    }

    /// Tell a peer speaking a version we do not support which version we
    /// would accept.
    async fn send_version_steer(&self, from: SocketAddr) {
        let byte = self.capabilities.preferred().to_byte();
        let _ = self
            .send_control(PacketType::NegotiationResponse, vec![byte], from)
            .await;
    }

    /// Drive negotiation timeouts and session expiry. Called every tick.
    pub async fn tick(&self, now: Instant) {
        if self.is_shutdown() {
            return;
        }

        let timeout = self.capabilities.negotiation_timeout();
        let expired: Vec<(SocketAddr, PendingNegotiation)> = {
            let mut pending = self.pending.lock().await;
            let addrs: Vec<SocketAddr> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.started) >= timeout)
                .map(|(addr, _)| *addr)
                .collect();
            addrs
                .into_iter()
                .filter_map(|addr| pending.remove(&addr).map(|p| (addr, p)))
                .collect()
        };

        for (addr, pending) in expired {
            if self.capabilities.fallback_enabled()
                && self.capabilities.supports(ProtocolVersion::Legacy)
            {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%addr, "negotiation timed out, falling back to legacy");
                self.set_version(addr, ProtocolVersion::Legacy).await;
                for queued in pending.queued {
                    let result = self.send_legacy(pending.peer, addr, &queued.payload).await;
                    let _ = queued.done.send(result);
                }
            } else {
                tracing::info!(%addr, "negotiation timed out, no fallback");
                for queued in pending.queued {
                    let _ = queued.done.send(Err(Error::no_common_version()));
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions.retain(|addr, session| {
            let idle = session.is_idle(now, self.session_idle_timeout);
            if idle {
                tracing::debug!(%addr, "expiring idle session");
            }
            !idle
        });
    }

    /// Cancel all pending work and refuse further packets.
    pub async fn shutdown_now(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        let drained: Vec<PendingNegotiation> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            for queued in pending.queued {
                let _ = queued.done.send(Err(Error::canceled()));
            }
        }

        self.sessions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testutil::{MockTransport, test_addr};
    use rand_core::OsRng;
    use tokio::sync::mpsc;

    struct TestNode {
        negotiating: Arc<NegotiatingTransport>,
        addr: SocketAddr,
        events: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
        _pump: tokio::task::JoinHandle<()>,
    }

    impl TestNode {
        fn identity(&self) -> PeerKey {
            self.negotiating.identity_public()
        }

        async fn next_message(&self) -> (PeerKey, Vec<u8>) {
            let mut events = self.events.lock().await;
            loop {
                let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("event channel closed");
                if let InboundEvent::Message { sender, payload } = event {
                    return (sender, payload);
                }
            }
        }
    }

    fn spawn_node(
        transport: Arc<MockTransport>,
        addr: SocketAddr,
        capabilities: ProtocolCapabilities,
    ) -> TestNode {
        let identity = Keypair::generate(&mut OsRng);
        let negotiating = Arc::new(NegotiatingTransport::new(
            identity,
            capabilities,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_secs(300),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pump = {
            let negotiating = Arc::clone(&negotiating);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                loop {
                    while let Some(datagram) = transport.try_recv() {
                        for event in negotiating
                            .handle_datagram(&datagram.data, datagram.from)
                            .await
                        {
                            let _ = event_tx.send(event);
                        }
                    }
                    negotiating.tick(Instant::now()).await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        TestNode {
            negotiating,
            addr,
            events: tokio::sync::Mutex::new(event_rx),
            _pump: pump,
        }
    }

    fn node_pair(
        caps_a: ProtocolCapabilities,
        caps_b: ProtocolCapabilities,
    ) -> (TestNode, TestNode) {
        let addr_a = test_addr();
        let addr_b = test_addr();
        let (ta, tb) = MockTransport::pair(addr_a, addr_b);
        (spawn_node(ta, addr_a, caps_a), spawn_node(tb, addr_b, caps_b))
    }

    fn short_timeout_caps(
        supported: Vec<ProtocolVersion>,
        preferred: ProtocolVersion,
        fallback: bool,
    ) -> ProtocolCapabilities {
        ProtocolCapabilities::new(supported, preferred, fallback, Duration::from_millis(200))
            .unwrap()
    }

    #[tokio::test]
    async fn test_noise_session_and_delivery() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        a.negotiating
            .send_payload(b.identity(), b.addr, b"hello")
            .await
            .unwrap();

        let (sender, payload) = b.next_message().await;
        assert_eq!(sender, a.identity());
        assert_eq!(payload, b"hello");

        assert_eq!(
            a.negotiating.cached_version(b.addr).await,
            Some(ProtocolVersion::NoiseIk)
        );
        assert!(a.negotiating.has_session(b.addr).await);
        assert!(b.negotiating.has_session(a.addr).await);
    }

    #[tokio::test]
    async fn test_second_send_reuses_session() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        a.negotiating
            .send_payload(b.identity(), b.addr, b"one")
            .await
            .unwrap();
        b.next_message().await;

        assert_eq!(a.negotiating.session_count().await, 1);

        a.negotiating
            .send_payload(b.identity(), b.addr, b"two")
            .await
            .unwrap();
        let (_, payload) = b.next_message().await;
        assert_eq!(payload, b"two");
        assert_eq!(a.negotiating.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_legacy_fallback_via_steer() {
        // B only speaks legacy; A prefers Noise-IK with fallback on.
        let (a, b) = node_pair(
            short_timeout_caps(
                vec![ProtocolVersion::NoiseIk, ProtocolVersion::Legacy],
                ProtocolVersion::NoiseIk,
                true,
            ),
            short_timeout_caps(vec![ProtocolVersion::Legacy], ProtocolVersion::Legacy, true),
        );

        a.negotiating
            .send_payload(b.identity(), b.addr, b"fallback")
            .await
            .unwrap();

        let (sender, payload) = b.next_message().await;
        assert_eq!(sender, a.identity());
        assert_eq!(payload, b"fallback");
        assert_eq!(
            a.negotiating.cached_version(b.addr).await,
            Some(ProtocolVersion::Legacy)
        );

        // Subsequent sends go straight to legacy, no new negotiation.
        a.negotiating
            .send_payload(b.identity(), b.addr, b"again")
            .await
            .unwrap();
        let (_, payload) = b.next_message().await;
        assert_eq!(payload, b"again");
        assert_eq!(a.negotiating.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_strict_mode_fails_with_no_common_version() {
        // A: Noise-IK only, no fallback. B: legacy only.
        let (a, b) = node_pair(
            short_timeout_caps(vec![ProtocolVersion::NoiseIk], ProtocolVersion::NoiseIk, false),
            short_timeout_caps(vec![ProtocolVersion::Legacy], ProtocolVersion::Legacy, true),
        );

        let err = a
            .negotiating
            .send_payload(b.identity(), b.addr, b"secret")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCommonVersion);

        // The payload never crossed the wire in any form.
        let mut events = b.events.lock().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(300), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_timeout_fallback_to_legacy_with_silent_peer() {
        // The peer never answers the handshake; after the negotiation
        // timeout the payload goes out under legacy and the version is
        // cached.
        let addr_a = test_addr();
        let addr_dead = test_addr();
        let (ta, _td) = MockTransport::pair(addr_a, addr_dead);
        let a = spawn_node(
            ta,
            addr_a,
            short_timeout_caps(
                vec![ProtocolVersion::NoiseIk, ProtocolVersion::Legacy],
                ProtocolVersion::NoiseIk,
                true,
            ),
        );

        let ghost = Keypair::generate(&mut OsRng);
        a.negotiating
            .send_payload(ghost.public().to_bytes(), addr_dead, b"eventually legacy")
            .await
            .unwrap();

        assert_eq!(
            a.negotiating.cached_version(addr_dead).await,
            Some(ProtocolVersion::Legacy)
        );
        assert_eq!(a.negotiating.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_strict_mode_timeout_without_any_reply() {
        // Peer is completely silent: no steer, no legacy packet.
        let addr_a = test_addr();
        let addr_dead = test_addr();
        let (ta, _td) = MockTransport::pair(addr_a, addr_dead);
        let a = spawn_node(
            ta,
            addr_a,
            short_timeout_caps(vec![ProtocolVersion::NoiseIk], ProtocolVersion::NoiseIk, false),
        );

        let ghost = Keypair::generate(&mut OsRng);
        let err = a
            .negotiating
            .send_payload(ghost.public().to_bytes(), addr_dead, b"void")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCommonVersion);
    }

    #[tokio::test]
    async fn test_replayed_transport_packet_not_delivered_twice() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        a.negotiating
            .send_payload(b.identity(), b.addr, b"first")
            .await
            .unwrap();
        b.next_message().await;

        // Capture the next transport packet by sealing it ourselves via
        // the public path, then replay the raw bytes at B.
        a.negotiating
            .send_payload(b.identity(), b.addr, b"replay-me")
            .await
            .unwrap();
        let (_, payload) = b.next_message().await;
        assert_eq!(payload, b"replay-me");

        // Replay a stale counter at B. The session floor rejects anything
        // not strictly newer, so no event fires.
        let stale = Packet::new(PacketType::Transport, {
            let mut body = 0u64.to_be_bytes().to_vec();
            body.extend_from_slice(&[0u8; 32]);
            body
        })
        .unwrap();
        let _ = b
            .negotiating
            .handle_datagram(&stale.encode(), a.addr)
            .await;

        let mut events = b.events.lock().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_simultaneous_handshake_race_converges() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        let a_nt = Arc::clone(&a.negotiating);
        let b_nt = Arc::clone(&b.negotiating);
        let (a_id, b_id) = (a.identity(), b.identity());
        let (a_addr, b_addr) = (a.addr, b.addr);

        let send_a = tokio::spawn(async move { a_nt.send_payload(b_id, b_addr, b"from a").await });
        let send_b = tokio::spawn(async move { b_nt.send_payload(a_id, a_addr, b"from b").await });

        send_a.await.unwrap().unwrap();
        send_b.await.unwrap().unwrap();

        let (_, payload_at_b) = b.next_message().await;
        assert_eq!(payload_at_b, b"from a");
        let (_, payload_at_a) = a.next_message().await;
        assert_eq!(payload_at_a, b"from b");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let addr_a = test_addr();
        let addr_dead = test_addr();
        let (ta, _td) = MockTransport::pair(addr_a, addr_dead);
        let a = spawn_node(ta, addr_a, ProtocolCapabilities::default());

        let ghost = Keypair::generate(&mut OsRng);
        let nt = Arc::clone(&a.negotiating);
        let ghost_pk = ghost.public().to_bytes();
        let pending = tokio::spawn(async move { nt.send_payload(ghost_pk, addr_dead, b"x").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        a.negotiating.shutdown_now().await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        // Further sends refuse immediately.
        let err = a
            .negotiating
            .send_payload(ghost.public().to_bytes(), addr_dead, b"y")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_malformed_packets_counted_not_fatal() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        let before = b.negotiating.stats().malformed_dropped;
        let _ = b.negotiating.handle_datagram(&[0x99, 1, 2, 3], a.addr).await;
        let _ = b.negotiating.handle_datagram(&[], a.addr).await;
        assert!(b.negotiating.stats().malformed_dropped > before);

        // The transport still works afterwards.
        a.negotiating
            .send_payload(b.identity(), b.addr, b"still alive")
            .await
            .unwrap();
        let (_, payload) = b.next_message().await;
        assert_eq!(payload, b"still alive");
    }

    #[tokio::test]
    async fn test_negotiation_request_answered_with_common_version() {
        let (a, b) = node_pair(
            ProtocolCapabilities::default(),
            ProtocolCapabilities::default(),
        );

        // A peer advertising only legacy support gets legacy chosen.
        let request = Packet::new(
            PacketType::NegotiationRequest,
            vec![1, ProtocolVersion::Legacy.to_byte()],
        )
        .unwrap();
        let _ = b.negotiating.handle_datagram(&request.encode(), a.addr).await;
        assert_eq!(
            b.negotiating.cached_version(a.addr).await,
            Some(ProtocolVersion::Legacy)
        );
    }
}
