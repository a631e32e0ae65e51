//! Noise-IK handshake and transport cipher chains.
//!
//! Implements the `Noise_IK` pattern using the snow library:
//! - Pattern: `IK` (initiator knows the responder's static key)
//! - DH: `25519` (Curve25519)
//! - Cipher: `ChaChaPoly` (ChaCha20-Poly1305)
//! - Hash: `BLAKE2s` (for snow compatibility; HKDF-SHA256 for the
//!   application chain keys)
//!
//! ## Message Flow
//!
//! ```text
//! Message 1: Initiator → Responder: e, es, s, ss
//! Message 2: Responder → Initiator: e, ee, se
//! ```
//!
//! Two messages authenticate both parties. The initiator's static key
//! travels encrypted inside message 1, so it never appears on the wire in
//! the clear. Compromise of either static key after the handshake does not
//! reveal transport traffic (forward secrecy), and compromise of one
//! peer's static key does not allow impersonating others to it (KCI
//! resistance).
//!
//! ## Transport
//!
//! After the handshake the symmetric state is split into two cipher
//! chains, one per direction. Each chain owns a monotonically increasing
//! 64-bit counter embedded in a 24-byte nonce with a distinct per-direction
//! constant; a receiving chain rejects any counter that does not advance
//! past the last accepted one.

use crate::aead::AeadCipher;
use crate::x25519::{PrivateKey, PublicKey};
use crate::{CryptoError, SessionKeys, kdf};
use snow::{Builder, HandshakeState};

/// Noise protocol pattern used by VEIL sessions.
const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Maximum handshake message size.
/// Message 1: 32 (e) + 48 (encrypted s) + payload + 16 (tag)
/// Message 2: 32 (e) + payload + 16 (tag)
const MAX_HANDSHAKE_MSG_SIZE: usize = 1024;

/// Nonce prefix for the initiator-to-responder chain.
const DIRECTION_I2R: [u8; 16] = *b"veil.chain.i2r.1";

/// Nonce prefix for the responder-to-initiator chain.
const DIRECTION_R2I: [u8; 16] = *b"veil.chain.r2i.1";

/// Role in the Noise handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (sends message 1)
    Initiator,
    /// Responds to handshake (receives message 1)
    Responder,
}

/// Lifecycle of a handshake.
///
/// `Failed` is reached from `Sent1` on a bad or missing reply; `Closed`
/// is the terminal state of an established session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No message processed yet
    Uninitiated,
    /// One message processed (initiator sent it, responder consumed it)
    Sent1,
    /// Both messages processed, transport chains available
    Established,
    /// Aborted; no session material survives
    Failed,
    /// Explicitly closed
    Closed,
}

/// `Noise_IK` handshake session.
pub struct IkHandshake {
    state: HandshakeState,
    role: Role,
    phase: HandshakePhase,
}

impl IkHandshake {
    /// Create an initiator handshake toward a known responder identity.
    ///
    /// The responder's static key is mixed into the handshake, so a
    /// responder holding a different key cannot read message 1 and the
    /// handshake cannot complete against an impersonator.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the pattern or key material
    /// is rejected by the underlying library.
    pub fn initiate(
        local_secret: &PrivateKey,
        remote_static: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Handshake(format!("pattern parse error: {e:?}")))?,
        );

        let state = builder
            .local_private_key(&local_secret.to_bytes())?
            .remote_public_key(remote_static.as_bytes())?
            .build_initiator()?;

        Ok(Self {
            state,
            role: Role::Initiator,
            phase: HandshakePhase::Uninitiated,
        })
    }

    /// Create a responder handshake.
    ///
    /// The initiator's identity is learned from message 1 via
    /// [`IkHandshake::remote_static`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the pattern or key material
    /// is rejected by the underlying library.
    pub fn respond(local_secret: &PrivateKey) -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Handshake(format!("pattern parse error: {e:?}")))?,
        );

        let state = builder
            .local_private_key(&local_secret.to_bytes())?
            .build_responder()?;

        Ok(Self {
            state,
            role: Role::Responder,
            phase: HandshakePhase::Uninitiated,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Role of this side.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether both messages have been processed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.phase == HandshakePhase::Established
    }

    /// Mark the handshake as failed (timeout or explicit abort).
    pub fn fail(&mut self) {
        self.phase = HandshakePhase::Failed;
    }

    /// Initiator: produce message 1 (`e ‖ encrypted s ‖ payload`).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] out of phase, or
    /// [`CryptoError::Handshake`] on a library failure.
    pub fn write_message_1(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Initiator || self.phase != HandshakePhase::Uninitiated {
            return Err(CryptoError::InvalidHandshakeState);
        }

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut message)?;
        message.truncate(len);

        self.phase = HandshakePhase::Sent1;
        Ok(message)
    }

    /// Responder: consume message 1, returning its payload.
    ///
    /// Fails when the initiator encrypted toward a different responder
    /// identity; nothing about the initiator is learned in that case.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] out of phase, or
    /// [`CryptoError::Handshake`] if the message does not authenticate.
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Responder || self.phase != HandshakePhase::Uninitiated {
            return Err(CryptoError::InvalidHandshakeState);
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = match self.state.read_message(message, &mut payload) {
            Ok(len) => len,
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                return Err(e.into());
            }
        };
        payload.truncate(len);

        self.phase = HandshakePhase::Sent1;
        Ok(payload)
    }

    /// Responder: produce message 2 (`e ‖ payload`).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] out of phase, or
    /// [`CryptoError::Handshake`] on a library failure.
    pub fn write_message_2(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Responder || self.phase != HandshakePhase::Sent1 {
            return Err(CryptoError::InvalidHandshakeState);
        }

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut message)?;
        message.truncate(len);

        self.phase = HandshakePhase::Established;
        Ok(message)
    }

    /// Initiator: consume message 2, returning its payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] out of phase, or
    /// [`CryptoError::Handshake`] if the message does not authenticate
    /// (including a responder that holds a different static key than
    /// expected). The phase moves to `Failed` on error.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Initiator || self.phase != HandshakePhase::Sent1 {
            return Err(CryptoError::InvalidHandshakeState);
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = match self.state.read_message(message, &mut payload) {
            Ok(len) => len,
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                return Err(e.into());
            }
        };
        payload.truncate(len);

        self.phase = HandshakePhase::Established;
        Ok(payload)
    }

    /// The peer's static public key, once authenticated.
    ///
    /// For the responder this is available after message 1.
    #[must_use]
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.state.get_remote_static().map(|key| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(key);
            PublicKey::from_bytes(bytes)
        })
    }

    /// Split the completed handshake into directional chain keys.
    ///
    /// The raw split keys come from the Noise chaining key, so they depend
    /// on the ephemeral exchanges and are not derivable from the static
    /// keys alone. Each is passed through HKDF-SHA256 for domain
    /// separation from snow's own cipher usage.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if the handshake is
    /// not established.
    pub fn into_session_keys(mut self) -> Result<SessionKeys, CryptoError> {
        if self.phase != HandshakePhase::Established {
            return Err(CryptoError::InvalidHandshakeState);
        }

        let (raw_i2r, raw_r2i) = self.state.dangerously_get_raw_split();
        let key_i2r = kdf::derive_key(&raw_i2r, b"veil ik chain i2r");
        let key_r2i = kdf::derive_key(&raw_r2i, b"veil ik chain r2i");

        let (send_key, recv_key) = match self.role {
            Role::Initiator => (key_i2r, key_r2i),
            Role::Responder => (key_r2i, key_i2r),
        };

        Ok(SessionKeys { send_key, recv_key })
    }

    /// Split the completed handshake into transport cipher chains.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if the handshake is
    /// not established.
    pub fn into_chains(self) -> Result<(SendChain, RecvChain), CryptoError> {
        let role = self.role;
        let keys = self.into_session_keys()?;

        let (send_dir, recv_dir) = match role {
            Role::Initiator => (DIRECTION_I2R, DIRECTION_R2I),
            Role::Responder => (DIRECTION_R2I, DIRECTION_I2R),
        };

        Ok((
            SendChain::new(&keys.send_key, send_dir),
            RecvChain::new(&keys.recv_key, recv_dir),
        ))
    }
}

fn chain_nonce(direction: &[u8; 16], counter: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(direction);
    nonce[16..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Sending half of a transport session.
///
/// Every sealed packet consumes exactly one counter slot; the counter is
/// authenticated as associated data so a relabeled packet fails to open.
pub struct SendChain {
    cipher: AeadCipher,
    direction: [u8; 16],
    next_counter: u64,
}

impl SendChain {
    fn new(key: &[u8; 32], direction: [u8; 16]) -> Self {
        Self {
            cipher: AeadCipher::new(key),
            direction,
            next_counter: 0,
        }
    }

    /// Encrypt a payload, returning the counter used and the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] when the counter space is
    /// spent; the session must be re-established.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>), CryptoError> {
        if self.next_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let counter = self.next_counter;
        self.next_counter += 1;

        let nonce = chain_nonce(&self.direction, counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext, &counter.to_be_bytes())?;
        Ok((counter, ciphertext))
    }

    /// Counter that the next sealed packet will use.
    #[must_use]
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}

/// Receiving half of a transport session.
pub struct RecvChain {
    cipher: AeadCipher,
    direction: [u8; 16],
    last_seen: Option<u64>,
}

impl RecvChain {
    fn new(key: &[u8; 32], direction: [u8; 16]) -> Self {
        Self {
            cipher: AeadCipher::new(key),
            direction,
            last_seen: None,
        }
    }

    /// Decrypt a packet sealed with the given counter.
    ///
    /// Counters must strictly increase; a replayed or reordered counter is
    /// rejected before any decryption work.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ReplayedCounter`] for a stale counter or
    /// [`CryptoError::DecryptionFailed`] if the tag does not verify.
    pub fn open(&mut self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if let Some(last) = self.last_seen {
            if counter <= last {
                return Err(CryptoError::ReplayedCounter);
            }
        }

        let nonce = chain_nonce(&self.direction, counter);
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext, &counter.to_be_bytes())?;
        self.last_seen = Some(counter);
        Ok(plaintext)
    }
}
