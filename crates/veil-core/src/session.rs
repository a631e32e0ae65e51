//! Per-peer negotiated session state.
//!
//! A session exists only for Noise-IK peers; legacy peers need no state
//! beyond the version cache entry. Sessions are created by a completed
//! handshake, touched by every packet, and expired after five idle
//! minutes.

use crate::PeerKey;
use crate::error::Result;
use veil_crypto::noise::{RecvChain, SendChain};
use std::time::{Duration, Instant};

/// Consecutive decryption failures before the version cache entry for
/// the peer is invalidated and the session renegotiated.
pub const DECRYPT_FAILURE_LIMIT: u32 = 3;

/// Default idle timeout.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An established Noise-IK session with one peer.
pub struct Session {
    peer: PeerKey,
    send: SendChain,
    recv: RecvChain,
    created: Instant,
    last_activity: Instant,
    decrypt_failures: u32,
}

impl Session {
    /// Wrap the chains produced by a completed handshake.
    #[must_use]
    pub fn new(peer: PeerKey, send: SendChain, recv: RecvChain) -> Self {
        let now = Instant::now();
        Self {
            peer,
            send,
            recv,
            created: now,
            last_activity: now,
            decrypt_failures: 0,
        }
    }

    /// The authenticated peer identity.
    #[must_use]
    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    /// When the session was established.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Encrypt an outgoing payload, consuming one counter slot.
    ///
    /// # Errors
    ///
    /// Propagates `Crypto` failures, including counter exhaustion.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        let sealed = self.send.seal(plaintext)?;
        self.last_activity = Instant::now();
        Ok(sealed)
    }

    /// Decrypt an incoming transport packet.
    ///
    /// Success resets the failure streak; failure lengthens it. The
    /// caller tears the session down once [`failure_streak`] reaches
    /// [`DECRYPT_FAILURE_LIMIT`].
    ///
    /// [`failure_streak`]: Session::failure_streak
    ///
    /// # Errors
    ///
    /// Propagates `Crypto` failures, including replayed counters.
    pub fn open(&mut self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.recv.open(counter, ciphertext) {
            Ok(plaintext) => {
                self.decrypt_failures = 0;
                self.last_activity = Instant::now();
                Ok(plaintext)
            }
            Err(e) => {
                self.decrypt_failures += 1;
                Err(e.into())
            }
        }
    }

    /// Consecutive decryption failures since the last success.
    #[must_use]
    pub fn failure_streak(&self) -> u32 {
        self.decrypt_failures
    }

    /// Whether the session has been idle longer than `timeout` at `now`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use veil_crypto::noise::IkHandshake;
    use veil_crypto::x25519::PrivateKey;

    fn session_pair() -> (Session, Session) {
        let alice = PrivateKey::generate(&mut OsRng);
        let bob = PrivateKey::generate(&mut OsRng);

        let mut initiator = IkHandshake::initiate(&alice, &bob.public_key()).unwrap();
        let mut responder = IkHandshake::respond(&bob).unwrap();

        let msg1 = initiator.write_message_1(&[]).unwrap();
        responder.read_message_1(&msg1).unwrap();
        let msg2 = responder.write_message_2(&[]).unwrap();
        initiator.read_message_2(&msg2).unwrap();

        let (a_send, a_recv) = initiator.into_chains().unwrap();
        let (b_send, b_recv) = responder.into_chains().unwrap();

        (
            Session::new(bob.public_key().to_bytes(), a_send, a_recv),
            Session::new(alice.public_key().to_bytes(), b_send, b_recv),
        )
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (mut alice, mut bob) = session_pair();

        let (counter, ct) = alice.seal(b"direct message").unwrap();
        assert_eq!(bob.open(counter, &ct).unwrap(), b"direct message");
    }

    #[test]
    fn test_failure_streak_resets_on_success() {
        let (mut alice, mut bob) = session_pair();

        assert!(bob.open(0, b"garbage that is long enough").is_err());
        assert!(bob.open(1, b"more garbage of ample length").is_err());
        assert_eq!(bob.failure_streak(), 2);

        let (counter, ct) = alice.seal(b"real").unwrap();
        bob.open(counter, &ct).unwrap();
        assert_eq!(bob.failure_streak(), 0);
    }

    #[test]
    fn test_idle_detection() {
        let (session, _) = session_pair();
        let now = Instant::now();
        assert!(!session.is_idle(now, Duration::from_secs(300)));
        assert!(session.is_idle(now + Duration::from_secs(301), Duration::from_secs(300)));
    }
}
