//! # VEIL Core
//!
//! Core protocol implementation for VEIL, a decentralized friend-to-friend
//! secure messaging system.
//!
//! Two subsystems make up the core:
//!
//! - **Negotiating secure transport** ([`negotiate`]): bridges the legacy
//!   static-key authenticated-encryption protocol with Noise-IK sessions,
//!   detecting per peer which protocol to speak and falling back when
//!   configured to.
//! - **Async message delivery** ([`manager`], [`store`], [`prekey`]): a
//!   store-and-forward layer where every participant is also a storage
//!   node. Messages for offline recipients are encrypted with one-time
//!   pre-keys and replicated to a quorum of peers, then fetched when the
//!   recipient reconnects.
//!
//! The embedder drives everything through [`node::Node`]: call
//! [`node::Node::iterate`] at roughly the interval returned by
//! [`node::Node::iteration_interval`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod friend;
pub mod handler;
pub mod manager;
pub mod message;
pub mod negotiate;
pub mod node;
pub mod packet;
pub mod prekey;
pub mod session;
pub mod store;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::NodeConfig;
pub use error::{Error, ErrorKind, Result};
pub use handler::EventHandler;
pub use message::{AsyncMessage, MessageType};
pub use node::Node;
pub use version::{ProtocolCapabilities, ProtocolVersion};

/// A peer's stable identifier: its X25519 identity public key.
pub type PeerKey = [u8; 32];

/// A unique async message identifier.
pub type MessageId = [u8; 16];

pub(crate) mod util {
    /// Milliseconds since the Unix epoch.
    pub fn unix_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Short hex prefix of a peer key for log output.
    pub fn key_prefix(key: &[u8; 32]) -> String {
        hex::encode(&key[..4])
    }
}
