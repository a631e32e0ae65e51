//! Friend state read view.
//!
//! The friend graph itself is owned by the embedder; the async manager
//! holds this read view and is told about status changes through
//! [`crate::node::Node::set_friend_status`].

use crate::PeerKey;
use std::net::SocketAddr;
use std::time::Instant;

/// What the core knows about one friend.
#[derive(Debug, Clone)]
pub struct FriendState {
    /// The friend's identity public key
    pub public_key: PeerKey,
    /// Whether the friend is currently believed online
    pub known_online: bool,
    /// When the friend was last observed online
    pub last_seen: Option<Instant>,
    /// Last known network address, present while online
    pub address: Option<SocketAddr>,
}

impl FriendState {
    /// A freshly added friend: offline, never seen.
    #[must_use]
    pub fn new(public_key: PeerKey) -> Self {
        Self {
            public_key,
            known_online: false,
            last_seen: None,
            address: None,
        }
    }

    /// Record a status flip. Returns `true` if the online state changed.
    pub fn set_online(&mut self, online: bool, address: Option<SocketAddr>) -> bool {
        let changed = self.known_online != online;
        self.known_online = online;
        if online {
            self.last_seen = Some(Instant::now());
            if address.is_some() {
                self.address = address;
            }
        } else {
            self.address = None;
        }
        changed
    }
}
