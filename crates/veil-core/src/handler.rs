//! Event handler registration.
//!
//! The embedder registers one handler; all methods default to no-ops so
//! a handler only implements what it cares about. Handlers are invoked
//! from the tick and must return promptly.

use crate::message::MessageType;
use crate::PeerKey;

/// Callbacks delivered by the core.
pub trait EventHandler: Send + Sync {
    /// A message arrived, either over the direct path or via async
    /// delivery. Duplicate async copies are filtered before this fires.
    fn on_message(&self, _sender: PeerKey, _message_type: MessageType, _payload: &[u8]) {}

    /// A friend's online state flipped.
    fn on_friend_status_change(&self, _friend: PeerKey, _online: bool) {}

    /// A peer asked for this node's pre-key bundle.
    fn on_pre_key_request(&self, _requester: PeerKey) {}
}

/// Handler that ignores every event; used when none is registered.
pub(crate) struct NullHandler;

impl EventHandler for NullHandler {}
