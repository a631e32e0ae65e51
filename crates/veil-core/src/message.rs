//! Async message model and wire serialization.
//!
//! An [`AsyncMessage`] is the unit of store-and-forward delivery: a
//! payload encrypted end-to-end with a one-time pre-key, carried opaque
//! through storage nodes. Wire form is a fixed-size header followed by
//! the variable-length ciphertext:
//!
//! ```text
//! [id:16][recipient:32][sender:32][ephemeral:32][pre_key_id:4]
//! [nonce:24][timestamp_ms:8][type:1][ciphertext_len:4][ciphertext]
//! ```

use crate::error::{Error, Result};
use crate::packet::Reader;
use crate::{MessageId, PeerKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed header size preceding the ciphertext.
pub const ASYNC_HEADER_SIZE: usize = 16 + 32 + 32 + 32 + 4 + 24 + 8 + 1 + 4;

/// How long a stored message stays retrievable.
pub const MESSAGE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Kind of message carried in the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Ordinary chat message
    Normal = 0,
    /// `/me`-style action
    Action = 1,
    /// Protocol-internal notification
    System = 2,
}

impl MessageType {
    /// Serialize as a single byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse from a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Normal),
            1 => Some(Self::Action),
            2 => Some(Self::System),
            _ => None,
        }
    }
}

/// A store-and-forward message, encrypted end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncMessage {
    /// Random 16-byte identifier, unique across a storage node
    pub id: MessageId,
    /// Recipient identity public key
    pub recipient: PeerKey,
    /// Sender identity public key
    pub sender: PeerKey,
    /// Sender's per-message ephemeral public key
    pub ephemeral: PeerKey,
    /// Which of the recipient's one-time pre-keys was consumed
    pub pre_key_id: u32,
    /// AEAD nonce
    pub nonce: [u8; 24],
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Message kind
    pub message_type: MessageType,
    /// AEAD ciphertext (payload + tag)
    pub ciphertext: Vec<u8>,
}

impl AsyncMessage {
    /// Serialized size on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ASYNC_HEADER_SIZE + self.ciphertext.len()
    }

    /// Whether this message has outlived [`MESSAGE_LIFETIME`] at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) > MESSAGE_LIFETIME.as_millis() as u64
    }

    /// Associated data binding the header to the ciphertext.
    #[must_use]
    pub fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + 32 + 32 + 32 + 4 + 1);
        aad.extend_from_slice(&self.id);
        aad.extend_from_slice(&self.recipient);
        aad.extend_from_slice(&self.sender);
        aad.extend_from_slice(&self.ephemeral);
        aad.extend_from_slice(&self.pre_key_id.to_be_bytes());
        aad.push(self.message_type.to_byte());
        aad
    }

    /// Serialize to wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.pre_key_id.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.push(self.message_type.to_byte());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse from wire form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a truncated header, an unknown
    /// message type, or a ciphertext length that disagrees with the
    /// buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf);
        let id = reader.array::<16>()?;
        let recipient = reader.array::<32>()?;
        let sender = reader.array::<32>()?;
        let ephemeral = reader.array::<32>()?;
        let pre_key_id = reader.u32()?;
        let nonce = reader.array::<24>()?;
        let timestamp_ms = reader.u64()?;
        let type_byte = reader.u8()?;
        let message_type = MessageType::from_byte(type_byte)
            .ok_or_else(|| Error::invalid_argument("unknown message type"))?;
        let ciphertext_len = reader.u32()? as usize;
        if reader.remaining() != ciphertext_len {
            return Err(Error::invalid_argument("ciphertext length mismatch"));
        }
        let ciphertext = reader.rest().to_vec();

        Ok(Self {
            id,
            recipient,
            sender,
            ephemeral,
            pre_key_id,
            nonce,
            timestamp_ms,
            message_type,
            ciphertext,
        })
    }

    /// Decode a sequence of messages prefixed with a 16-bit count,
    /// the payload of a retrieve response.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the buffer does not contain exactly
    /// the declared messages.
    pub fn decode_batch(buf: &[u8]) -> Result<Vec<Self>> {
        let mut reader = Reader::new(buf);
        let count = reader.u16()? as usize;
        let mut messages = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            // Each entry repeats the full wire form; peek its length.
            let header = reader.take(ASYNC_HEADER_SIZE)?;
            let ciphertext_len =
                u32::from_be_bytes([header[149], header[150], header[151], header[152]]) as usize;
            let ciphertext = reader.take(ciphertext_len)?;

            let mut entry = Vec::with_capacity(ASYNC_HEADER_SIZE + ciphertext_len);
            entry.extend_from_slice(header);
            entry.extend_from_slice(ciphertext);
            messages.push(Self::decode(&entry)?);
        }
        if reader.remaining() != 0 {
            return Err(Error::invalid_argument("trailing bytes after batch"));
        }
        Ok(messages)
    }

    /// Encode a batch of messages for a retrieve response.
    #[must_use]
    pub fn encode_batch(messages: &[Self]) -> Vec<u8> {
        let total: usize = messages.iter().map(Self::encoded_len).sum();
        let mut out = Vec::with_capacity(2 + total);
        out.extend_from_slice(&(messages.len() as u16).to_be_bytes());
        for msg in messages {
            out.extend_from_slice(&msg.encode());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> AsyncMessage {
        AsyncMessage {
            id: [1u8; 16],
            recipient: [2u8; 32],
            sender: [3u8; 32],
            ephemeral: [4u8; 32],
            pre_key_id: 0xDEADBEEF,
            nonce: [5u8; 24],
            timestamp_ms: 1_700_000_000_000,
            message_type: MessageType::Normal,
            ciphertext: vec![9u8; 48],
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let msg = sample_message();
        let wire = msg.encode();
        assert_eq!(wire.len(), msg.encoded_len());

        let decoded = AsyncMessage::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_header_is_fixed_size() {
        assert_eq!(ASYNC_HEADER_SIZE, 153);
    }

    #[test]
    fn test_truncated_rejected() {
        let wire = sample_message().encode();
        assert!(AsyncMessage::decode(&wire[..wire.len() - 1]).is_err());
        assert!(AsyncMessage::decode(&wire[..ASYNC_HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut wire = sample_message().encode();
        wire.push(0xAA);
        assert!(AsyncMessage::decode(&wire).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut wire = sample_message().encode();
        // Type byte sits right after the timestamp.
        wire[16 + 32 + 32 + 32 + 4 + 24 + 8] = 0x7F;
        assert!(AsyncMessage::decode(&wire).is_err());
    }

    #[test]
    fn test_expiry() {
        let msg = sample_message();
        let lifetime_ms = MESSAGE_LIFETIME.as_millis() as u64;
        assert!(!msg.is_expired(msg.timestamp_ms));
        assert!(!msg.is_expired(msg.timestamp_ms + lifetime_ms));
        assert!(msg.is_expired(msg.timestamp_ms + lifetime_ms + 1));
    }

    #[test]
    fn test_batch_round_trip() {
        let mut second = sample_message();
        second.id = [7u8; 16];
        second.ciphertext = vec![1u8; 16];
        second.message_type = MessageType::Action;
        let messages = vec![sample_message(), second];

        let wire = AsyncMessage::encode_batch(&messages);
        let decoded = AsyncMessage::decode_batch(&wire).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_empty_batch() {
        let wire = AsyncMessage::encode_batch(&[]);
        assert_eq!(AsyncMessage::decode_batch(&wire).unwrap(), vec![]);
    }

    #[test]
    fn test_batch_trailing_bytes_rejected() {
        let mut wire = AsyncMessage::encode_batch(&[sample_message()]);
        wire.push(0);
        assert!(AsyncMessage::decode_batch(&wire).is_err());
    }

    #[test]
    fn test_aad_binds_routing_fields() {
        let msg = sample_message();
        let mut altered = msg.clone();
        altered.pre_key_id += 1;
        assert_ne!(msg.aad(), altered.aad());
    }
}
