//! Packet framing and type-byte classification.
//!
//! Wire form is `[type:1][payload:N]`; all multi-byte integers are
//! big-endian. The type byte partitions the packet space:
//!
//! | Range / byte | Meaning |
//! |---|---|
//! | `0x00..=0x1F` | legacy payload types |
//! | `0x20` / `0x21` | negotiation request / response |
//! | `0x22` / `0x23` | Noise-IK handshake 1 / 2 |
//! | `0x24` | Noise-IK transport |
//! | `0x30..=0x34` | async storage control |
//! | `0x40` / `0x41` | pre-key bundle publish / fetch |
//!
//! Unknown type bytes are dropped with a warning, never fatal.

use crate::error::{Error, Result};

/// Largest packet the codec will produce or accept (64 KiB).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Largest payload: the packet minus its type byte.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - 1;

/// Largest application message accepted by either send path, leaving
/// room for packet headers, nonces, and AEAD tags.
pub const MAX_MESSAGE_SIZE: usize = MAX_PAYLOAD_SIZE - 512;

/// Upper bound of the legacy payload type range.
pub const LEGACY_TYPE_MAX: u8 = 0x1F;

/// The concrete legacy data packet type used by this implementation.
pub const TYPE_LEGACY_DATA: u8 = 0x10;

/// Typed view of the packet space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Legacy payload (`0x00..=0x1F`), decrypted by the legacy protocol
    LegacyData,
    /// Negotiation request: `[version_count:1][versions…]`
    NegotiationRequest,
    /// Negotiation response: `[chosen_version:1]`, `0xFF` for none
    NegotiationResponse,
    /// Noise-IK handshake 1: `[e:32][encrypted_static:48][payload…]`
    HandshakeInit,
    /// Noise-IK handshake 2: `[e:32][payload…]`
    HandshakeResponse,
    /// Noise-IK transport: `[counter:8][ciphertext…]`
    Transport,
    /// Async store request: serialized message
    StoreRequest,
    /// Async retrieve request: `[recipient_pub:32]`
    RetrieveRequest,
    /// Async retrieve response: `[count:2][messages…]`
    RetrieveResponse,
    /// Async delete request: `[id:16][recipient_pub:32][authenticator:16]`
    DeleteRequest,
    /// Async store response: `[id:16][status:1]`
    StoreResponse,
    /// Pre-key bundle publish
    BundlePublish,
    /// Pre-key bundle fetch: `[requester_pub:32]`
    BundleFetch,
}

impl PacketType {
    /// Classify a wire type byte. Returns `None` for unknown bytes.
    #[must_use]
    pub fn classify(byte: u8) -> Option<Self> {
        match byte {
            0x00..=LEGACY_TYPE_MAX => Some(Self::LegacyData),
            0x20 => Some(Self::NegotiationRequest),
            0x21 => Some(Self::NegotiationResponse),
            0x22 => Some(Self::HandshakeInit),
            0x23 => Some(Self::HandshakeResponse),
            0x24 => Some(Self::Transport),
            0x30 => Some(Self::StoreRequest),
            0x31 => Some(Self::RetrieveRequest),
            0x32 => Some(Self::RetrieveResponse),
            0x33 => Some(Self::DeleteRequest),
            0x34 => Some(Self::StoreResponse),
            0x40 => Some(Self::BundlePublish),
            0x41 => Some(Self::BundleFetch),
            _ => None,
        }
    }

    /// Canonical wire byte for this type.
    ///
    /// `LegacyData` maps to the concrete legacy data type this
    /// implementation emits.
    #[must_use]
    pub fn byte(self) -> u8 {
        match self {
            Self::LegacyData => TYPE_LEGACY_DATA,
            Self::NegotiationRequest => 0x20,
            Self::NegotiationResponse => 0x21,
            Self::HandshakeInit => 0x22,
            Self::HandshakeResponse => 0x23,
            Self::Transport => 0x24,
            Self::StoreRequest => 0x30,
            Self::RetrieveRequest => 0x31,
            Self::RetrieveResponse => 0x32,
            Self::DeleteRequest => 0x33,
            Self::StoreResponse => 0x34,
            Self::BundlePublish => 0x40,
            Self::BundleFetch => 0x41,
        }
    }

    /// Whether this type is part of the async storage control plane.
    #[must_use]
    pub fn is_async_control(self) -> bool {
        matches!(
            self,
            Self::StoreRequest
                | Self::RetrieveRequest
                | Self::RetrieveResponse
                | Self::DeleteRequest
                | Self::StoreResponse
                | Self::BundlePublish
                | Self::BundleFetch
        )
    }
}

/// A framed packet: one type byte plus a bounded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw wire type byte
    pub type_byte: u8,
    /// Payload bytes (≤ [`MAX_PAYLOAD_SIZE`])
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet of the given type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn new(ty: PacketType, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::invalid_argument("payload exceeds packet bound"));
        }
        Ok(Self {
            type_byte: ty.byte(),
            payload,
        })
    }

    /// Parse a raw datagram.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty or oversized datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.is_empty() {
            return Err(Error::invalid_argument("empty datagram"));
        }
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(Error::invalid_argument("datagram exceeds packet bound"));
        }
        Ok(Self {
            type_byte: datagram[0],
            payload: datagram[1..].to_vec(),
        })
    }

    /// Classified type, if the type byte is known.
    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::classify(self.type_byte)
    }

    /// Serialize to wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.type_byte);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Bounds-checked big-endian reader over a packet payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::invalid_argument("truncated packet"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array::<8>()?))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_types() {
        assert_eq!(PacketType::classify(0x00), Some(PacketType::LegacyData));
        assert_eq!(PacketType::classify(0x10), Some(PacketType::LegacyData));
        assert_eq!(PacketType::classify(0x1F), Some(PacketType::LegacyData));
        assert_eq!(
            PacketType::classify(0x20),
            Some(PacketType::NegotiationRequest)
        );
        assert_eq!(PacketType::classify(0x22), Some(PacketType::HandshakeInit));
        assert_eq!(PacketType::classify(0x24), Some(PacketType::Transport));
        assert_eq!(PacketType::classify(0x30), Some(PacketType::StoreRequest));
        assert_eq!(PacketType::classify(0x34), Some(PacketType::StoreResponse));
        assert_eq!(PacketType::classify(0x41), Some(PacketType::BundleFetch));
    }

    #[test]
    fn test_classify_unknown_types() {
        assert_eq!(PacketType::classify(0x25), None);
        assert_eq!(PacketType::classify(0x50), None);
        assert_eq!(PacketType::classify(0xFF), None);
    }

    #[test]
    fn test_round_trip() {
        let packet = Packet::new(PacketType::Transport, vec![1, 2, 3]).unwrap();
        let wire = packet.encode();
        assert_eq!(wire, vec![0x24, 1, 2, 3]);

        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.packet_type(), Some(PacketType::Transport));
    }

    #[test]
    fn test_empty_datagram_rejected() {
        assert!(Packet::parse(&[]).is_err());
    }

    #[test]
    fn test_payload_bound_enforced() {
        let oversized = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(Packet::new(PacketType::Transport, oversized).is_err());

        let max = vec![0u8; MAX_PAYLOAD_SIZE];
        assert!(Packet::new(PacketType::Transport, max).is_ok());
    }

    #[test]
    fn test_async_control_partition() {
        assert!(PacketType::StoreRequest.is_async_control());
        assert!(PacketType::BundlePublish.is_async_control());
        assert!(!PacketType::Transport.is_async_control());
        assert!(!PacketType::LegacyData.is_async_control());
    }

    #[test]
    fn test_reader_bounds() {
        let buf = [0x01, 0x02, 0x03];
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.u8().unwrap(), 0x01);
        assert_eq!(reader.u16().unwrap(), 0x0203);
        assert!(reader.u8().is_err());
    }

    #[test]
    fn test_reader_big_endian() {
        let buf = 0x0102030405060708u64.to_be_bytes();
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.u64().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn test_reader_rest() {
        let buf = [1u8, 2, 3, 4];
        let mut reader = Reader::new(&buf);
        reader.u8().unwrap();
        assert_eq!(reader.rest(), &[2, 3, 4]);
        assert_eq!(reader.remaining(), 0);
    }
}
