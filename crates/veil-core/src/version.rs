//! Protocol versions and per-node capabilities.

use crate::error::{Error, Result};
use std::time::Duration;

/// Wire byte signalling "no common version" in a negotiation response.
pub const NO_COMMON_VERSION_BYTE: u8 = 0xFF;

/// A protocol version a peer can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// Static-key authenticated encryption, no forward secrecy
    Legacy = 0x01,
    /// Noise-IK sessions with forward secrecy and KCI resistance
    NoiseIk = 0x02,
}

impl ProtocolVersion {
    /// Serialize as a single byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse from a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Legacy),
            0x02 => Some(Self::NoiseIk),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::NoiseIk => write!(f, "noise-ik"),
        }
    }
}

/// The local node's protocol capabilities.
#[derive(Debug, Clone)]
pub struct ProtocolCapabilities {
    supported: Vec<ProtocolVersion>,
    preferred: ProtocolVersion,
    fallback_enabled: bool,
    negotiation_timeout: Duration,
}

impl ProtocolCapabilities {
    /// Build a capability set.
    ///
    /// The supported list is ordered by preference after `preferred`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `preferred` is not in `supported` or
    /// the supported list is empty.
    pub fn new(
        supported: Vec<ProtocolVersion>,
        preferred: ProtocolVersion,
        fallback_enabled: bool,
        negotiation_timeout: Duration,
    ) -> Result<Self> {
        if supported.is_empty() {
            return Err(Error::invalid_argument("no supported versions"));
        }
        if !supported.contains(&preferred) {
            return Err(Error::invalid_argument(
                "preferred version not in supported set",
            ));
        }
        Ok(Self {
            supported,
            preferred,
            fallback_enabled,
            negotiation_timeout,
        })
    }

    /// Supported versions, preference-ordered.
    #[must_use]
    pub fn supported(&self) -> &[ProtocolVersion] {
        &self.supported
    }

    /// The version this node opens with.
    #[must_use]
    pub fn preferred(&self) -> ProtocolVersion {
        self.preferred
    }

    /// Whether falling back to older versions is allowed.
    #[must_use]
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    /// How long to wait for a negotiation before falling back or failing.
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }

    /// Whether the given version is supported locally.
    #[must_use]
    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.supported.contains(&version)
    }

    /// Best common version with a peer's advertised set, by local
    /// preference order.
    #[must_use]
    pub fn best_common(&self, peer_versions: &[ProtocolVersion]) -> Option<ProtocolVersion> {
        if peer_versions.contains(&self.preferred) {
            return Some(self.preferred);
        }
        self.supported
            .iter()
            .copied()
            .find(|v| peer_versions.contains(v))
    }
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self {
            supported: vec![ProtocolVersion::NoiseIk, ProtocolVersion::Legacy],
            preferred: ProtocolVersion::NoiseIk,
            fallback_enabled: true,
            negotiation_timeout: Duration::from_millis(5000),
        }
    }
}
