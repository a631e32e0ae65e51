//! Node configuration.
//!
//! No configuration file is read; the embedder passes every option.

use crate::version::{ProtocolCapabilities, ProtocolVersion};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::node::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local UDP listen address
    pub listen_addr: SocketAddr,

    /// Enable the UDP transport
    pub udp_enabled: bool,

    /// Versions this node speaks, preference-ordered
    pub supported_versions: Vec<ProtocolVersion>,

    /// Version this node opens with
    pub preferred_version: ProtocolVersion,

    /// Whether to fall back to legacy when negotiation stalls
    pub enable_legacy_fallback: bool,

    /// How long to wait on a version negotiation
    pub negotiation_timeout: Duration,

    /// How long a pending store request may stay unacknowledged
    pub store_request_timeout: Duration,

    /// Serve storage requests from other peers
    pub async_storage_enabled: bool,

    /// One-time pre-keys generated per batch
    pub pre_key_batch_size: usize,

    /// Storage nodes each async message is replicated to
    pub storage_quorum: usize,

    /// Messages returned per retrieve request
    pub retrieve_batch_size: usize,

    /// Depth of the bounded inbound datagram queue
    pub recv_queue_depth: usize,

    /// Concurrent store requests allowed per destination
    pub max_inflight_per_node: usize,

    /// Overflow queue bound beyond the in-flight cap
    pub max_queued_store_requests: usize,

    /// Idle sessions older than this are expired
    pub session_idle_timeout: Duration,

    /// Lifetime of the signed pre-key before rotation
    pub signed_pre_key_lifetime: Duration,

    /// Directory for the pre-key store and async message log
    pub data_dir: PathBuf,
}

impl NodeConfig {
    /// Derive the capability set from the version options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the preferred version is not in the
    /// supported set.
    pub fn capabilities(&self) -> crate::error::Result<ProtocolCapabilities> {
        ProtocolCapabilities::new(
            self.supported_versions.clone(),
            self.preferred_version,
            self.enable_legacy_fallback,
            self.negotiation_timeout,
        )
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Port 0 lets the OS pick; embedders with a fixed port set one.
            listen_addr: "0.0.0.0:0".parse().expect("valid literal address"),
            udp_enabled: true,
            supported_versions: vec![ProtocolVersion::NoiseIk, ProtocolVersion::Legacy],
            preferred_version: ProtocolVersion::NoiseIk,
            enable_legacy_fallback: true,
            negotiation_timeout: Duration::from_millis(5000),
            store_request_timeout: Duration::from_secs(10),
            async_storage_enabled: true,
            pre_key_batch_size: 100,
            storage_quorum: 3,
            retrieve_batch_size: 100,
            recv_queue_depth: 1024,
            max_inflight_per_node: 8,
            max_queued_store_requests: 64,
            session_idle_timeout: Duration::from_secs(5 * 60),
            signed_pre_key_lifetime: Duration::from_secs(7 * 24 * 60 * 60),
            data_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert!(config.udp_enabled);
        assert!(config.enable_legacy_fallback);
        assert!(config.async_storage_enabled);
        assert_eq!(config.preferred_version, ProtocolVersion::NoiseIk);
        assert_eq!(config.negotiation_timeout, Duration::from_millis(5000));
        assert_eq!(config.pre_key_batch_size, 100);
        assert_eq!(config.storage_quorum, 3);
        assert_eq!(config.retrieve_batch_size, 100);
        assert_eq!(config.recv_queue_depth, 1024);
        assert_eq!(config.max_inflight_per_node, 8);
    }

    #[test]
    fn test_capabilities_derived() {
        let config = NodeConfig::default();
        let caps = config.capabilities().unwrap();
        assert_eq!(caps.preferred(), ProtocolVersion::NoiseIk);
        assert!(caps.supports(ProtocolVersion::Legacy));
    }

    #[test]
    fn test_inconsistent_versions_rejected() {
        let config = NodeConfig {
            supported_versions: vec![ProtocolVersion::Legacy],
            preferred_version: ProtocolVersion::NoiseIk,
            ..NodeConfig::default()
        };
        assert!(config.capabilities().is_err());
    }
}
