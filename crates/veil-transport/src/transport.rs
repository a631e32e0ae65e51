//! Transport abstraction.
//!
//! The protocol layers address peers by [`std::net::SocketAddr`] through
//! this trait; no concrete socket type appears in their public APIs.

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket creation or bind failed
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Transport has been closed
    #[error("transport closed")]
    Closed,

    /// Datagram exceeds the maximum size
    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An inbound datagram with its source address.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Raw packet bytes
    pub data: Vec<u8>,
    /// Source address
    pub from: SocketAddr,
}

/// Transport statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors encountered
    pub send_errors: u64,
    /// Inbound datagrams dropped because the queue was full
    pub queue_overflows: u64,
}

/// Datagram transport abstraction.
///
/// Sends are synchronous from the caller's perspective (the OS socket
/// buffer is the only queue). Receives are non-blocking: the protocol
/// tick drains whatever the background reader has enqueued.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a datagram to the given address.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Take the next queued inbound datagram, if any.
    fn try_recv(&self) -> Option<Datagram>;

    /// The locally bound address.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop the transport; subsequent operations fail with
    /// [`TransportError::Closed`].
    fn close(&self);

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;

    /// Statistics snapshot.
    fn stats(&self) -> TransportStats;
}
