//! # VEIL Transport
//!
//! Datagram transport for the VEIL protocol.
//!
//! The protocol core never touches a socket directly: it speaks to the
//! [`transport::Transport`] trait, and the concrete [`udp::UdpTransport`]
//! owns the single UDP socket. Inbound datagrams land in a bounded queue
//! drained by the protocol tick; sends go straight to the socket.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp;

pub use transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;

/// Largest datagram the transport will send or surface (64 KiB).
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Default depth of the bounded inbound queue.
pub const DEFAULT_RECV_QUEUE_DEPTH: usize = 1024;
