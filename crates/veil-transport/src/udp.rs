//! UDP transport implementation.
//!
//! A single socket bound at construction via `socket2` (so buffer sizes
//! can be set before bind), wrapped in a Tokio socket. A background task
//! reads the socket and feeds a bounded queue; when the queue is full the
//! newest datagram is dropped and counted, never blocking the reader.

use crate::transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};
use crate::{DEFAULT_RECV_QUEUE_DEPTH, MAX_DATAGRAM_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    queue_overflows: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
        }
    }
}

/// UDP transport with a bounded inbound queue.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    queue: std::sync::Mutex<mpsc::Receiver<Datagram>>,
    reader: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl UdpTransport {
    /// Bind a new transport with the default queue depth.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the socket cannot be
    /// created or bound.
    pub fn bind(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with_queue_depth(addr, DEFAULT_RECV_QUEUE_DEPTH)
    }

    /// Bind a new transport with an explicit inbound queue depth.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the socket cannot be
    /// created or bound.
    pub fn bind_with_queue_depth(addr: SocketAddr, queue_depth: usize) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .set_recv_buffer_size(2 * 1024 * 1024)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(2 * 1024 * 1024)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = Arc::new(
            UdpSocket::from_std(std_socket)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?,
        );

        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::new());

        let reader = tokio::spawn(Self::read_loop(
            Arc::clone(&socket),
            tx,
            Arc::clone(&closed),
            Arc::clone(&counters),
        ));

        Ok(Self {
            socket,
            queue: std::sync::Mutex::new(rx),
            reader,
            closed,
            counters,
        })
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<Datagram>,
        closed: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            if closed.load(Ordering::Relaxed) {
                return;
            }

            match socket.recv_from(&mut buf).await {
                Ok((size, from)) => {
                    counters.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                    counters.packets_received.fetch_add(1, Ordering::Relaxed);

                    let datagram = Datagram {
                        data: buf[..size].to_vec(),
                        from,
                    };

                    // Queue full: drop the newest arrival, keep the backlog.
                    if tx.try_send(datagram).is_err() {
                        counters.queue_overflows.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%from, "inbound queue full, dropping datagram");
                    }
                }
                Err(e) => {
                    if closed.load(Ordering::Relaxed) {
                        return;
                    }
                    tracing::debug!(error = %e, "udp receive error");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::TooLarge(buf.len()));
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn try_recv(&self) -> Option<Datagram> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        self.queue
            .lock()
            .expect("inbound queue lock poisoned")
            .try_recv()
            .ok()
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.reader.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            queue_overflows: self.counters.queue_overflows.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
