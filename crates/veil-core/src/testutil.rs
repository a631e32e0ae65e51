//! In-memory datagram network for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use veil_transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};

type Router = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>>;

/// A loopback transport: datagrams are routed between transports sharing
/// the same router, with no real socket involved.
pub struct MockTransport {
    addr: SocketAddr,
    router: Router,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
    sent: std::sync::atomic::AtomicU64,
}

impl MockTransport {
    /// Two transports wired to each other.
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let router: Router = Arc::new(Mutex::new(HashMap::new()));
        (
            Arc::new(Self::new(addr_a, Arc::clone(&router))),
            Arc::new(Self::new(addr_b, router)),
        )
    }

    /// A group of transports on one shared network.
    pub fn network(addrs: &[SocketAddr]) -> Vec<Arc<Self>> {
        let router: Router = Arc::new(Mutex::new(HashMap::new()));
        addrs
            .iter()
            .map(|addr| Arc::new(Self::new(*addr, Arc::clone(&router))))
            .collect()
    }

    fn new(addr: SocketAddr, router: Router) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        router.lock().unwrap().insert(addr, tx);
        Self {
            addr,
            router,
            inbox: Mutex::new(rx),
            closed: AtomicBool::new(false),
            sent: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Packets sent through this transport so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        let target = self.router.lock().unwrap().get(&addr).cloned();
        if let Some(tx) = target {
            let _ = tx.send(Datagram {
                data: buf.to_vec(),
                from: self.addr,
            });
        }
        Ok(buf.len())
    }

    fn try_recv(&self) -> Option<Datagram> {
        self.inbox.lock().unwrap().try_recv().ok()
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

/// A unique loopback address per call, for keying mock networks.
pub fn test_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    format!("127.0.0.1:{port}").parse().unwrap()
}
