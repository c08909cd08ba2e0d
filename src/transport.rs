//! UDP transport: one lazily-bound local endpoint whose inbound datagrams
//! fan out to subscribers.
//!
//! The transport moves bytes and nothing else; it never interprets frames
//! and never retries. The [`Transport`] trait is the seam the session
//! client consumes, so tests can substitute a scripted implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Default device port for the protocol.
pub const DEFAULT_PORT: u16 = 54321;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65535;

/// Inbound callback: raw datagram bytes plus their source address.
pub type InboundHandler = Box<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

type SubscriberTable = DashMap<u64, InboundHandler>;

/// What the session client needs from a transport: fire a datagram at a
/// target, and be told about every datagram that arrives.
pub trait Transport: Send + Sync + 'static {
    /// Transmit one datagram; resolves with the byte count the kernel
    /// accepted, or [`Error::Io`] on network failure.
    fn send(
        &self,
        frame: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Register an inbound callback. Subscribers are invoked in
    /// unspecified order; the returned handle removes exactly this one.
    fn subscribe(&self, handler: InboundHandler) -> Subscription;
}

/// Handle returned by [`Transport::subscribe`].
pub struct Subscription {
    id: u64,
    table: Weak<SubscriberTable>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.id);
        }
    }
}

/// Subscriber fan-out shared by transport implementations.
pub struct Subscribers {
    table: Arc<SubscriberTable>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, handler: InboundHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.insert(id, handler);
        Subscription {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Hand one datagram to every current subscriber.
    pub fn dispatch(&self, bytes: &[u8], from: SocketAddr) {
        for entry in self.table.iter() {
            (entry.value())(bytes, from);
        }
    }

    pub fn clear(&self) {
        self.table.clear();
    }

    fn table(&self) -> Arc<SubscriberTable> {
        Arc::clone(&self.table)
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}

struct Endpoint {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// The real tokio-backed transport. Created once per process and shared
/// by reference among clients.
pub struct UdpTransport {
    endpoint: Mutex<Option<Endpoint>>,
    subscribers: Subscribers,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            endpoint: Mutex::new(None),
            subscribers: Subscribers::new(),
        }
    }

    /// Bind the local endpoint if it is not bound yet. Idempotent; at
    /// most one bind happens per transport instance.
    pub async fn ensure_ready(&self) -> Result<(), Error> {
        self.endpoint().await.map(drop)
    }

    async fn endpoint(&self) -> Result<Arc<UdpSocket>, Error> {
        let mut slot = self.endpoint.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            return Ok(Arc::clone(&endpoint.socket));
        }
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        log::debug!("bound local endpoint {}", socket.local_addr()?);
        let reader = spawn_reader(Arc::clone(&socket), self.subscribers.table());
        *slot = Some(Endpoint {
            socket: Arc::clone(&socket),
            reader,
        });
        Ok(socket)
    }

    /// Release the endpoint and drop all subscriptions.
    pub async fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().await.take() {
            endpoint.reader.abort();
        }
        self.subscribers.clear();
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(socket: Arc<UdpSocket>, table: Arc<SubscriberTable>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    log::trace!("{} bytes from {}", len, from);
                    for entry in table.iter() {
                        (entry.value())(&buf[..len], from);
                    }
                }
                // An unconnected UDP socket surfaces stray errors here,
                // e.g. ECONNRESET from an ICMP port-unreachable for an
                // earlier send_to. The endpoint is bound once for the
                // transport's lifetime, so keep receiving.
                Err(err) => log::warn!("udp receive failed: {}", err),
            }
        }
    })
}

impl Transport for UdpTransport {
    async fn send(&self, frame: &[u8], target: SocketAddr) -> Result<usize, Error> {
        let socket = self.endpoint().await?;
        let sent = socket.send_to(frame, target).await?;
        log::debug!("sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    fn subscribe(&self, handler: InboundHandler) -> Subscription {
        self.subscribers.add(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn unsubscribe_removes_exactly_one() {
        let subscribers = Subscribers::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&first);
        let sub_a = subscribers.add(Box::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        let hits = Arc::clone(&second);
        let _sub_b = subscribers.add(Box::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        subscribers.dispatch(b"x", addr(1));
        sub_a.unsubscribe();
        subscribers.dispatch(b"y", addr(1));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_after_clear_is_harmless() {
        let subscribers = Subscribers::new();
        let sub = subscribers.add(Box::new(|_, _| {}));
        subscribers.clear();
        sub.unsubscribe();
        subscribers.dispatch(b"z", addr(1));
    }
}
