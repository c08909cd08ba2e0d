//! The session client: handshake lifecycle, stamp projection, request-id
//! allocation, and the pending-call registry that matches asynchronous
//! inbound datagrams back to their callers.
//!
//! One client instance talks to one device. Concurrent calls on the same
//! client are multiplexed over the shared transport; replies are
//! demultiplexed by the JSON `id` inside the decrypted body.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{self, Duration, Instant};

use crate::codec::{self, Request, Response};
use crate::crypto::{self, Token};
use crate::error::Error;
use crate::packet::Packet;
use crate::transport::{Subscription, Transport, DEFAULT_PORT};

/// Reserved pending-registry key for the in-flight handshake. The hello
/// reply carries no request id of its own; the allocator starts below
/// 10000 and pre-increments, so a normal call can only reach this key
/// after a full counter wrap.
const HELLO_KEY: u32 = 0;

/// Tunables for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device UDP port.
    pub port: u16,
    /// How long a handshake result stays reusable.
    pub handshake_ttl: Duration,
    /// Per-attempt reply deadline.
    pub request_timeout: Duration,
    /// Attempts per user call, including the first.
    pub max_attempts: u32,
    /// Starting value for the request-id counter; random below 10000 when
    /// unset.
    pub initial_request_id: Option<u32>,
    /// Pause after a fresh handshake. Some firmware drops requests that
    /// arrive immediately behind the hello reply.
    pub handshake_settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handshake_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_request_id: None,
            handshake_settle: Duration::from_millis(100),
        }
    }
}

/// Parsed reply body of a method call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_time: Option<u64>,
}

/// The `error` object a device returns instead of a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: Value,
    #[serde(default)]
    pub message: String,
}

impl RemoteFault {
    fn code_string(&self) -> String {
        match &self.code {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// What the device reported in its hello reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloInfo {
    pub device_id: u32,
    pub stamp: u32,
}

/// Payload carried through the pending registry to a waiting caller.
#[derive(Debug)]
enum Inbound {
    Hello { device_id: u32, stamp: u32 },
    Reply(Value),
}

type Resolver = oneshot::Sender<Result<Inbound, Error>>;

#[derive(Debug, Clone, Copy)]
struct HandshakeState {
    device_id: u32,
    device_stamp: u32,
    refreshed_at: Instant,
}

impl HandshakeState {
    /// Project the device stamp forward by whole seconds since the
    /// handshake. Within the same second, concurrent calls reuse the same
    /// stamp.
    fn stamp_now(&self) -> u32 {
        self.device_stamp
            .wrapping_add(self.refreshed_at.elapsed().as_secs() as u32)
    }
}

/// State the inbound dispatcher shares with callers.
struct Shared {
    token: Token,
    target: SocketAddr,
    request_counter: AtomicU32,
    pending: DashMap<u32, Resolver>,
    handshake: Mutex<Option<HandshakeState>>,
    closed: AtomicBool,
}

impl Shared {
    /// Inbound path: filter by source, parse, classify, resolve.
    fn dispatch(&self, bytes: &[u8], from: SocketAddr) {
        if from != self.target {
            log::trace!("ignoring datagram from {} (target is {})", from, self.target);
            return;
        }
        let packet = match Packet::parse(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("dropping frame from {}: {}", from, err);
                return;
            }
        };
        match codec::deserialize_response(&packet, &self.token) {
            Ok(Response::Handshake { device_id, stamp }) => {
                self.resolve(HELLO_KEY, Ok(Inbound::Hello { device_id, stamp }));
            }
            Ok(Response::Normal { body, .. }) => match serde_json::from_slice::<Value>(&body) {
                Ok(value) => match value.get("id").and_then(Value::as_u64) {
                    Some(id) => self.resolve(id as u32, Ok(Inbound::Reply(value))),
                    None => log::warn!("dropping reply without an id: {}", value),
                },
                Err(err) => log::warn!("dropping reply with non-JSON body: {}", err),
            },
            Err(Error::ChecksumMismatch) => self.attribute_checksum_mismatch(&packet),
            Err(err) => log::warn!("dropping frame from {}: {}", from, err),
        }
    }

    /// A tampered checksum field leaves the ciphertext intact, so a
    /// best-effort decrypt can still recover the request id and let the
    /// owning call observe the mismatch instead of timing out.
    fn attribute_checksum_mismatch(&self, packet: &Packet) {
        let id = crypto::decrypt(&self.token, &packet.payload)
            .ok()
            .and_then(|plain| serde_json::from_slice::<Value>(&plain).ok())
            .and_then(|value| value.get("id").and_then(Value::as_u64));
        match id {
            Some(id) => self.resolve(id as u32, Err(Error::ChecksumMismatch)),
            None => log::warn!("dropping frame with bad checksum and unreadable body"),
        }
    }

    fn resolve(&self, key: u32, outcome: Result<Inbound, Error>) {
        match self.pending.remove(&key) {
            Some((_, tx)) => {
                // The caller may have timed out between removal and send;
                // the reply is discarded either way.
                let _ = tx.send(outcome);
            }
            None => log::debug!("no pending call for id {}, dropping late reply", key),
        }
    }
}

/// A single-device protocol client.
///
/// Construct it over a shared transport, [`start`](Client::start) it so
/// replies can be observed, then issue calls with
/// [`send`](Client::send) / [`simple_send`](Client::simple_send).
pub struct Client<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    subscription: Mutex<Option<Subscription>>,
    /// Serializes handshakes: concurrent callers wait here instead of
    /// putting a second hello on the wire.
    handshake_gate: tokio::sync::Mutex<()>,
    config: ClientConfig,
}

impl<T: Transport> Client<T> {
    /// Client with default configuration (port 54321, 10 s timeouts,
    /// 3 attempts). The token is the 32-hex-character external form.
    pub fn new(transport: Arc<T>, token_hex: &str, address: IpAddr) -> Result<Self, Error> {
        Self::with_config(transport, token_hex, address, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<T>,
        token_hex: &str,
        address: IpAddr,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let token = Token::from_hex(token_hex)?;
        let initial = config
            .initial_request_id
            .unwrap_or_else(|| rand::rng().random_range(0..10_000));
        let shared = Arc::new(Shared {
            token,
            target: SocketAddr::new(address, config.port),
            request_counter: AtomicU32::new(initial),
            pending: DashMap::new(),
            handshake: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok(Self {
            transport,
            shared,
            subscription: Mutex::new(None),
            handshake_gate: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// The device endpoint this client is bound to.
    pub fn target(&self) -> SocketAddr {
        self.shared.target
    }

    /// Attach the inbound dispatcher to the transport. Without this no
    /// reply can ever be observed. Repeated calls are no-ops.
    pub fn start(&self) {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            self.transport
                .subscribe(Box::new(move |bytes, from| shared.dispatch(bytes, from))),
        );
    }

    /// Drop the cached handshake; the next call re-handshakes.
    pub fn invalidate(&self) {
        *self.shared.handshake.lock() = None;
    }

    /// Cancel every pending call with [`Error::SessionClosed`] and detach
    /// from the transport. Subsequent calls fail with the same error.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        let ids: Vec<u32> = self.shared.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.shared.pending.remove(&id) {
                let _ = tx.send(Err(Error::SessionClosed));
            }
        }
    }

    /// Handshake with the device (or reuse a cached handshake) and report
    /// its identity.
    pub async fn hello(&self) -> Result<HelloInfo, Error> {
        let state = self.ensure_handshake().await?;
        Ok(HelloInfo {
            device_id: state.device_id,
            stamp: state.device_stamp,
        })
    }

    /// Call `method` on the device and return the parsed reply body.
    ///
    /// Failed attempts (timeout, i/o, wire-level errors) are retried up
    /// to `max_attempts` times, each with a fresh request id; exhaustion
    /// yields [`Error::RetryExhausted`] wrapping the last failure. A
    /// reply body carrying an `error` field is still a successful call
    /// here; see [`simple_send`](Client::simple_send).
    pub async fn send(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<DeviceReply, Error> {
        let params = serde_json::to_value(params)?;
        let mut last: Option<Error> = None;
        for attempt in 1..=self.config.max_attempts {
            match self.call_once(method, &params).await {
                Ok(reply) => return Ok(reply),
                Err(err @ Error::SessionClosed) => return Err(err),
                Err(err) => {
                    log::warn!(
                        "{} attempt {}/{} failed: {}",
                        method,
                        attempt,
                        self.config.max_attempts,
                        err
                    );
                    last = Some(err);
                }
            }
        }
        Err(Error::RetryExhausted {
            attempts: self.config.max_attempts,
            last: Box::new(last.unwrap_or(Error::Timeout)),
        })
    }

    /// Like [`send`](Client::send), but treat an `error` body as failure.
    /// The resulting [`Error::Remote`] is a semantic answer from the
    /// device and is never retried.
    pub async fn simple_send(&self, method: &str, params: impl Serialize) -> Result<(), Error> {
        let reply = self.send(method, params).await?;
        match reply.error {
            Some(fault) => Err(Error::Remote {
                code: fault.code_string(),
                message: fault.message,
            }),
            None => Ok(()),
        }
    }

    /// One attempt: handshake, allocate id, encrypt, transmit, await.
    async fn call_once(&self, method: &str, params: &Value) -> Result<DeviceReply, Error> {
        let handshake = self.ensure_handshake().await?;

        let request_id = self
            .shared
            .request_counter
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        let body = json!({ "id": request_id, "method": method, "params": params }).to_string();

        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);

        let request = Request::Normal {
            device_id: handshake.device_id,
            stamp: handshake.stamp_now(),
            body: &body,
        };
        let frame = match codec::serialize_request(&request, &self.shared.token)
            .and_then(|packet| packet.to_bytes())
        {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.pending.remove(&request_id);
                return Err(err);
            }
        };
        log::trace!("request {}: {}", request_id, body);
        if let Err(err) = self.transport.send(&frame, self.shared.target).await {
            self.shared.pending.remove(&request_id);
            return Err(err);
        }

        match time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(Ok(Inbound::Reply(value)))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Ok(Inbound::Hello { .. }))) => Err(Error::MalformedFrame {
                field: "payload",
                detail: "hello reply resolved a method call".into(),
            }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Return a usable handshake, performing one if the cached result is
    /// missing, expired, or invalidated. Only one hello is ever in
    /// flight; concurrent callers wait on the gate and reuse the fresh
    /// result.
    async fn ensure_handshake(&self) -> Result<HandshakeState, Error> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        if let Some(state) = self.fresh_handshake() {
            return Ok(state);
        }
        let _gate = self.handshake_gate.lock().await;
        if let Some(state) = self.fresh_handshake() {
            return Ok(state);
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(HELLO_KEY, tx);
        let frame = codec::serialize_request(&Request::Handshake, &self.shared.token)?
            .to_bytes()?;
        log::debug!("handshaking with {}", self.shared.target);
        if let Err(err) = self.transport.send(&frame, self.shared.target).await {
            self.shared.pending.remove(&HELLO_KEY);
            return Err(err);
        }
        let reply = match time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(Error::SessionClosed),
            Err(_) => {
                self.shared.pending.remove(&HELLO_KEY);
                return Err(Error::Timeout);
            }
        };
        let state = match reply {
            Inbound::Hello { device_id, stamp } => HandshakeState {
                device_id,
                device_stamp: stamp,
                refreshed_at: Instant::now(),
            },
            Inbound::Reply(_) => {
                return Err(Error::MalformedFrame {
                    field: "payload",
                    detail: "method reply resolved the handshake".into(),
                })
            }
        };
        log::debug!(
            "handshake done: device_id={} stamp={}",
            state.device_id,
            state.device_stamp
        );
        *self.shared.handshake.lock() = Some(state);
        time::sleep(self.config.handshake_settle).await;
        Ok(state)
    }

    fn fresh_handshake(&self) -> Option<HandshakeState> {
        (*self.shared.handshake.lock())
            .filter(|state| state.refreshed_at.elapsed() <= self.config.handshake_ttl)
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.close();
    }
}
