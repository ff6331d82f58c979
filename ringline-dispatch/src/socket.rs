//! Transport seam between the engine and whatever drives the sockets.
//!
//! The engine never performs I/O. A driver owns the event loop: it asks a
//! [`Connector`] for sockets, feeds their readiness and data back through
//! [`SocketEvents`], and fires timers with [`SocketEvents::tick`]. Writes
//! go out synchronously through [`Socket::write`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::error::DispatchError;

/// A connected byte stream, plain or TLS.
pub trait Socket {
    /// Queues `data` for sending. Returns false once the send buffer is
    /// saturated; the driver reports `on_socket_drain` when it empties.
    fn write(&mut self, data: Bytes) -> bool;

    /// Hold small writes until `uncork`.
    fn cork(&mut self) {}

    fn uncork(&mut self) {}

    /// Stop delivering `on_socket_data`.
    fn pause(&mut self);

    fn resume(&mut self);

    /// Close the socket. The driver still reports `on_socket_close`.
    fn destroy(&mut self);

    /// Protocol negotiated through ALPN, if any.
    fn alpn_protocol(&self) -> Option<&str> {
        None
    }
}

/// Identity of one connect attempt and the socket it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters handed to a [`Connector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Echoed back in `on_connect_result` for a pending attempt.
    pub id: ConnectionId,
    /// `hostname[:port]` as it appears in the origin.
    pub host: String,
    /// Host without port; IPv6 brackets stripped.
    pub hostname: String,
    /// `http:` or `https:`.
    pub protocol: String,
    pub port: u16,
    pub servername: Option<String>,
    pub local_address: Option<String>,
}

/// Result of starting a connection.
pub enum ConnectAttempt {
    /// The connector finished synchronously.
    Ready(Result<Box<dyn Socket>, DispatchError>),
    /// The driver will call `on_connect_result` with the options' id.
    Pending,
}

/// Produces sockets for a client.
pub trait Connector {
    fn connect(&mut self, options: &ConnectOptions) -> ConnectAttempt;
}

impl<F> Connector for F
where
    F: FnMut(&ConnectOptions) -> ConnectAttempt,
{
    fn connect(&mut self, options: &ConnectOptions) -> ConnectAttempt {
        self(options)
    }
}

/// Events a driver feeds into a client or pool.
///
/// Every event for an id the receiver no longer owns is ignored, so a
/// driver may report late events for sockets that were already destroyed.
pub trait SocketEvents {
    /// Completes a connect that returned [`ConnectAttempt::Pending`].
    fn on_connect_result(
        &mut self,
        id: ConnectionId,
        result: Result<Box<dyn Socket>, DispatchError>,
    );

    fn on_socket_data(&mut self, id: ConnectionId, data: &[u8]);

    /// A saturated socket can accept writes again.
    fn on_socket_drain(&mut self, id: ConnectionId);

    /// The peer finished sending.
    fn on_socket_end(&mut self, id: ConnectionId);

    fn on_socket_error(&mut self, id: ConnectionId, err: DispatchError);

    fn on_socket_close(&mut self, id: ConnectionId);

    /// Fires every timer due at the current clock time.
    fn tick(&mut self);

    /// Applies queued abort/resume signals and pulls pending body data.
    fn drive(&mut self);

    /// When `tick` next needs to run.
    fn next_timeout(&self) -> Option<Instant>;
}

/// Bounded LRU of TLS session state keyed by servername.
///
/// Connectors keep one of these to resume sessions on reconnect. The least
/// recently used entry is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct SessionCache<V> {
    capacity: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> Default for SessionCache<V> {
    fn default() -> Self {
        SessionCache::new(100)
    }
}

impl<V> SessionCache<V> {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        SessionCache {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, servername: &str) -> Option<&V> {
        if !self.entries.contains_key(servername) {
            return None;
        }
        self.touch(servername);
        self.entries.get(servername)
    }

    pub fn insert(&mut self, servername: impl Into<String>, session: V) {
        if self.capacity == 0 {
            return;
        }
        let servername = servername.into();
        if self.entries.insert(servername.clone(), session).is_some() {
            self.touch(&servername);
            return;
        }
        self.order.push_back(servername);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn remove(&mut self, servername: &str) -> Option<V> {
        let session = self.entries.remove(servername)?;
        self.order.retain(|name| name != servername);
        Some(session)
    }

    fn touch(&mut self, servername: &str) {
        if let Some(idx) = self.order.iter().position(|name| name == servername)
            && let Some(name) = self.order.remove(idx)
        {
            self.order.push_back(name);
        }
    }
}
