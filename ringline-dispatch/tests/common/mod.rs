//! In-memory sockets and recording handlers shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use ringline_dispatch::{
    AbortHandle, Client, ClientConfig, ConnectAttempt, ConnectOptions, ConnectionId,
    DispatchError, DispatchHandler, Header, ManualClock, ResumeHandle, Socket, SocketEvents,
    Upgraded,
};

// -- Sockets ------------------------------------------------------------------

/// What a test can observe about one socket.
#[derive(Debug)]
pub struct Wire {
    pub written: Vec<u8>,
    pub writes: usize,
    pub destroyed: bool,
    pub paused: bool,
    /// Returned from `write`; false simulates a full send buffer.
    pub writable: bool,
    pub alpn: Option<&'static str>,
}

impl Default for Wire {
    fn default() -> Self {
        Wire {
            written: Vec::new(),
            writes: 0,
            destroyed: false,
            paused: false,
            writable: true,
            alpn: None,
        }
    }
}

impl Wire {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

pub struct MockSocket {
    wire: Rc<RefCell<Wire>>,
}

impl Socket for MockSocket {
    fn write(&mut self, data: Bytes) -> bool {
        let mut wire = self.wire.borrow_mut();
        wire.written.extend_from_slice(&data);
        wire.writes += 1;
        wire.writable
    }

    fn pause(&mut self) {
        self.wire.borrow_mut().paused = true;
    }

    fn resume(&mut self) {
        self.wire.borrow_mut().paused = false;
    }

    fn destroy(&mut self) {
        self.wire.borrow_mut().destroyed = true;
    }

    fn alpn_protocol(&self) -> Option<&str> {
        self.wire.borrow().alpn
    }
}

/// One connect call seen by the [`Net`] connector.
pub struct Attempt {
    pub options: ConnectOptions,
    pub wire: Rc<RefCell<Wire>>,
}

/// Connector that records every attempt. In sync mode it hands out a fresh
/// socket immediately; otherwise the test completes the attempt itself.
#[derive(Clone, Default)]
pub struct Net {
    pub attempts: Rc<RefCell<Vec<Attempt>>>,
    pub pending: Rc<RefCell<bool>>,
    pub alpn: Option<&'static str>,
}

impl Net {
    pub fn pending() -> Self {
        let net = Net::default();
        *net.pending.borrow_mut() = true;
        net
    }

    pub fn connector(&self) -> impl FnMut(&ConnectOptions) -> ConnectAttempt + 'static {
        let net = self.clone();
        move |options: &ConnectOptions| {
            let wire = Rc::new(RefCell::new(Wire {
                alpn: net.alpn,
                ..Wire::default()
            }));
            net.attempts.borrow_mut().push(Attempt {
                options: options.clone(),
                wire: wire.clone(),
            });
            if *net.pending.borrow() {
                ConnectAttempt::Pending
            } else {
                ConnectAttempt::Ready(Ok(Box::new(MockSocket { wire })))
            }
        }
    }

    pub fn count(&self) -> usize {
        self.attempts.borrow().len()
    }

    pub fn id(&self, n: usize) -> ConnectionId {
        self.attempts.borrow()[n].options.id
    }

    pub fn wire(&self, n: usize) -> Rc<RefCell<Wire>> {
        self.attempts.borrow()[n].wire.clone()
    }

    pub fn last_id(&self) -> ConnectionId {
        self.id(self.count() - 1)
    }

    pub fn last_wire(&self) -> Rc<RefCell<Wire>> {
        self.wire(self.count() - 1)
    }

    /// Socket for a pending attempt.
    pub fn socket(&self, n: usize) -> Box<dyn Socket> {
        Box::new(MockSocket { wire: self.wire(n) })
    }
}

pub fn client(net: &Net, config: ClientConfig) -> (Client, ManualClock) {
    client_for("http://localhost:8080", net, config)
}

pub fn client_for(origin: &str, net: &Net, config: ClientConfig) -> (Client, ManualClock) {
    let clock = ManualClock::new();
    let client = Client::with_clock(origin, config, net.connector(), Rc::new(clock.clone()))
        .expect("valid client");
    (client, clock)
}

/// Feeds response bytes on the newest connection and lets deferred work run.
pub fn respond(client: &mut Client, net: &Net, data: &[u8]) {
    client.on_socket_data(net.last_id(), data);
    client.drive();
}

/// Moves time forward and fires due timers.
pub fn elapse(client: &mut Client, clock: &ManualClock, by: Duration) {
    clock.advance(by);
    client.tick();
}

// -- Handlers -----------------------------------------------------------------

#[derive(Default)]
pub struct Log {
    pub events: Vec<String>,
    pub status: Option<u16>,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    pub trailers: Vec<Header>,
    pub error: Option<DispatchError>,
    pub completed: bool,
    pub abort: Option<AbortHandle>,
    pub resume: Option<ResumeHandle>,
    pub upgraded: Option<Upgraded>,
    /// Return false from the first `on_data` call.
    pub pause_once: bool,
    pub body_sent: usize,
    pub request_sent: bool,
}

impl Log {
    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(DispatchError::code)
    }
}

/// Handler that writes everything it sees into a shared [`Log`].
pub struct Recorder {
    log: Rc<RefCell<Log>>,
    /// Shared across requests to observe cross-request ordering.
    order: Option<(String, Rc<RefCell<Vec<String>>>)>,
}

impl Recorder {
    pub fn new() -> (Box<dyn DispatchHandler>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let handler = Recorder {
            log: log.clone(),
            order: None,
        };
        (Box::new(handler), log)
    }

    pub fn with_log(log: Log) -> (Box<dyn DispatchHandler>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(log));
        let handler = Recorder {
            log: log.clone(),
            order: None,
        };
        (Box::new(handler), log)
    }

    pub fn ordered(
        label: &str,
        order: &Rc<RefCell<Vec<String>>>,
    ) -> (Box<dyn DispatchHandler>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let handler = Recorder {
            log: log.clone(),
            order: Some((label.to_string(), order.clone())),
        };
        (Box::new(handler), log)
    }
}

impl DispatchHandler for Recorder {
    fn on_connect(&mut self, abort: AbortHandle) -> Result<(), DispatchError> {
        let mut log = self.log.borrow_mut();
        log.events.push("connect".into());
        log.abort = Some(abort);
        Ok(())
    }

    fn on_headers(
        &mut self,
        status: u16,
        headers: &[Header],
        resume: &ResumeHandle,
        _status_text: &str,
    ) -> Result<bool, DispatchError> {
        let mut log = self.log.borrow_mut();
        log.events.push(format!("headers {status}"));
        log.status = Some(status);
        log.headers = headers.to_vec();
        log.resume = Some(resume.clone());
        Ok(true)
    }

    fn on_data(&mut self, chunk: Bytes) -> Result<bool, DispatchError> {
        let mut log = self.log.borrow_mut();
        log.events.push(format!("data {}", String::from_utf8_lossy(&chunk)));
        log.body.extend_from_slice(&chunk);
        if log.pause_once {
            log.pause_once = false;
            return Ok(false);
        }
        Ok(true)
    }

    fn on_complete(&mut self, trailers: &[Header]) -> Result<(), DispatchError> {
        let mut log = self.log.borrow_mut();
        log.events.push("complete".into());
        log.completed = true;
        log.trailers = trailers.to_vec();
        if let Some((label, order)) = &self.order {
            order.borrow_mut().push(label.clone());
        }
        Ok(())
    }

    fn on_error(&mut self, err: DispatchError) {
        let mut log = self.log.borrow_mut();
        log.events.push(format!("error {}", err.code()));
        log.error = Some(err);
    }

    fn accepts_upgrade(&self) -> bool {
        true
    }

    fn on_upgrade(&mut self, status: u16, headers: &[Header], upgraded: Upgraded) {
        let mut log = self.log.borrow_mut();
        log.events.push(format!("upgrade {status}"));
        log.headers = headers.to_vec();
        log.upgraded = Some(upgraded);
    }

    fn on_body_sent(&mut self, chunk: &[u8]) {
        self.log.borrow_mut().body_sent += chunk.len();
    }

    fn on_request_sent(&mut self) {
        self.log.borrow_mut().request_sent = true;
    }
}

pub const OK_HELLO: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";
