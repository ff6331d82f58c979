//! Single-origin HTTP/1.1 client.
//!
//! A [`Client`] owns at most one connection to its origin and a FIFO queue
//! of requests. Requests in `queue[running_idx..pending_idx]` have been
//! written and wait for their responses; `queue[pending_idx..]` are not
//! sent yet. Everything runs on the caller's thread: the driver reports
//! socket activity through [`SocketEvents`] and the client writes through
//! the [`Socket`] it was handed by its [`Connector`].

mod h1;
mod writer;

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::dispatcher::{Completion, Dispatcher, DispatcherEvent, DispatcherId, EventKind};
use crate::error::DispatchError;
use crate::handler::{DispatchHandler, Inbox, Signal, new_inbox};
use crate::metrics;
use crate::origin::Origin;
use crate::request::{DispatchOptions, Rejected, Request};
use crate::socket::{ConnectAttempt, ConnectOptions, ConnectionId, Connector, Socket, SocketEvents};
use crate::timers::{Clock, SystemClock, TimerHandle, TimerWheel};

use h1::{Conn, TimeoutKind};

/// Completed requests kept at the head of the queue before it is compacted.
const COMPACT_THRESHOLD: usize = 256;

/// Payload of the client's timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// The connection's headers, body or keep-alive deadline.
    Parser(ConnectionId),
    Connect(ConnectionId),
}

/// Work deferred until the current entry point unwinds.
enum Task {
    Resume,
    EmitDrain,
    SocketClosed(ConnectionId),
    PumpBody(ConnectionId),
    FinishDestroy,
    CloseDrained,
    Connected(ConnectionId, Result<Box<dyn Socket>, DispatchError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resuming {
    Idle,
    /// A resume is queued as a task.
    Scheduled,
    Running,
}

struct Connecting {
    id: ConnectionId,
    timer: Option<TimerHandle>,
}

/// Queue and connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub connected: bool,
    /// Queued, not yet written.
    pub pending: usize,
    /// Written, response not complete.
    pub running: usize,
    pub size: usize,
}

/// HTTP/1.1 client bound to one origin.
pub struct Client {
    id: DispatcherId,
    origin: Origin,
    config: ClientConfig,
    connector: Box<dyn Connector>,
    clock: Rc<dyn Clock>,
    timers: TimerWheel<TimerEvent>,
    inbox: Inbox,
    tasks: VecDeque<Task>,
    /// Resume on the next `drive()`.
    next_turn: bool,
    events: VecDeque<DispatcherEvent>,

    queue: Vec<Option<Request>>,
    running_idx: usize,
    pending_idx: usize,

    conn: Option<Conn>,
    connecting: Option<Connecting>,
    resuming: Resuming,
    /// 0: no drain owed, 1: drain scheduled, 2: a dispatch returned false.
    need_drain: u8,
    /// Servername of the current connection.
    servername: Option<String>,
    keep_alive_value: Duration,

    closed: bool,
    destroyed: bool,
    /// Close once the queue is empty.
    close_pending: bool,
    close_completion: Option<Completion>,
    destroy_completion: Option<Completion>,
    flushing: bool,
}

impl Client {
    /// Creates a client for `origin` (`http://host[:port]` or
    /// `https://host[:port]`). No connection is opened until the first
    /// request.
    pub fn new(
        origin: &str,
        config: ClientConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, DispatchError> {
        Client::with_clock(origin, config, connector, Rc::new(SystemClock))
    }

    /// Like [`Client::new`] with an explicit time source.
    pub fn with_clock(
        origin: &str,
        config: ClientConfig,
        connector: impl Connector + 'static,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let origin = Origin::parse(origin)?;
        Ok(Client::from_parts(origin, config, Box::new(connector), clock))
    }

    /// Builds a client from validated parts.
    pub(crate) fn from_parts(
        origin: Origin,
        config: ClientConfig,
        connector: Box<dyn Connector>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let timers = TimerWheel::new(clock.now());
        let keep_alive_value = config.keep_alive_timeout;
        Client {
            id: DispatcherId::next(),
            origin,
            config,
            connector,
            clock,
            timers,
            inbox: new_inbox(),
            tasks: VecDeque::new(),
            next_turn: false,
            events: VecDeque::new(),
            queue: Vec::new(),
            running_idx: 0,
            pending_idx: 0,
            conn: None,
            connecting: None,
            resuming: Resuming::Idle,
            need_drain: 0,
            servername: None,
            keep_alive_value,
            closed: false,
            destroyed: false,
            close_pending: false,
            close_completion: None,
            destroy_completion: None,
            flushing: false,
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connected: self.is_connected(),
            pending: self.pending(),
            running: self.running(),
            size: self.size(),
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.link.destroyed)
    }

    /// A dispatch returned false and no drain event was emitted yet.
    pub(crate) fn need_drain(&self) -> bool {
        self.need_drain != 0
    }

    /// Whether socket events for `id` belong to this client.
    pub(crate) fn owns(&self, id: ConnectionId) -> bool {
        self.conn.as_ref().is_some_and(|c| c.id == id)
            || self.connecting.as_ref().is_some_and(|c| c.id == id)
    }

    fn size(&self) -> usize {
        self.queue.len() - self.running_idx
    }

    fn pending(&self) -> usize {
        self.queue.len() - self.pending_idx
    }

    fn running(&self) -> usize {
        self.pending_idx - self.running_idx
    }

    fn emit(&mut self, kind: EventKind) {
        self.events.push_back(DispatcherEvent {
            kind,
            origin: self.origin.to_string(),
            targets: vec![self.id],
        });
    }

    // ── Scheduling ───────────────────────────────────────────────────

    fn busy(&self) -> bool {
        let conn_busy = self.conn.as_ref().is_some_and(|c| c.link.holds_writes());
        conn_busy || self.size() >= self.config.effective_pipelining() || self.pending() > 0
    }

    /// Whether `request` has to wait for the connection to settle.
    fn busy_for(&self, conn: &Conn, request: &Request) -> bool {
        if conn.link.holds_writes() {
            return true;
        }
        if self.running() == 0 {
            return false;
        }
        !request.idempotent
            || request.upgrade.is_some()
            || request.method == "CONNECT"
            || (request.body.is_stream() && request.body.length() != Some(0))
    }

    fn resume(&mut self, sync: bool) {
        if self.resuming == Resuming::Running {
            return;
        }
        self.resuming = Resuming::Running;
        self.resume_loop(sync);
        self.resuming = Resuming::Idle;

        if self.running_idx > COMPACT_THRESHOLD {
            self.queue.drain(..self.running_idx);
            self.pending_idx -= self.running_idx;
            self.running_idx = 0;
        }
    }

    fn resume_loop(&mut self, sync: bool) {
        loop {
            if self.destroyed {
                return;
            }
            if self.close_pending && self.size() == 0 {
                self.close_pending = false;
                self.tasks.push_back(Task::CloseDrained);
                return;
            }

            self.resume_conn();

            if self.busy() {
                self.need_drain = 2;
            } else if self.need_drain == 2 {
                if sync {
                    self.need_drain = 1;
                    self.tasks.push_back(Task::EmitDrain);
                } else {
                    self.emit_drain();
                }
                continue;
            }

            if self.pending() == 0 {
                return;
            }
            if self.running() >= self.config.effective_pipelining() {
                return;
            }

            let Some(request) = self.queue[self.pending_idx].as_ref().filter(|r| !r.aborted)
            else {
                // Aborted while on a socket that was since torn down.
                self.queue.remove(self.pending_idx);
                continue;
            };
            if self.origin.is_secure() && self.servername != request.servername {
                if self.running() > 0 {
                    return;
                }
                self.servername = request.servername.clone();
                self.destroy_socket(DispatchError::info("servername changed"));
                continue;
            }

            if self.connecting.is_some() {
                return;
            }
            let Some(conn) = self.conn.as_ref() else {
                self.connect();
                return;
            };
            if conn.link.destroyed {
                return;
            }
            let Some(request) = self.queue[self.pending_idx].as_ref() else {
                continue;
            };
            if self.busy_for(conn, request) {
                return;
            }

            if !request.aborted && self.write() {
                self.pending_idx += 1;
            } else {
                self.queue.remove(self.pending_idx);
            }
        }
    }

    /// Keeps the connection timer in step with the queue.
    fn resume_conn(&mut self) {
        let now = self.clock.now();
        let size = self.size();
        let running = self.running();
        let headers_timeout = self
            .queue
            .get(self.running_idx)
            .and_then(Option::as_ref)
            .and_then(|r| r.headers_timeout)
            .unwrap_or(self.config.headers_timeout);
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.link.destroyed {
            return;
        }
        if size == 0 {
            if conn.link.timeout_kind != Some(TimeoutKind::KeepAlive) {
                conn.link.set_timeout(
                    &mut self.timers,
                    now,
                    conn.id,
                    self.keep_alive_value,
                    TimeoutKind::KeepAlive,
                );
            }
        } else if running > 0
            && conn.response.status < 200
            && conn.link.timeout_kind != Some(TimeoutKind::Headers)
        {
            conn.link
                .set_timeout(&mut self.timers, now, conn.id, headers_timeout, TimeoutKind::Headers);
        }
    }

    fn emit_drain(&mut self) {
        self.need_drain = 0;
        self.emit(EventKind::Drain);
    }

    // ── Connecting ───────────────────────────────────────────────────

    fn connect(&mut self) {
        let id = ConnectionId::next();
        let servername = self
            .servername
            .clone()
            .or_else(|| self.config.servername.clone())
            .or_else(|| self.origin.default_servername());
        let options = ConnectOptions {
            id,
            host: self.origin.host(),
            hostname: self.origin.bare_hostname().to_string(),
            protocol: self.origin.protocol().to_string(),
            port: self.origin.port(),
            servername,
            local_address: self.config.local_address.clone(),
        };

        let timeout = self.config.connect_timeout;
        let timer = (!timeout.is_zero())
            .then(|| self.timers.schedule(self.clock.now(), timeout, TimerEvent::Connect(id)));
        self.connecting = Some(Connecting { id, timer });

        debug!(origin = %self.origin, conn = %id, servername = ?options.servername, "connecting");
        match self.connector.connect(&options) {
            ConnectAttempt::Ready(result) => self.tasks.push_back(Task::Connected(id, result)),
            ConnectAttempt::Pending => {}
        }
    }

    fn connected(&mut self, id: ConnectionId, result: Result<Box<dyn Socket>, DispatchError>) {
        if self.destroyed || !self.connecting.as_ref().is_some_and(|c| c.id == id) {
            if let Ok(mut socket) = result {
                socket.destroy();
            }
            return;
        }
        if let Some(connecting) = self.connecting.take()
            && let Some(timer) = connecting.timer
        {
            self.timers.cancel(timer);
        }

        let result = result.and_then(|mut socket| {
            if socket.alpn_protocol() == Some("h2") {
                socket.destroy();
                return Err(DispatchError::NotSupported(
                    "HTTP/2 is not supported by this client".to_string(),
                ));
            }
            Ok(socket)
        });

        match result {
            Ok(socket) => {
                metrics::CONNECTIONS_OPENED.increment();
                metrics::CONNECTIONS_ACTIVE.increment();
                debug!(origin = %self.origin, conn = %id, "connected");
                self.conn = Some(Conn::new(id, socket, self.config.parser_options()));
                self.emit(EventKind::Connect);
            }
            Err(err) => self.connect_failed(err),
        }
        self.resume(false);
    }

    fn connect_failed(&mut self, err: DispatchError) {
        metrics::CONNECT_FAILURES.increment();
        debug!(origin = %self.origin, code = err.code(), "connect failed: {err}");

        if matches!(err, DispatchError::TlsAltName(_)) {
            while self.pending() > 0
                && self.queue[self.pending_idx]
                    .as_ref()
                    .is_some_and(|r| r.servername == self.servername)
            {
                if let Some(mut request) = self.queue.remove(self.pending_idx) {
                    request.on_error(err.clone());
                }
            }
        } else {
            self.on_client_error(&err);
        }
        self.emit(EventKind::ConnectionError(err));
    }

    fn on_connect_timeout(&mut self, id: ConnectionId) {
        if !self.connecting.as_ref().is_some_and(|c| c.id == id) {
            return;
        }
        self.connecting = None;
        metrics::TIMEOUTS.increment();
        self.connect_failed(DispatchError::ConnectTimeout);
        self.resume(false);
    }

    /// Fails the whole queue when nothing is in flight and the error is
    /// not one a fresh connection could recover from.
    fn on_client_error(&mut self, err: &DispatchError) {
        if self.running() == 0 && !err.is_informational() && err.code() != "UND_ERR_SOCKET" {
            let requests: Vec<_> = self.queue.drain(self.running_idx..).collect();
            self.pending_idx = self.running_idx;
            for mut request in requests.into_iter().flatten() {
                request.on_error(err.clone());
            }
        }
    }

    // ── Aborts and deferred work ─────────────────────────────────────

    /// Fails one request. Aborting a request on the wire costs the socket.
    fn abort_request(&mut self, seq: u64, err: DispatchError) {
        let Some(idx) = self.queue[self.running_idx..]
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.seq == seq))
            .map(|pos| pos + self.running_idx)
        else {
            return;
        };
        let Some(request) = self.queue[idx].as_mut() else {
            return;
        };
        if request.is_done() {
            return;
        }
        trace!(origin = %self.origin, seq, "abort");
        request.on_error(err);
        if idx < self.pending_idx {
            self.destroy_socket(DispatchError::info("aborted"));
        } else {
            self.queue.remove(idx);
        }
    }

    /// Picks up abort signals that fired since the last entry point.
    fn check_abort_signals(&mut self) {
        let fired: Vec<_> = self.queue[self.running_idx..self.pending_idx]
            .iter()
            .flatten()
            .filter(|r| !r.is_done())
            .filter_map(|r| r.signal_reason().map(|reason| (r.seq, reason)))
            .collect();
        for (seq, reason) in fired {
            self.abort_request(seq, reason);
        }

        let mut idx = self.pending_idx;
        while idx < self.queue.len() {
            let reason = self.queue[idx].as_ref().and_then(Request::signal_reason);
            match reason {
                Some(reason) => {
                    if let Some(mut request) = self.queue.remove(idx) {
                        request.on_error(reason);
                    }
                }
                None => idx += 1,
            }
        }
    }

    /// Runs queued signals and tasks until both are empty.
    fn flush(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        self.check_abort_signals();
        loop {
            let signal = self.inbox.borrow_mut().pop_front();
            if let Some(signal) = signal {
                match signal {
                    Signal::Abort { request, error } => {
                        self.abort_request(request, error.unwrap_or(DispatchError::RequestAborted));
                    }
                    Signal::Resume { conn } => self.resume_parser(conn),
                }
                continue;
            }
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            self.run_task(task);
        }
        self.flushing = false;
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Resume => self.resume(false),
            Task::EmitDrain => {
                if self.need_drain == 1 {
                    self.emit_drain();
                }
            }
            Task::SocketClosed(id) => self.socket_closed(id),
            Task::PumpBody(id) => self.pump_body(id),
            Task::FinishDestroy => {
                debug!(origin = %self.origin, "destroyed");
                if let Some(completion) = &self.destroy_completion {
                    completion.resolve(Ok(()));
                }
                if let Some(completion) = &self.close_completion {
                    completion.resolve(Ok(()));
                }
            }
            Task::CloseDrained => {
                self.destroy(None);
            }
            Task::Connected(id, result) => self.connected(id, result),
        }
    }
}

impl Dispatcher for Client {
    fn dispatch(&mut self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool {
        let error = if self.destroyed {
            Some(DispatchError::ClientDestroyed)
        } else if self.closed {
            Some(DispatchError::ClientClosed)
        } else {
            None
        };
        if let Some(error) = error {
            Rejected { error, handler }.notify();
            return false;
        }

        let request = match Request::new(opts, handler) {
            Ok(request) => request,
            Err(rejected) => {
                rejected.notify();
                return false;
            }
        };
        metrics::REQUESTS_DISPATCHED.increment();
        trace!(origin = %self.origin, seq = request.seq, method = %request.method, path = %request.path, "dispatch");

        let deferred = request.body.is_stream() && request.body.length().is_none();
        self.queue.push(Some(request));

        if self.resuming != Resuming::Idle {
            // A resume is already on its way.
        } else if deferred {
            self.resuming = Resuming::Scheduled;
            self.tasks.push_back(Task::Resume);
        } else {
            self.resume(true);
        }

        if self.resuming != Resuming::Idle && self.need_drain != 2 && self.busy() {
            self.need_drain = 2;
        }
        let ok = self.need_drain < 2;
        self.flush();
        ok
    }

    fn close(&mut self) -> Completion {
        if self.destroyed {
            return Completion::ready(Err(DispatchError::ClientDestroyed));
        }
        if let Some(completion) = &self.close_completion {
            return completion.clone();
        }
        debug!(origin = %self.origin, size = self.size(), "closing");
        self.closed = true;
        let completion = Completion::new();
        self.close_completion = Some(completion.clone());
        if self.size() == 0 {
            self.tasks.push_back(Task::CloseDrained);
        } else {
            self.close_pending = true;
        }
        self.flush();
        completion
    }

    fn destroy(&mut self, err: Option<DispatchError>) -> Completion {
        if let Some(completion) = &self.destroy_completion {
            return completion.clone();
        }
        let completion = Completion::new();
        self.destroy_completion = Some(completion.clone());

        let err = err.unwrap_or(DispatchError::ClientDestroyed);
        debug!(origin = %self.origin, code = err.code(), "destroying");
        self.closed = true;
        self.destroyed = true;
        self.close_pending = false;

        let requests: Vec<_> = self.queue.drain(self.pending_idx..).collect();
        for mut request in requests.into_iter().flatten() {
            request.on_error(err.clone());
        }
        if let Some(connecting) = self.connecting.take()
            && let Some(timer) = connecting.timer
        {
            self.timers.cancel(timer);
        }

        if self.conn.is_some() {
            self.destroy_socket(err);
        } else {
            self.tasks.push_back(Task::FinishDestroy);
        }
        self.resume(false);
        self.flush();
        completion
    }

    fn poll_event(&mut self) -> Option<DispatcherEvent> {
        self.events.pop_front()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl SocketEvents for Client {
    fn on_connect_result(
        &mut self,
        id: ConnectionId,
        result: Result<Box<dyn Socket>, DispatchError>,
    ) {
        self.connected(id, result);
        self.flush();
    }

    fn on_socket_data(&mut self, id: ConnectionId, data: &[u8]) {
        self.receive(id, data);
        self.flush();
    }

    fn on_socket_drain(&mut self, id: ConnectionId) {
        if let Some(conn) = self.conn.as_mut().filter(|c| c.id == id) {
            conn.link.need_drain = false;
            if conn.writer.is_some() {
                self.tasks.push_back(Task::PumpBody(id));
            }
            self.tasks.push_back(Task::Resume);
        }
        self.flush();
    }

    fn on_socket_end(&mut self, id: ConnectionId) {
        self.socket_end(id);
        self.flush();
    }

    fn on_socket_error(&mut self, id: ConnectionId, err: DispatchError) {
        self.socket_error(id, err);
        self.flush();
    }

    fn on_socket_close(&mut self, id: ConnectionId) {
        if self.conn.as_ref().is_some_and(|c| c.id == id && !c.link.destroyed) {
            self.socket_closed(id);
        }
        self.flush();
    }

    fn tick(&mut self) {
        let now = self.clock.now();
        for event in self.timers.expired(now) {
            match event {
                TimerEvent::Parser(id) => self.on_parser_timeout(id),
                TimerEvent::Connect(id) => self.on_connect_timeout(id),
            }
        }
        self.flush();
    }

    fn drive(&mut self) {
        if std::mem::take(&mut self.next_turn) {
            self.resume(false);
        }
        if let Some(conn) = self.conn.as_ref()
            && conn.writer.is_some()
        {
            self.tasks.push_back(Task::PumpBody(conn.id));
        }
        self.flush();
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }
}
