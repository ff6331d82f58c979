//! HTTP/1.1 connection state and response handling.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use protocol_h1::{
    Control, ErrorCode, HeadInfo, HeadersAction, ParseOutcome, ParserCallbacks, ParserOptions,
    ResponseParser, parse_keep_alive_timeout, trim,
};
use tracing::{debug, trace};

use super::{Client, Task, TimerEvent};
use crate::config::ClientConfig;
use crate::dispatcher::EventKind;
use crate::error::DispatchError;
use crate::handler::{Header, Inbox, ResumeHandle, Upgraded};
use crate::metrics;
use crate::request::Request;
use crate::socket::{ConnectionId, Socket};
use crate::timers::{TimerHandle, TimerWheel};

use super::writer::BodyWriter;

/// Which deadline the connection timer currently enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TimeoutKind {
    /// From request sent until the response head.
    Headers,
    /// Between body chunks.
    Body,
    /// Idle connection with nothing queued.
    KeepAlive,
}

/// Per-socket flags shared by the writer and the response side.
#[derive(Debug, Default)]
pub(super) struct Link {
    /// A streaming body is being written.
    pub(super) writing: bool,
    /// Close the socket once the running requests finish.
    pub(super) reset: bool,
    /// Hold writes until the current response head arrives.
    pub(super) blocking: bool,
    /// Requests written on this socket.
    pub(super) counter: usize,
    /// The socket reported a saturated send buffer.
    pub(super) need_drain: bool,
    pub(super) destroyed: bool,
    /// First error the socket was destroyed with.
    pub(super) error: Option<DispatchError>,
    /// Response delivery paused by the handler.
    pub(super) paused: bool,
    timeout: Option<TimerHandle>,
    timeout_value: Duration,
    pub(super) timeout_kind: Option<TimeoutKind>,
}

impl Link {
    /// No new request may be written on this socket yet.
    pub(super) fn holds_writes(&self) -> bool {
        self.writing || self.need_drain || self.reset || self.blocking
    }

    /// Arms the connection timer. A changed duration, or a switch into or
    /// out of keep-alive, replaces the timer; otherwise the deadline is
    /// only pushed out.
    pub(super) fn set_timeout(
        &mut self,
        timers: &mut TimerWheel<TimerEvent>,
        now: Instant,
        id: ConnectionId,
        value: Duration,
        kind: TimeoutKind,
    ) {
        let keep_alive_changed =
            (kind == TimeoutKind::KeepAlive) != (self.timeout_kind == Some(TimeoutKind::KeepAlive));
        if value != self.timeout_value || keep_alive_changed {
            if let Some(handle) = self.timeout.take() {
                timers.cancel(handle);
            }
            if !value.is_zero() {
                self.timeout = Some(timers.schedule(now, value, TimerEvent::Parser(id)));
            }
            self.timeout_value = value;
        } else {
            self.refresh_timeout(timers, now, id);
        }
        self.timeout_kind = Some(kind);
    }

    /// Pushes the current deadline out; re-arms a timer that already fired.
    pub(super) fn refresh_timeout(
        &mut self,
        timers: &mut TimerWheel<TimerEvent>,
        now: Instant,
        id: ConnectionId,
    ) {
        if let Some(handle) = self.timeout
            && !timers.refresh(handle, now)
        {
            self.timeout = Some(timers.schedule(now, self.timeout_value, TimerEvent::Parser(id)));
        }
    }

    pub(super) fn clear_timeout(&mut self, timers: &mut TimerWheel<TimerEvent>) {
        if let Some(handle) = self.timeout.take() {
            timers.cancel(handle);
        }
        self.timeout_value = Duration::ZERO;
        self.timeout_kind = None;
    }
}

/// The response currently being parsed.
#[derive(Debug, Default)]
pub(super) struct Response {
    /// Zero until the head is complete.
    pub(super) status: u16,
    status_text: String,
    headers: Vec<Header>,
    trailers: Vec<Header>,
    keep_alive: Vec<u8>,
    connection: Vec<u8>,
    pub(super) should_keep_alive: bool,
    content_length: Option<u64>,
    bytes_read: u64,
    upgrade: bool,
}

/// A live socket and its parser.
pub(super) struct Conn {
    pub(super) id: ConnectionId,
    pub(super) socket: Box<dyn Socket>,
    parser: ResponseParser,
    pub(super) link: Link,
    pub(super) response: Response,
    /// Input held back while paused.
    pending_input: BytesMut,
    pub(super) writer: Option<BodyWriter>,
}

impl Conn {
    pub(super) fn new(id: ConnectionId, socket: Box<dyn Socket>, options: ParserOptions) -> Self {
        Conn {
            id,
            socket,
            parser: ResponseParser::new(options),
            link: Link::default(),
            response: Response::default(),
            pending_input: BytesMut::new(),
            writer: None,
        }
    }

    /// Writes to the socket, recording saturation.
    pub(super) fn send(&mut self, data: Bytes) -> bool {
        let ok = self.socket.write(data);
        if !ok {
            self.link.need_drain = true;
        }
        ok
    }

    /// Peer closed or reset before a close-delimited response ended.
    fn completes_on_eof(&self) -> bool {
        self.response.status != 0 && !self.response.should_keep_alive
    }
}

// ── Parser callbacks ─────────────────────────────────────────────────

/// Parser callback target. Borrows the client state the callbacks touch
/// and reports what must happen once the parser returns.
struct Sink<'a> {
    queue: &'a mut Vec<Option<Request>>,
    running_idx: &'a mut usize,
    pending_idx: usize,
    config: &'a ClientConfig,
    timers: &'a mut TimerWheel<TimerEvent>,
    now: Instant,
    inbox: &'a Inbox,
    conn_id: ConnectionId,
    link: &'a mut Link,
    response: &'a mut Response,
    keep_alive_value: &'a mut Duration,
    /// Destroy the socket with this error.
    fault: Option<DispatchError>,
    /// Run the resume loop.
    resume: bool,
    /// Run the resume loop on the next `drive()`.
    next_turn: bool,
}

fn set_fault(slot: &mut Option<DispatchError>, err: DispatchError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

impl Sink<'_> {
    fn running(&self) -> usize {
        self.pending_idx - *self.running_idx
    }

    fn current(&mut self) -> Option<&mut Request> {
        if *self.running_idx >= self.pending_idx {
            return None;
        }
        self.queue.get_mut(*self.running_idx).and_then(Option::as_mut)
    }
}

impl ParserCallbacks for Sink<'_> {
    fn on_message_begin(&mut self) -> Control {
        if self.link.destroyed || self.current().is_none() {
            return Control::Error;
        }
        Control::Continue
    }

    fn on_status(&mut self, _status: u16, reason: &[u8]) -> Control {
        self.response.status_text = String::from_utf8_lossy(reason).into_owned();
        Control::Continue
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Control {
        if name.eq_ignore_ascii_case(b"keep-alive") {
            self.response.keep_alive = value.to_vec();
        } else if name.eq_ignore_ascii_case(b"connection") {
            self.response.connection = value.to_vec();
        }
        self.response
            .headers
            .push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
        Control::Continue
    }

    fn on_headers_complete(&mut self, head: &HeadInfo) -> HeadersAction {
        if self.link.destroyed || self.running() == 0 {
            return HeadersAction::Error;
        }
        let Some(request) = self.queue.get_mut(*self.running_idx).and_then(Option::as_mut) else {
            return HeadersAction::Error;
        };

        if head.status == 100 {
            set_fault(&mut self.fault, DispatchError::socket("bad response"));
            return HeadersAction::Error;
        }
        if head.upgrade && request.upgrade.is_none() {
            set_fault(&mut self.fault, DispatchError::socket("bad upgrade"));
            return HeadersAction::Error;
        }

        let response = &mut *self.response;
        let is_head = request.method == "HEAD";
        response.status = head.status;
        response.content_length = head.content_length;
        response.should_keep_alive = head.keep_alive
            || (is_head
                && !self.link.reset
                && trim(&response.connection).eq_ignore_ascii_case(b"keep-alive"));

        if head.status >= 200 {
            let timeout = request.body_timeout.unwrap_or(self.config.body_timeout);
            self.link
                .set_timeout(self.timers, self.now, self.conn_id, timeout, TimeoutKind::Body);
        } else {
            self.link.refresh_timeout(self.timers, self.now, self.conn_id);
        }

        if request.method == "CONNECT" || head.upgrade {
            response.upgrade = true;
            return HeadersAction::Upgrade;
        }

        if response.should_keep_alive && self.config.pipelining > 0 {
            match parse_keep_alive_timeout(&response.keep_alive) {
                Some(secs) => {
                    let hint = Duration::from_secs(secs);
                    match hint.checked_sub(self.config.keep_alive_timeout_threshold) {
                        Some(timeout) if !timeout.is_zero() => {
                            *self.keep_alive_value = timeout.min(self.config.keep_alive_max_timeout);
                        }
                        _ => self.link.reset = true,
                    }
                }
                None => *self.keep_alive_value = self.config.keep_alive_timeout,
            }
        } else {
            self.link.reset = true;
        }

        let headers = std::mem::take(&mut response.headers);
        let resume = ResumeHandle::new(self.inbox, self.conn_id);
        trace!(conn = %self.conn_id, status = head.status, "response head");
        let proceed = match request.on_headers(head.status, &headers, &resume, &response.status_text) {
            Ok(proceed) => proceed,
            Err(err) => {
                request.on_error(err);
                set_fault(&mut self.fault, DispatchError::info("aborted"));
                return HeadersAction::Error;
            }
        };

        if request.aborted {
            return HeadersAction::Error;
        }
        if is_head || head.status < 200 {
            return HeadersAction::SkipBody;
        }
        if self.link.blocking {
            self.link.blocking = false;
            self.resume = true;
        }
        if proceed {
            HeadersAction::Continue
        } else {
            HeadersAction::Pause
        }
    }

    fn on_body(&mut self, chunk: &[u8]) -> Control {
        if self.link.destroyed || self.running() == 0 {
            return Control::Error;
        }
        self.link.refresh_timeout(self.timers, self.now, self.conn_id);

        let len = chunk.len() as u64;
        if let Some(max) = self.config.max_response_size
            && self.response.bytes_read + len > max
        {
            set_fault(&mut self.fault, DispatchError::ResponseExceededMaxSize);
            return Control::Error;
        }
        self.response.bytes_read += len;

        let Some(request) = self.queue.get_mut(*self.running_idx).and_then(Option::as_mut) else {
            return Control::Error;
        };
        match request.on_data(Bytes::copy_from_slice(chunk)) {
            Ok(true) => Control::Continue,
            Ok(false) => Control::Pause,
            Err(err) => {
                request.on_error(err);
                set_fault(&mut self.fault, DispatchError::info("aborted"));
                Control::Error
            }
        }
    }

    fn on_trailer(&mut self, name: &[u8], value: &[u8]) -> Control {
        self.response
            .trailers
            .push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
        Control::Continue
    }

    fn on_message_complete(&mut self) -> Control {
        let response = &mut *self.response;
        if self.link.destroyed && (response.status == 0 || response.should_keep_alive) {
            return Control::Error;
        }
        if response.upgrade {
            return Control::Continue;
        }

        let status = response.status;
        let content_length = response.content_length;
        let bytes_read = response.bytes_read;
        let keep_alive = response.should_keep_alive;
        let trailers = std::mem::take(&mut response.trailers);
        *response = Response {
            should_keep_alive: keep_alive,
            ..Response::default()
        };

        if status < 200 {
            return Control::Continue;
        }

        let idx = *self.running_idx;
        let Some(request) = self.current() else {
            return Control::Error;
        };
        if request.method != "HEAD"
            && let Some(expected) = content_length
            && bytes_read != expected
        {
            set_fault(&mut self.fault, DispatchError::ResponseContentLengthMismatch);
            return Control::Error;
        }

        request.on_complete(&trailers);
        self.queue[idx] = None;
        *self.running_idx += 1;

        if self.link.writing || !keep_alive || (self.link.reset && self.running() == 0) {
            set_fault(&mut self.fault, DispatchError::info("reset"));
            return Control::Pause;
        }
        if self.config.pipelining <= 1 {
            // Give the peer a turn to close before the socket is reused.
            self.next_turn = true;
        } else {
            self.resume = true;
        }
        Control::Continue
    }
}

/// What the parser callbacks asked for.
struct Outcome {
    fault: Option<DispatchError>,
    resume: bool,
    next_turn: bool,
}

// ── Client side ──────────────────────────────────────────────────────

impl Client {
    /// Runs `f` against a parser sink for the current connection.
    fn with_sink<R>(
        &mut self,
        f: impl FnOnce(&mut ResponseParser, &mut Sink<'_>) -> R,
    ) -> Option<(R, Outcome)> {
        let now = self.clock.now();
        let conn = self.conn.as_mut()?;
        let mut sink = Sink {
            queue: &mut self.queue,
            running_idx: &mut self.running_idx,
            pending_idx: self.pending_idx,
            config: &self.config,
            timers: &mut self.timers,
            now,
            inbox: &self.inbox,
            conn_id: conn.id,
            link: &mut conn.link,
            response: &mut conn.response,
            keep_alive_value: &mut self.keep_alive_value,
            fault: None,
            resume: false,
            next_turn: false,
        };
        let result = f(&mut conn.parser, &mut sink);
        let outcome = Outcome {
            fault: sink.fault,
            resume: sink.resume,
            next_turn: sink.next_turn,
        };
        Some((result, outcome))
    }

    /// Applies what the callbacks asked for outside of a parser run.
    fn apply(&mut self, outcome: Outcome) {
        if outcome.next_turn {
            self.next_turn = true;
        }
        if let Some(err) = outcome.fault {
            self.destroy_socket(err);
        } else if outcome.resume {
            self.resume(false);
        }
    }

    pub(super) fn receive(&mut self, id: ConnectionId, data: &[u8]) {
        let Some(conn) = self.conn.as_mut().filter(|c| c.id == id) else {
            return;
        };
        if conn.link.destroyed {
            return;
        }
        if conn.link.paused {
            conn.pending_input.extend_from_slice(data);
            return;
        }
        self.execute(data);
    }

    fn execute(&mut self, data: &[u8]) {
        let Some((result, outcome)) = self.with_sink(|parser, sink| parser.execute(data, sink))
        else {
            return;
        };
        if outcome.next_turn {
            self.next_turn = true;
        }
        if let Some(err) = outcome.fault {
            self.destroy_socket(err);
            return;
        }

        match result {
            Ok(ParseOutcome::Done) => {}
            Ok(ParseOutcome::Paused { consumed }) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.pending_input.extend_from_slice(&data[consumed..]);
                    conn.link.paused = true;
                    conn.socket.pause();
                }
            }
            Ok(ParseOutcome::Upgrade { consumed }) => {
                self.upgrade(Bytes::copy_from_slice(&data[consumed..]));
                return;
            }
            Err(err) => {
                let err = match err.code {
                    ErrorCode::HeaderOverflow => DispatchError::HeadersOverflow,
                    _ => DispatchError::Parser(err),
                };
                self.destroy_socket(err);
                return;
            }
        }
        if outcome.resume {
            self.resume(false);
        }
    }

    /// Continues a paused response.
    pub(super) fn resume_parser(&mut self, id: ConnectionId) {
        let now = self.clock.now();
        let Some(conn) = self.conn.as_mut().filter(|c| c.id == id) else {
            return;
        };
        if !conn.link.paused || conn.link.destroyed {
            return;
        }
        conn.link.paused = false;
        conn.link.refresh_timeout(&mut self.timers, now, id);
        let input = conn.pending_input.split().freeze();
        self.execute(&input);

        if let Some(conn) = self.conn.as_mut().filter(|c| c.id == id)
            && !conn.link.paused
            && !conn.link.destroyed
        {
            conn.socket.resume();
        }
    }

    /// Treats everything read so far as the complete response.
    fn complete_on_eof(&mut self) {
        if let Some((_, outcome)) = self.with_sink(|_, sink| sink.on_message_complete()) {
            self.apply(outcome);
        }
    }

    /// Tears the socket down with `err`. The first error wins; the
    /// connection is released on the next task turn.
    pub(super) fn destroy_socket(&mut self, err: DispatchError) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.link.destroyed {
            return;
        }
        debug!(origin = %self.origin, conn = %conn.id, code = err.code(), "destroying socket: {err}");
        conn.link.destroyed = true;
        conn.link.error = Some(err.clone());
        conn.socket.destroy();
        let id = conn.id;
        self.on_client_error(&err);
        self.tasks.push_back(Task::SocketClosed(id));
    }

    pub(super) fn socket_error(&mut self, id: ConnectionId, err: DispatchError) {
        let Some(conn) = self.conn.as_ref().filter(|c| c.id == id) else {
            return;
        };
        if err.code() == "ECONNRESET" && conn.completes_on_eof() {
            self.complete_on_eof();
            return;
        }
        self.destroy_socket(err);
    }

    pub(super) fn socket_end(&mut self, id: ConnectionId) {
        let Some(conn) = self.conn.as_ref().filter(|c| c.id == id) else {
            return;
        };
        if conn.link.destroyed {
            return;
        }
        if conn.completes_on_eof() {
            self.complete_on_eof();
            return;
        }
        self.destroy_socket(DispatchError::socket("other side closed"));
    }

    /// Releases the connection and settles the requests it carried.
    pub(super) fn socket_closed(&mut self, id: ConnectionId) {
        let Some(conn) = self.conn.as_ref().filter(|c| c.id == id) else {
            return;
        };
        if conn.link.error.is_none() && conn.completes_on_eof() {
            self.complete_on_eof();
        }
        if !self.conn.as_ref().is_some_and(|c| c.id == id) {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.link.clear_timeout(&mut self.timers);
        if let Some(mut writer) = conn.writer.take() {
            writer.release();
        }
        if !conn.link.destroyed {
            conn.link.destroyed = true;
            conn.socket.destroy();
        }
        let err = conn
            .link
            .error
            .take()
            .unwrap_or_else(|| DispatchError::socket("closed"));
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        if self.destroyed {
            let requests: Vec<_> = self.queue.drain(self.running_idx..).collect();
            self.pending_idx = self.running_idx;
            for mut request in requests.into_iter().flatten() {
                request.on_error(err.clone());
            }
        } else if self.running() > 0 && !err.is_informational() {
            // The byte stream is no longer trustworthy for any request
            // pipelined on it.
            for idx in self.running_idx..self.pending_idx {
                if let Some(mut request) = self.queue[idx].take() {
                    request.on_error(err.clone());
                }
            }
            self.running_idx = self.pending_idx;
        }
        self.pending_idx = self.running_idx;

        debug!(origin = %self.origin, conn = %id, code = err.code(), "disconnected");
        self.emit(EventKind::Disconnect(err));
        self.resume(false);
        if self.destroyed {
            self.tasks.push_back(Task::FinishDestroy);
        }
    }

    pub(super) fn on_parser_timeout(&mut self, id: ConnectionId) {
        let running = self.running();
        let Some(conn) = self.conn.as_ref().filter(|c| c.id == id) else {
            return;
        };
        if conn.link.destroyed {
            return;
        }
        let err = match conn.link.timeout_kind {
            Some(TimeoutKind::Headers) => {
                if conn.link.writing && !conn.link.need_drain && running <= 1 {
                    return;
                }
                DispatchError::HeadersTimeout
            }
            Some(TimeoutKind::Body) => {
                if conn.link.paused {
                    return;
                }
                DispatchError::BodyTimeout
            }
            Some(TimeoutKind::KeepAlive) => {
                metrics::KEEPALIVE_EXPIRED.increment();
                self.destroy_socket(DispatchError::info("socket idle timeout"));
                return;
            }
            None => return,
        };
        metrics::TIMEOUTS.increment();
        self.destroy_socket(err);
    }

    /// Hands the socket to the running request after a protocol switch.
    fn upgrade(&mut self, head: Bytes) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.link.clear_timeout(&mut self.timers);
        if let Some(mut writer) = conn.writer.take() {
            writer.release();
        }
        let status = conn.response.status;
        let headers = std::mem::take(&mut conn.response.headers);
        let idx = self.running_idx;
        let request = self.queue.get_mut(idx).and_then(Option::take);
        self.running_idx += 1;
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        debug!(origin = %self.origin, conn = %conn.id, status, "upgraded");
        self.emit(EventKind::Disconnect(DispatchError::info("upgrade")));

        let upgraded = Upgraded {
            id: conn.id,
            socket: conn.socket,
            head,
        };
        match request {
            Some(mut request) => request.on_upgrade(status, &headers, upgraded),
            None => {
                let mut socket = upgraded.socket;
                socket.destroy();
            }
        }
        self.resume(false);
    }
}
