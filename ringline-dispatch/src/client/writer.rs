//! Request serialization onto an HTTP/1.1 connection.

use bytes::{Bytes, BytesMut};
use protocol_h1::{LAST_CHUNK, RequestHead, encode_chunk};
use tracing::{trace, warn};

use super::h1::TimeoutKind;
use super::{Client, Task};
use crate::body::{BodyPoll, BodySource};
use crate::error::DispatchError;
use crate::handler::AbortHandle;
use crate::request::RequestBody;
use crate::socket::ConnectionId;

/// Methods whose requests carry a payload by definition.
fn expects_payload(method: &str) -> bool {
    matches!(
        method,
        "PUT" | "POST" | "PATCH" | "QUERY" | "PROPFIND" | "PROPPATCH"
    )
}

/// Methods for which an explicit content-length is checked against the
/// body.
fn should_send_content_length(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD" | "OPTIONS" | "TRACE" | "CONNECT")
}

/// A streaming body in flight on a connection.
pub(super) struct BodyWriter {
    seq: u64,
    /// Unsent request head; written together with the first chunk.
    head: Option<RequestHead>,
    content_length: Option<u64>,
    bytes_written: u64,
    expects_payload: bool,
    keep_connection: bool,
    source: Box<dyn BodySource>,
}

impl BodyWriter {
    /// Lets go of the body source.
    pub(super) fn release(&mut self) {
        self.source.destroy();
    }
}

impl Client {
    /// Serializes the request at `pending_idx`. Returns false if the
    /// request failed and must be dropped from the queue.
    pub(super) fn write(&mut self) -> bool {
        let idx = self.pending_idx;
        let strict = self.config.strict_content_length;
        let keep_alive_enabled = self.config.pipelining > 0;
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        let Some(request) = self.queue.get_mut(idx).and_then(Option::as_mut) else {
            return false;
        };

        let method = request.method.clone();
        let expects_payload = expects_payload(&method);
        let mut content_length = request.body.length().or(request.content_length);
        if content_length == Some(0) && !expects_payload {
            content_length = None;
        }

        if should_send_content_length(&method)
            && content_length.is_some_and(|len| len > 0)
            && request.content_length.is_some()
            && request.content_length != content_length
        {
            if strict {
                request.on_error(DispatchError::RequestContentLengthMismatch);
                return false;
            }
            warn!(
                seq = request.seq,
                declared = request.content_length,
                actual = content_length,
                "{}",
                DispatchError::RequestContentLengthMismatch
            );
        }

        let abort = AbortHandle::new(&self.inbox, request.seq);
        if let Err(err) = request.on_connect(abort) {
            request.on_error(err);
        }
        if request.aborted {
            return false;
        }

        let link = &mut conn.link;
        if method == "HEAD" || method == "CONNECT" || request.upgrade.is_some() {
            link.reset = true;
        }
        if let Some(reset) = request.reset {
            link.reset = reset;
        }
        if let Some(max) = self.config.max_requests_per_client {
            let written = link.counter;
            link.counter += 1;
            if written >= max {
                link.reset = true;
            }
        }
        if request.blocking {
            link.blocking = true;
        }

        let mut head = RequestHead::new(&method, &request.path);
        match &request.host {
            Some(host) => head.header("host", host),
            None => head.header("host", &self.origin.host()),
        };
        if let Some(upgrade) = &request.upgrade {
            head.header("connection", "upgrade").header("upgrade", upgrade);
        } else if keep_alive_enabled && !link.reset {
            head.header("connection", "keep-alive");
        } else {
            head.header("connection", "close");
        }
        head.raw(&request.header_lines);

        trace!(conn = %conn.id, seq = request.seq, method = %method, path = %request.path, "write request");

        if request.body.length() == Some(0) {
            let bytes = if content_length == Some(0) {
                head.end_with_content_length(0)
            } else {
                head.end()
            };
            conn.send(bytes);
            request.on_request_sent();
            return true;
        }

        match std::mem::replace(&mut request.body, RequestBody::None) {
            RequestBody::Bytes(data) => {
                conn.socket.cork();
                conn.send(head.end_with_content_length(data.len() as u64));
                conn.send(data.clone());
                conn.socket.uncork();
                request.on_body_sent(&data);
                if !expects_payload && request.reset != Some(false) {
                    conn.link.reset = true;
                }
                request.on_request_sent();
            }
            RequestBody::Stream(source) => {
                conn.link.writing = true;
                conn.writer = Some(BodyWriter {
                    seq: request.seq,
                    head: Some(head),
                    content_length,
                    bytes_written: 0,
                    expects_payload,
                    keep_connection: request.reset == Some(false),
                    source,
                });
                self.tasks.push_back(Task::PumpBody(conn.id));
            }
            RequestBody::None => {
                conn.send(head.end());
                request.on_request_sent();
            }
        }
        true
    }

    /// Pulls body chunks until the source or the socket has to wait.
    pub(super) fn pump_body(&mut self, id: ConnectionId) {
        loop {
            let Some(conn) = self.conn.as_mut().filter(|c| c.id == id) else {
                return;
            };
            if conn.link.destroyed || conn.link.need_drain {
                return;
            }
            let Some(writer) = conn.writer.as_mut() else {
                return;
            };
            match writer.source.poll_chunk() {
                BodyPoll::Pending => return,
                BodyPoll::Chunk(chunk) => {
                    if let Err(err) = self.write_chunk(chunk) {
                        self.finish_body(Some(err));
                        return;
                    }
                }
                BodyPoll::End => {
                    let result = self.end_body();
                    self.finish_body(result.err());
                    return;
                }
                BodyPoll::Error(err) => {
                    self.finish_body(Some(err));
                    return;
                }
            }
        }
    }

    fn write_chunk(&mut self, chunk: Bytes) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let strict = self.config.strict_content_length;
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let Some(writer) = conn.writer.as_mut() else {
            return Ok(());
        };
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len() as u64;
        if let Some(expected) = writer.content_length
            && writer.bytes_written + len > expected
        {
            if strict {
                return Err(DispatchError::RequestContentLengthMismatch);
            }
            warn!(seq = writer.seq, "{}", DispatchError::RequestContentLengthMismatch);
        }

        let framing = match writer.head.take() {
            Some(head) => {
                if !writer.expects_payload && !writer.keep_connection {
                    conn.link.reset = true;
                }
                Some(match writer.content_length {
                    Some(n) => head.end_with_content_length(n),
                    None => head.end_chunked(),
                })
            }
            None => None,
        };
        let payload = match writer.content_length {
            Some(_) => chunk.clone(),
            None => {
                let mut buf = BytesMut::with_capacity(chunk.len() + 12);
                encode_chunk(&mut buf, &chunk);
                buf.freeze()
            }
        };
        writer.bytes_written += len;
        let seq = writer.seq;

        conn.socket.cork();
        if let Some(framing) = framing {
            conn.send(framing);
        }
        let ok = conn.send(payload);
        conn.socket.uncork();

        if !ok && conn.link.timeout_kind == Some(TimeoutKind::Headers) {
            conn.link.refresh_timeout(&mut self.timers, now, conn.id);
        }
        if let Some(request) = self.queue[self.running_idx..self.pending_idx]
            .iter_mut()
            .flatten()
            .find(|r| r.seq == seq)
        {
            request.on_body_sent(&chunk);
        }
        Ok(())
    }

    /// Terminates the body framing once the source is exhausted.
    fn end_body(&mut self) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let strict = self.config.strict_content_length;
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let Some(writer) = conn.writer.as_mut() else {
            return Ok(());
        };
        let seq = writer.seq;
        let head = writer.head.take();
        let content_length = writer.content_length;
        let bytes_written = writer.bytes_written;
        let expects_payload = writer.expects_payload;
        if let Some(request) = self.queue[self.running_idx..self.pending_idx]
            .iter_mut()
            .flatten()
            .find(|r| r.seq == seq)
        {
            request.on_request_sent();
        }

        conn.link.writing = false;
        if conn.link.destroyed {
            return Ok(());
        }

        match head {
            Some(head) if expects_payload => {
                conn.send(head.end_with_content_length(0));
            }
            Some(head) => {
                conn.send(head.end());
            }
            None if content_length.is_none() => {
                conn.send(Bytes::from_static(LAST_CHUNK));
            }
            None => {}
        }

        if let Some(expected) = content_length
            && bytes_written != expected
        {
            if strict {
                return Err(DispatchError::RequestContentLengthMismatch);
            }
            warn!(seq, "{}", DispatchError::RequestContentLengthMismatch);
        }

        if conn.link.timeout_kind == Some(TimeoutKind::Headers) {
            conn.link.refresh_timeout(&mut self.timers, now, conn.id);
        }
        self.tasks.push_back(Task::Resume);
        Ok(())
    }

    /// Detaches the writer; a failure aborts its request.
    fn finish_body(&mut self, err: Option<DispatchError>) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.link.writing = false;
        let Some(mut writer) = conn.writer.take() else {
            return;
        };
        writer.release();
        if let Some(err) = err {
            self.abort_request(writer.seq, err);
        }
    }
}
