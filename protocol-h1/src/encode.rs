//! Request-side wire encoding.
//!
//! A request head is built line by line and closed with exactly one of the
//! framing terminators: [`RequestHead::end`] (no body framing header),
//! [`RequestHead::end_with_content_length`], or [`RequestHead::end_chunked`].
//! Chunked bodies are then framed with [`encode_chunk`] and finished with
//! [`LAST_CHUNK`].

use bytes::{BufMut, Bytes, BytesMut};

/// Terminating zero-length chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// An HTTP/1.1 request line and header block under construction.
#[derive(Debug, Clone)]
pub struct RequestHead {
    buf: BytesMut,
}

impl RequestHead {
    /// Starts a head with `METHOD SP path SP HTTP/1.1 CRLF`.
    pub fn new(method: &str, path: &str) -> Self {
        let mut buf = BytesMut::with_capacity(128 + path.len());
        buf.put_slice(method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        RequestHead { buf }
    }

    /// Appends one `name: value` line. No validation is done here.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.buf.put_slice(name.as_bytes());
        self.buf.put_slice(b": ");
        self.buf.put_slice(value.as_bytes());
        self.buf.put_slice(b"\r\n");
        self
    }

    /// Appends pre-serialized header lines (each already CRLF terminated).
    pub fn raw(&mut self, lines: &[u8]) -> &mut Self {
        self.buf.put_slice(lines);
        self
    }

    /// Closes the head without a framing header.
    pub fn end(mut self) -> Bytes {
        self.buf.put_slice(b"\r\n");
        self.buf.freeze()
    }

    /// Closes the head with `content-length: len`.
    pub fn end_with_content_length(mut self, len: u64) -> Bytes {
        self.buf.put_slice(b"content-length: ");
        self.buf.put_slice(len.to_string().as_bytes());
        self.buf.put_slice(b"\r\n\r\n");
        self.buf.freeze()
    }

    /// Closes the head with `transfer-encoding: chunked`.
    pub fn end_chunked(mut self) -> Bytes {
        self.buf.put_slice(b"transfer-encoding: chunked\r\n\r\n");
        self.buf.freeze()
    }

    /// Bytes written so far (without terminator).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Writes the `<hex-size> CRLF` prefix of a chunk.
pub fn encode_chunk_header(buf: &mut BytesMut, len: usize) {
    buf.put_slice(format!("{len:x}").as_bytes());
    buf.put_slice(b"\r\n");
}

/// Frames `data` as one chunk. Empty input writes nothing: a zero-size
/// chunk would terminate the body.
pub fn encode_chunk(buf: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    encode_chunk_header(buf, data.len());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}
