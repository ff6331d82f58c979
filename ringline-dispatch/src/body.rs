//! Request bodies.
//!
//! A [`Body`] is either fully buffered (`Bytes`, `Blob`, `Form`) and
//! written with a `content-length`, or a [`BodySource`] pulled chunk by
//! chunk by the connection writer. A source with unknown length is sent
//! with chunked transfer-encoding.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DispatchError;

/// Result of polling a [`BodySource`].
#[derive(Debug)]
pub enum BodyPoll {
    Chunk(Bytes),
    /// Nothing available yet; the driver calls `drive()` once more data is.
    Pending,
    End,
    Error(DispatchError),
}

/// A pull-based streaming body.
pub trait BodySource {
    /// Total length if known up front.
    fn length(&self) -> Option<u64> {
        None
    }

    fn poll_chunk(&mut self) -> BodyPoll;

    /// An error the source hit before anyone polled it. Checked when the
    /// request is bound to a connection.
    fn failure(&self) -> Option<DispatchError> {
        None
    }

    /// Called when the request ends early; release any resources.
    fn destroy(&mut self) {}
}

/// Request body.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Blob(Blob),
    Form(FormData),
    Stream(Box<dyn BodySource>),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Blob(b) => f.debug_tuple("Blob").field(&b.data.len()).finish(),
            Body::Form(form) => f.debug_tuple("Form").field(&form.fields.len()).finish(),
            Body::Stream(s) => f.debug_tuple("Stream").field(&s.length()).finish(),
        }
    }
}

impl Body {
    pub fn stream(source: impl BodySource + 'static) -> Self {
        Body::Stream(Box::new(source))
    }

    /// A body of unknown length produced by an iterator.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: 'static,
    {
        Body::stream(IterSource {
            iter: chunks.into_iter(),
        })
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Blob> for Body {
    fn from(b: Blob) -> Self {
        Body::Blob(b)
    }
}

impl From<FormData> for Body {
    fn from(f: FormData) -> Self {
        Body::Form(f)
    }
}

// ── Blob ─────────────────────────────────────────────────────────────

/// Immutable bytes with an optional media type.
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Bytes,
    pub content_type: Option<String>,
}

impl Blob {
    pub fn new(data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Blob {
            data: data.into(),
            content_type: content_type.filter(|t| !t.is_empty()).map(str::to_owned),
        }
    }
}

// ── FormData ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum FormValue {
    Text(String),
    File {
        filename: String,
        data: Bytes,
        content_type: Option<String>,
    },
}

/// `multipart/form-data` fields, serialized when the request is built.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    fields: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        FormData::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields.push((name.into(), FormValue::Text(value.into())));
        self
    }

    pub fn append_file(
        &mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
    ) -> &mut Self {
        self.fields.push((
            name.into(),
            FormValue::File {
                filename: filename.into(),
                data: data.into(),
                content_type: content_type.map(str::to_owned),
            },
        ));
        self
    }

    /// Serializes the fields. Returns the body and its `content-type`.
    pub(crate) fn encode(&self) -> (Bytes, String) {
        let boundary = new_boundary();
        let mut buf = BytesMut::new();
        for (name, value) in &self.fields {
            buf.put_slice(b"--");
            buf.put_slice(boundary.as_bytes());
            buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
            buf.put_slice(escape(name).as_bytes());
            buf.put_u8(b'"');
            match value {
                FormValue::Text(text) => {
                    buf.put_slice(b"\r\n\r\n");
                    buf.put_slice(normalize_newlines(text).as_bytes());
                }
                FormValue::File {
                    filename,
                    data,
                    content_type,
                } => {
                    buf.put_slice(b"; filename=\"");
                    buf.put_slice(escape(filename).as_bytes());
                    buf.put_slice(b"\"\r\nContent-Type: ");
                    buf.put_slice(
                        content_type
                            .as_deref()
                            .unwrap_or("application/octet-stream")
                            .as_bytes(),
                    );
                    buf.put_slice(b"\r\n\r\n");
                    buf.put_slice(data);
                }
            }
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(b"--\r\n");
        (
            buf.freeze(),
            format!("multipart/form-data; boundary={boundary}"),
        )
    }
}

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

fn new_boundary() -> String {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed));
    format!("----formdata-ringline-{:016x}", hasher.finish())
}

fn escape(s: &str) -> String {
    s.replace('\n', "%0A").replace('\r', "%0D").replace('"', "%22")
}

/// Rewrites lone CR and lone LF as CRLF.
fn normalize_newlines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            c => out.push(c),
        }
    }
    out
}

// ── Sources ──────────────────────────────────────────────────────────

/// Body fed from an iterator; length unknown.
pub struct IterSource<I> {
    iter: I,
}

impl<I: Iterator<Item = Bytes>> BodySource for IterSource<I> {
    fn poll_chunk(&mut self) -> BodyPoll {
        match self.iter.next() {
            Some(chunk) => BodyPoll::Chunk(chunk),
            None => BodyPoll::End,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    chunks: VecDeque<Bytes>,
    finished: bool,
    error: Option<DispatchError>,
    closed: bool,
}

/// Producer half of [`channel`].
#[derive(Clone)]
pub struct BodySender {
    shared: Rc<RefCell<ChannelState>>,
}

impl BodySender {
    /// Queues a chunk. Fails once the request side has gone away.
    pub fn send(&self, chunk: impl Into<Bytes>) -> Result<(), DispatchError> {
        let mut state = self.shared.borrow_mut();
        if state.closed {
            return Err(DispatchError::RequestAborted);
        }
        state.chunks.push_back(chunk.into());
        Ok(())
    }

    /// Marks the end of the body.
    pub fn finish(&self) {
        self.shared.borrow_mut().finished = true;
    }

    /// Fails the body; the request is aborted with `err`.
    pub fn abort(&self, err: DispatchError) {
        let mut state = self.shared.borrow_mut();
        if state.error.is_none() {
            state.error = Some(err);
        }
    }

    /// True once the consuming request finished or was destroyed.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

/// Consumer half of [`channel`].
pub struct ChannelSource {
    shared: Rc<RefCell<ChannelState>>,
    length: Option<u64>,
}

impl BodySource for ChannelSource {
    fn length(&self) -> Option<u64> {
        self.length
    }

    fn poll_chunk(&mut self) -> BodyPoll {
        let mut state = self.shared.borrow_mut();
        if let Some(err) = state.error.take() {
            state.closed = true;
            return BodyPoll::Error(err);
        }
        if let Some(chunk) = state.chunks.pop_front() {
            return BodyPoll::Chunk(chunk);
        }
        if state.finished {
            state.closed = true;
            return BodyPoll::End;
        }
        BodyPoll::Pending
    }

    fn failure(&self) -> Option<DispatchError> {
        self.shared.borrow().error.clone()
    }

    fn destroy(&mut self) {
        let mut state = self.shared.borrow_mut();
        state.closed = true;
        state.chunks.clear();
    }
}

/// Push-fed streaming body of unknown length.
pub fn channel() -> (BodySender, ChannelSource) {
    channel_with_length(None)
}

/// Push-fed streaming body with a declared length.
pub fn channel_with_length(length: Option<u64>) -> (BodySender, ChannelSource) {
    let shared = Rc::new(RefCell::new(ChannelState::default()));
    (
        BodySender {
            shared: shared.clone(),
        },
        ChannelSource { shared, length },
    )
}
