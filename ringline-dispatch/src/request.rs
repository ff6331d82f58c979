//! Dispatch options and the validated request built from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use protocol_h1::{KnownHeader, is_token, is_valid_header_value, is_valid_path};
use tracing::trace;

use crate::body::{Body, BodySource};
use crate::error::DispatchError;
use crate::handler::{AbortHandle, AbortSignal, DispatchHandler, Header, ResumeHandle, Upgraded};
use crate::metrics;
use crate::origin::servername_for;

/// A request header value; `Multi` is sent as repeated lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Single(v)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(v: Vec<String>) -> Self {
        HeaderValue::Multi(v)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(v: Vec<&str>) -> Self {
        HeaderValue::Multi(v.into_iter().map(str::to_string).collect())
    }
}

/// What to send.
#[derive(Debug, Default)]
pub struct DispatchOptions {
    /// Target origin for interceptors. A client always sends to its own
    /// origin.
    pub origin: Option<String>,
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, HeaderValue)>,
    pub body: Body,
    /// Safe to pipeline behind other requests. Defaults to true for GET
    /// and HEAD.
    pub idempotent: Option<bool>,
    /// Hold further writes on the connection until the response head
    /// arrives.
    pub blocking: Option<bool>,
    /// Protocol to switch to; the response is handed to `on_upgrade`.
    pub upgrade: Option<String>,
    pub headers_timeout: Option<Duration>,
    pub body_timeout: Option<Duration>,
    /// Close the connection after this request (`Some(true)`) or keep it
    /// even if the method would close it (`Some(false)`).
    pub reset: Option<bool>,
    pub expect_continue: bool,
    pub servername: Option<String>,
    pub signal: Option<AbortSignal>,
}

impl DispatchOptions {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        DispatchOptions {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn upgrade(mut self, protocol: impl Into<String>) -> Self {
        self.upgrade = Some(protocol.into());
        self
    }

    pub fn servername(mut self, servername: impl Into<String>) -> Self {
        self.servername = Some(servername.into());
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Body as seen by the connection writer.
pub(crate) enum RequestBody {
    None,
    Bytes(Bytes),
    Stream(Box<dyn BodySource>),
}

impl RequestBody {
    pub(crate) fn length(&self) -> Option<u64> {
        match self {
            RequestBody::None => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream(s) => s.length(),
        }
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

/// A dispatch that failed validation, with the handler to report it to.
pub(crate) struct Rejected {
    pub(crate) error: DispatchError,
    pub(crate) handler: Box<dyn DispatchHandler>,
}

impl Rejected {
    pub(crate) fn notify(mut self) {
        metrics::REQUESTS_FAILED.increment();
        self.handler.on_error(self.error);
    }
}

/// One HTTP exchange queued on a client.
pub(crate) struct Request {
    pub(crate) seq: u64,
    pub(crate) method: String,
    pub(crate) path: String,
    /// Value of a caller-supplied `host` header.
    pub(crate) host: Option<String>,
    /// Serialized `name: value\r\n` lines, framing headers excluded.
    pub(crate) header_lines: Vec<u8>,
    pub(crate) content_length: Option<u64>,
    pub(crate) content_type: Option<String>,
    pub(crate) body: RequestBody,
    pub(crate) idempotent: bool,
    pub(crate) blocking: bool,
    pub(crate) upgrade: Option<String>,
    pub(crate) headers_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
    pub(crate) reset: Option<bool>,
    pub(crate) servername: Option<String>,
    signal: Option<AbortSignal>,
    handler: Box<dyn DispatchHandler>,
    pub(crate) aborted: bool,
    pub(crate) completed: bool,
}

fn next_seq() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Request {
    /// Validates `opts` and freezes the request shape.
    pub(crate) fn new(
        opts: DispatchOptions,
        handler: Box<dyn DispatchHandler>,
    ) -> Result<Request, Rejected> {
        let accepts_upgrade = handler.accepts_upgrade();
        let mut request = Request {
            seq: next_seq(),
            method: opts.method,
            path: opts.path,
            host: None,
            header_lines: Vec::new(),
            content_length: None,
            content_type: None,
            body: RequestBody::None,
            idempotent: false,
            blocking: opts.blocking.unwrap_or(false),
            upgrade: opts.upgrade,
            headers_timeout: opts.headers_timeout,
            body_timeout: opts.body_timeout,
            reset: opts.reset,
            servername: None,
            signal: opts.signal,
            handler,
            aborted: false,
            completed: false,
        };
        match request.init(opts.headers, opts.body, opts.idempotent, opts.expect_continue, accepts_upgrade) {
            Ok(()) => {}
            Err(error) => {
                return Err(Rejected {
                    error,
                    handler: request.handler,
                });
            }
        }
        request.servername = opts
            .servername
            .or_else(|| request.host.as_deref().and_then(servername_for));
        Ok(request)
    }

    fn init(
        &mut self,
        headers: Vec<(String, HeaderValue)>,
        body: Body,
        idempotent: Option<bool>,
        expect_continue: bool,
        accepts_upgrade: bool,
    ) -> Result<(), DispatchError> {
        let is_connect = self.method == "CONNECT";
        if !is_connect
            && !(self.path.starts_with('/')
                || self.path.starts_with("http://")
                || self.path.starts_with("https://"))
        {
            return Err(DispatchError::invalid(
                "path must be an absolute URL or start with a slash",
            ));
        }
        if !is_valid_path(self.path.as_bytes()) {
            return Err(DispatchError::invalid("invalid request path"));
        }
        if !is_token(self.method.as_bytes()) {
            return Err(DispatchError::invalid("invalid request method"));
        }
        if let Some(upgrade) = &self.upgrade
            && !is_token(upgrade.as_bytes())
        {
            return Err(DispatchError::invalid("invalid upgrade header"));
        }
        if expect_continue {
            return Err(DispatchError::NotSupported(
                "expect header not supported".into(),
            ));
        }
        if let Some(signal) = &self.signal
            && let Some(reason) = signal.reason()
        {
            return Err(reason);
        }
        if (self.upgrade.is_some() || is_connect) && !accepts_upgrade {
            return Err(DispatchError::invalid("invalid onUpgrade method"));
        }

        self.idempotent = idempotent.unwrap_or(self.method == "GET" || self.method == "HEAD");

        for (name, value) in headers {
            self.process_header(&name, value)?;
        }

        self.body = match body {
            Body::Empty => RequestBody::None,
            Body::Bytes(b) if b.is_empty() => RequestBody::None,
            Body::Bytes(b) => RequestBody::Bytes(b),
            Body::Blob(blob) => {
                if self.content_type.is_none()
                    && let Some(ty) = &blob.content_type
                {
                    self.add_header("content-type", ty)?;
                }
                if blob.data.is_empty() {
                    RequestBody::None
                } else {
                    RequestBody::Bytes(blob.data)
                }
            }
            Body::Form(form) => {
                let (data, content_type) = form.encode();
                if self.content_type.is_none() {
                    self.add_header("content-type", &content_type)?;
                }
                RequestBody::Bytes(data)
            }
            Body::Stream(source) => RequestBody::Stream(source),
        };
        Ok(())
    }

    /// Appends one validated header after construction.
    pub(crate) fn add_header(&mut self, name: &str, value: &str) -> Result<(), DispatchError> {
        self.process_header(name, HeaderValue::Single(value.to_string()))
    }

    fn process_header(&mut self, name: &str, value: HeaderValue) -> Result<(), DispatchError> {
        let known = KnownHeader::lookup(name.as_bytes());
        if known.is_none() && !is_token(name.as_bytes()) {
            return Err(DispatchError::invalid("invalid header key"));
        }
        let label = known.map(|k| k.as_str().to_string()).unwrap_or_else(|| name.to_string());
        let invalid = || DispatchError::invalid(format!("invalid {label} header"));

        let values = match value {
            HeaderValue::Single(v) => vec![v],
            HeaderValue::Multi(_) if known.is_some_and(|k| k.is_singular()) => {
                return Err(invalid());
            }
            HeaderValue::Multi(vs) => vs,
        };
        if values.iter().any(|v| !is_valid_header_value(v.as_bytes())) {
            return Err(invalid());
        }

        match known {
            Some(KnownHeader::Host) => {
                if self.host.is_some() {
                    return Err(invalid());
                }
                self.host = values.into_iter().next();
            }
            Some(KnownHeader::ContentLength) => {
                if self.content_length.is_some() {
                    return Err(invalid());
                }
                let len = values
                    .first()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(invalid)?;
                self.content_length = Some(len);
            }
            Some(KnownHeader::ContentType) => {
                if self.content_type.is_some() {
                    return Err(invalid());
                }
                if let Some(v) = values.first() {
                    self.content_type = Some(v.clone());
                    self.push_line(name, v);
                }
            }
            Some(KnownHeader::TransferEncoding | KnownHeader::KeepAlive | KnownHeader::Upgrade) => {
                return Err(invalid());
            }
            Some(KnownHeader::Connection) => {
                let v = values.first().map(|v| v.trim().to_ascii_lowercase());
                match v.as_deref() {
                    Some("close") => self.reset = Some(true),
                    Some("keep-alive") => {}
                    _ => return Err(DispatchError::invalid("invalid connection header")),
                }
            }
            Some(KnownHeader::Expect) => {
                return Err(DispatchError::NotSupported(
                    "expect header not supported".into(),
                ));
            }
            Some(KnownHeader::ContentDisposition) | None => {
                for v in &values {
                    self.push_line(name, v);
                }
            }
        }
        Ok(())
    }

    fn push_line(&mut self, name: &str, value: &str) {
        self.header_lines.extend_from_slice(name.as_bytes());
        self.header_lines.extend_from_slice(b": ");
        self.header_lines.extend_from_slice(value.as_bytes());
        self.header_lines.extend_from_slice(b"\r\n");
    }

    pub(crate) fn is_done(&self) -> bool {
        self.aborted || self.completed
    }

    /// True if an attached abort signal has fired.
    pub(crate) fn signal_reason(&self) -> Option<DispatchError> {
        self.signal.as_ref().and_then(AbortSignal::reason)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Binds the request to a connection. An `Err` means the request must
    /// be failed before anything is written.
    pub(crate) fn on_connect(&mut self, abort: AbortHandle) -> Result<(), DispatchError> {
        if let Some(reason) = self.signal_reason() {
            return Err(reason);
        }
        if let RequestBody::Stream(source) = &self.body
            && let Some(err) = source.failure()
        {
            return Err(err);
        }
        self.handler.on_connect(abort)
    }

    pub(crate) fn on_headers(
        &mut self,
        status: u16,
        headers: &[Header],
        resume: &ResumeHandle,
        status_text: &str,
    ) -> Result<bool, DispatchError> {
        if self.is_done() {
            return Ok(true);
        }
        self.handler.on_headers(status, headers, resume, status_text)
    }

    pub(crate) fn on_data(&mut self, chunk: Bytes) -> Result<bool, DispatchError> {
        if self.is_done() {
            return Ok(true);
        }
        self.handler.on_data(chunk)
    }

    pub(crate) fn on_body_sent(&mut self, chunk: &[u8]) {
        if !self.is_done() {
            self.handler.on_body_sent(chunk);
        }
    }

    pub(crate) fn on_request_sent(&mut self) {
        if !self.is_done() {
            self.handler.on_request_sent();
        }
    }

    pub(crate) fn on_upgrade(&mut self, status: u16, headers: &[Header], upgraded: Upgraded) {
        if self.is_done() {
            return;
        }
        self.completed = true;
        metrics::REQUESTS_COMPLETED.increment();
        self.handler.on_upgrade(status, headers, upgraded);
    }

    pub(crate) fn on_complete(&mut self, trailers: &[Header]) {
        if self.is_done() {
            return;
        }
        self.completed = true;
        self.release_body();
        match self.handler.on_complete(trailers) {
            Ok(()) => {
                metrics::REQUESTS_COMPLETED.increment();
            }
            Err(err) => {
                metrics::REQUESTS_FAILED.increment();
                self.handler.on_error(err);
            }
        }
    }

    /// Fails the request. Only the first terminal callback reaches the
    /// handler.
    pub(crate) fn on_error(&mut self, err: DispatchError) {
        if self.is_done() {
            return;
        }
        trace!(seq = self.seq, code = err.code(), "request failed");
        self.aborted = true;
        self.release_body();
        metrics::REQUESTS_FAILED.increment();
        self.handler.on_error(err);
    }

    fn release_body(&mut self) {
        if let RequestBody::Stream(source) = &mut self.body {
            source.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Blob, FormData};
    use crate::handler::AbortController;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Sink(Rc<RefCell<Vec<String>>>);

    impl DispatchHandler for Sink {
        fn on_complete(&mut self, _: &[Header]) -> Result<(), DispatchError> {
            self.0.borrow_mut().push("complete".into());
            Ok(())
        }

        fn on_error(&mut self, err: DispatchError) {
            self.0.borrow_mut().push(format!("error:{err}"));
        }
    }

    fn build(opts: DispatchOptions) -> Result<Request, DispatchError> {
        let log = Rc::new(RefCell::new(Vec::new()));
        Request::new(opts, Box::new(Sink(log))).map_err(|r| r.error)
    }

    fn message(opts: DispatchOptions) -> String {
        match build(opts) {
            Ok(_) => String::from("ok"),
            Err(err) => err.to_string(),
        }
    }

    #[test]
    fn test_path_and_method_validation() {
        assert_eq!(
            message(DispatchOptions::new("GET", "nope")),
            "path must be an absolute URL or start with a slash"
        );
        assert_eq!(message(DispatchOptions::new("GET", "/a b")), "invalid request path");
        assert_eq!(message(DispatchOptions::new("G ET", "/")), "invalid request method");
        assert_eq!(message(DispatchOptions::new("GET", "http://x/y")), "ok");
        assert_eq!(
            message(DispatchOptions::new("CONNECT", "example:443")),
            "invalid onUpgrade method"
        );
    }

    #[test]
    fn test_forbidden_headers() {
        for name in ["transfer-encoding", "Keep-Alive", "upgrade"] {
            let msg = message(DispatchOptions::new("GET", "/").header(name, "x"));
            assert_eq!(msg, format!("invalid {} header", name.to_ascii_lowercase()));
        }
        let err = build(DispatchOptions::new("GET", "/").header("expect", "100-continue"))
            .err()
            .map(|e| e.code());
        assert_eq!(err, Some("UND_ERR_NOT_SUPPORTED"));
        assert_eq!(
            message(DispatchOptions::new("GET", "/").header("connection", "upgrade")),
            "invalid connection header"
        );
        assert_eq!(
            message(DispatchOptions::new("GET", "/").header("x-bad", "a\r\nb")),
            "invalid x-bad header"
        );
        assert_eq!(
            message(DispatchOptions::new("GET", "/").header("bad key", "v")),
            "invalid header key"
        );
    }

    #[test]
    fn test_content_length_parsed_once() {
        let req = build(DispatchOptions::new("POST", "/").header("Content-Length", "10")).unwrap();
        assert_eq!(req.content_length, Some(10));
        assert!(req.header_lines.is_empty());

        let dup = DispatchOptions::new("POST", "/")
            .header("content-length", "10")
            .header("content-length", "10");
        assert_eq!(message(dup), "invalid content-length header");
        assert_eq!(
            message(DispatchOptions::new("POST", "/").header("content-length", "abc")),
            "invalid content-length header"
        );
    }

    #[test]
    fn test_connection_close_sets_reset() {
        let req = build(DispatchOptions::new("GET", "/").header("Connection", "close")).unwrap();
        assert_eq!(req.reset, Some(true));
        assert!(req.header_lines.is_empty());
    }

    #[test]
    fn test_multi_values_repeat_lines() {
        let req = build(DispatchOptions::new("GET", "/").header("x-a", vec!["1", "2"])).unwrap();
        assert_eq!(req.header_lines, b"x-a: 1\r\nx-a: 2\r\n");
        assert_eq!(
            message(DispatchOptions::new("GET", "/").header("content-type", vec!["a", "b"])),
            "invalid content-type header"
        );
    }

    #[test]
    fn test_host_and_servername() {
        let req = build(DispatchOptions::new("GET", "/").header("Host", "a.example:8443")).unwrap();
        assert_eq!(req.host.as_deref(), Some("a.example:8443"));
        assert_eq!(req.servername.as_deref(), Some("a.example"));
        assert!(req.header_lines.is_empty());

        let req = build(DispatchOptions::new("GET", "/").servername("b.example")).unwrap();
        assert_eq!(req.servername.as_deref(), Some("b.example"));
    }

    #[test]
    fn test_idempotent_defaults() {
        assert!(build(DispatchOptions::new("GET", "/")).unwrap().idempotent);
        assert!(build(DispatchOptions::new("HEAD", "/")).unwrap().idempotent);
        assert!(!build(DispatchOptions::new("POST", "/")).unwrap().idempotent);
        let mut opts = DispatchOptions::new("POST", "/");
        opts.idempotent = Some(true);
        assert!(build(opts).unwrap().idempotent);
    }

    #[test]
    fn test_blob_and_form_content_type() {
        let blob = Blob::new("hi", Some("text/plain"));
        let req = build(DispatchOptions::new("POST", "/").body(blob)).unwrap();
        assert_eq!(req.content_type.as_deref(), Some("text/plain"));
        assert_eq!(req.header_lines, b"content-type: text/plain\r\n");
        assert_eq!(req.body.length(), Some(2));

        let blob = Blob::new("hi", Some("text/plain"));
        let req = build(
            DispatchOptions::new("POST", "/")
                .header("content-type", "application/json")
                .body(blob),
        )
        .unwrap();
        assert_eq!(req.content_type.as_deref(), Some("application/json"));

        let mut form = FormData::new();
        form.append("a", "1");
        let req = build(DispatchOptions::new("POST", "/").body(form)).unwrap();
        let ty = req.content_type.clone().unwrap_or_default();
        assert!(ty.starts_with("multipart/form-data; boundary="));
        assert!(req.body.length().unwrap_or(0) > 0);
    }

    #[test]
    fn test_aborted_signal_rejects() {
        let controller = AbortController::new();
        controller.abort(None);
        let err = build(DispatchOptions::new("GET", "/").signal(controller.signal()))
            .err()
            .map(|e| e.code());
        assert_eq!(err, Some("ABORT_ERR"));
    }

    #[test]
    fn test_single_terminal_callback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut req =
            Request::new(DispatchOptions::new("GET", "/"), Box::new(Sink(log.clone()))).ok().unwrap();
        req.on_complete(&[]);
        req.on_error(DispatchError::RequestAborted);
        req.on_complete(&[]);
        assert_eq!(*log.borrow(), vec!["complete".to_string()]);
    }
}
