use std::io;
use std::sync::Arc;

use protocol_h1::ParseError;

/// Errors produced by the dispatcher.
///
/// Cloneable: one connection failure is delivered to every request it
/// affects. Each variant has a stable [`code`](DispatchError::code) for
/// programmatic branching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Malformed dispatch options, handler, or configuration.
    #[error("{0}")]
    InvalidArgument(String),

    /// Feature the engine does not implement.
    #[error("{0}")]
    NotSupported(String),

    #[error("The client is destroyed")]
    ClientDestroyed,

    #[error("The client is closed")]
    ClientClosed,

    #[error("Connect Timeout Error")]
    ConnectTimeout,

    #[error("Headers Timeout Error")]
    HeadersTimeout,

    #[error("Body Timeout Error")]
    BodyTimeout,

    #[error("Headers Overflow Error")]
    HeadersOverflow,

    #[error("Request body length does not match content-length header")]
    RequestContentLengthMismatch,

    #[error("Response body length does not match content-length header")]
    ResponseContentLengthMismatch,

    #[error("Response content exceeded max size")]
    ResponseExceededMaxSize,

    /// Response framing violation reported by the HTTP/1.1 parser.
    #[error("{0}")]
    Parser(#[from] ParseError),

    /// Transport-level failure ("closed", "other side closed", "bad upgrade").
    #[error("{0}")]
    Socket(String),

    /// Planned or benign teardown ("reset", "socket idle timeout").
    #[error("{0}")]
    Informational(String),

    #[error("Request aborted")]
    RequestAborted,

    /// Caller-initiated cancellation with a reason.
    #[error("{0}")]
    Aborted(String),

    /// TLS peer identity did not match the requested servername.
    #[error("Hostname/IP does not match certificate's altnames: {0}")]
    TlsAltName(String),

    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        DispatchError::Io(Arc::new(err))
    }
}

impl DispatchError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => "UND_ERR_INVALID_ARG",
            DispatchError::NotSupported(_) => "UND_ERR_NOT_SUPPORTED",
            DispatchError::ClientDestroyed => "UND_ERR_DESTROYED",
            DispatchError::ClientClosed => "UND_ERR_CLOSED",
            DispatchError::ConnectTimeout => "UND_ERR_CONNECT_TIMEOUT",
            DispatchError::HeadersTimeout => "UND_ERR_HEADERS_TIMEOUT",
            DispatchError::BodyTimeout => "UND_ERR_BODY_TIMEOUT",
            DispatchError::HeadersOverflow => "UND_ERR_HEADERS_OVERFLOW",
            DispatchError::RequestContentLengthMismatch => "UND_ERR_REQ_CONTENT_LENGTH_MISMATCH",
            DispatchError::ResponseContentLengthMismatch => "UND_ERR_RES_CONTENT_LENGTH_MISMATCH",
            DispatchError::ResponseExceededMaxSize => "UND_ERR_RES_EXCEEDED_MAX_SIZE",
            DispatchError::Parser(err) => err.code.as_str(),
            DispatchError::Socket(_) => "UND_ERR_SOCKET",
            DispatchError::Informational(_) => "UND_ERR_INFO",
            DispatchError::RequestAborted => "UND_ERR_ABORTED",
            DispatchError::Aborted(_) => "ABORT_ERR",
            DispatchError::TlsAltName(_) => "ERR_TLS_CERT_ALTNAME_INVALID",
            DispatchError::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionReset => "ECONNRESET",
                io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
                _ => "ERR_IO",
            },
        }
    }

    /// Benign teardown that is not reported to requests that are not in
    /// flight.
    pub fn is_informational(&self) -> bool {
        matches!(self, DispatchError::Informational(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DispatchError::InvalidArgument(msg.into())
    }

    pub(crate) fn info(msg: impl Into<String>) -> Self {
        DispatchError::Informational(msg.into())
    }

    pub(crate) fn socket(msg: impl Into<String>) -> Self {
        DispatchError::Socket(msg.into())
    }
}
