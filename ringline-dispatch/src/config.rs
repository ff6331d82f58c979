use std::net::IpAddr;
use std::time::Duration;

use protocol_h1::ParserOptions;

use crate::error::DispatchError;

/// Configuration for a single-origin [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Requests written on one socket before their responses arrive.
    /// 0 sends one request per connection with `connection: close`.
    pub pipelining: usize,

    /// Cap on the status line plus header block of a response, in bytes.
    pub max_header_size: usize,

    /// Time from request sent to response head. Zero disables.
    pub headers_timeout: Duration,

    /// Idle time allowed between body chunks. Zero disables.
    pub body_timeout: Duration,

    /// Idle lifetime of a kept-alive socket when the server gives no hint.
    pub keep_alive_timeout: Duration,

    /// Upper bound on a server-provided keep-alive hint.
    pub keep_alive_max_timeout: Duration,

    /// Subtracted from a server-provided keep-alive hint, to close before
    /// the server does.
    pub keep_alive_timeout_threshold: Duration,

    /// Time allowed for the connector to produce a socket. Zero disables.
    pub connect_timeout: Duration,

    /// Fail requests whose body length disagrees with `content-length`
    /// instead of logging a warning.
    pub strict_content_length: bool,

    /// Force `connection: close` after this many requests on one socket.
    pub max_requests_per_client: Option<usize>,

    /// Fail responses whose body exceeds this many bytes.
    pub max_response_size: Option<u64>,

    /// Local IP address to bind outgoing sockets to.
    pub local_address: Option<String>,

    /// Default TLS servername for `https` origins.
    pub servername: Option<String>,

    /// Accept a bare CR as a response line terminator.
    pub lenient_optional_lf_after_cr: bool,

    /// Accept whitespace after a response chunk size.
    pub lenient_spaces_after_chunk_size: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            pipelining: 1,
            max_header_size: 16 * 1024,
            headers_timeout: Duration::from_secs(300),
            body_timeout: Duration::from_secs(300),
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            keep_alive_timeout_threshold: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            strict_content_length: true,
            max_requests_per_client: None,
            max_response_size: None,
            local_address: None,
            servername: None,
            lenient_optional_lf_after_cr: false,
            lenient_spaces_after_chunk_size: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_header_size == 0 {
            return Err(DispatchError::invalid("invalid maxHeaderSize"));
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(DispatchError::invalid("invalid keepAliveTimeout"));
        }
        if self.keep_alive_max_timeout.is_zero() {
            return Err(DispatchError::invalid("invalid keepAliveMaxTimeout"));
        }
        if self.max_requests_per_client == Some(0) {
            return Err(DispatchError::invalid(
                "maxRequestsPerClient must be a positive number",
            ));
        }
        if self.max_response_size == Some(0) {
            return Err(DispatchError::invalid(
                "maxResponseSize must be a positive number",
            ));
        }
        if let Some(addr) = &self.local_address
            && addr.parse::<IpAddr>().is_err()
        {
            return Err(DispatchError::invalid(
                "localAddress must be valid string IP address",
            ));
        }
        Ok(())
    }

    pub(crate) fn effective_pipelining(&self) -> usize {
        self.pipelining.max(1)
    }

    pub(crate) fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            max_header_size: self.max_header_size,
            lenient_optional_lf_after_cr: self.lenient_optional_lf_after_cr,
            lenient_spaces_after_chunk_size: self.lenient_spaces_after_chunk_size,
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Maximum number of clients. `None` is unbounded.
    pub connections: Option<usize>,
    /// Settings applied to every client the pool creates.
    pub client: ClientConfig,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.connections == Some(0) {
            return Err(DispatchError::invalid("invalid connections"));
        }
        self.client.validate()
    }
}
