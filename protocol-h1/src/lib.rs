//! Sans-IO HTTP/1.1 wire codec for clients.
//!
//! - **Responses**: [`ResponseParser`] consumes raw socket bytes in slices of
//!   any size and reports status, headers, body chunks, trailers and message
//!   boundaries through [`ParserCallbacks`].
//! - **Requests**: [`RequestHead`] builds the request line and header block;
//!   [`encode_chunk`] and [`LAST_CHUNK`] frame chunked bodies.
//! - **Validation**: token, field-value and path byte classes plus the
//!   [`KnownHeader`] table used to recognise framing headers by name.
//!
//! Nothing here performs I/O or keeps time; the caller owns the socket and
//! decides what to do with pause, upgrade and error results.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_h1::{LAST_CHUNK, RequestHead, encode_chunk};
//!
//! let mut head = RequestHead::new("POST", "/upload");
//! head.header("host", "example.com");
//! let head = head.end_chunked();
//!
//! let mut body = BytesMut::new();
//! encode_chunk(&mut body, b"hello");
//! body.extend_from_slice(LAST_CHUNK);
//! assert_eq!(&body[..], b"5\r\nhello\r\n0\r\n\r\n");
//! assert!(head.ends_with(b"transfer-encoding: chunked\r\n\r\n"));
//! ```

mod encode;
mod error;
mod parser;
mod token;

pub use encode::{LAST_CHUNK, RequestHead, encode_chunk, encode_chunk_header};
pub use error::{ErrorCode, ParseError};
pub use parser::{
    Control, DEFAULT_MAX_HEADER_SIZE, HeadInfo, HeadersAction, ParseOutcome, ParserCallbacks,
    ParserOptions, ResponseParser,
};
pub use token::{
    KnownHeader, is_token, is_valid_header_value, is_valid_path, parse_keep_alive_timeout, trim,
};
