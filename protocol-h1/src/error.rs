//! Error types for HTTP/1.1 response parsing.

use std::fmt;

/// Symbolic parser error code.
///
/// The string form (`as_str`) is stable and is what callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidVersion,
    InvalidStatus,
    InvalidHeaderToken,
    InvalidContentLength,
    UnexpectedContentLength,
    InvalidTransferEncoding,
    InvalidChunkSize,
    CrExpected,
    LfExpected,
    HeaderOverflow,
    ClosedConnection,
    InvalidEofState,
    /// A callback asked the parser to stop with an error.
    User,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidVersion => "HPE_INVALID_VERSION",
            ErrorCode::InvalidStatus => "HPE_INVALID_STATUS",
            ErrorCode::InvalidHeaderToken => "HPE_INVALID_HEADER_TOKEN",
            ErrorCode::InvalidContentLength => "HPE_INVALID_CONTENT_LENGTH",
            ErrorCode::UnexpectedContentLength => "HPE_UNEXPECTED_CONTENT_LENGTH",
            ErrorCode::InvalidTransferEncoding => "HPE_INVALID_TRANSFER_ENCODING",
            ErrorCode::InvalidChunkSize => "HPE_INVALID_CHUNK_SIZE",
            ErrorCode::CrExpected => "HPE_CR_EXPECTED",
            ErrorCode::LfExpected => "HPE_LF_EXPECTED",
            ErrorCode::HeaderOverflow => "HPE_HEADER_OVERFLOW",
            ErrorCode::ClosedConnection => "HPE_CLOSED_CONNECTION",
            ErrorCode::InvalidEofState => "HPE_INVALID_EOF_STATE",
            ErrorCode::User => "HPE_USER",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`ResponseParser::execute`](crate::ResponseParser::execute).
///
/// Once a parser has returned an error it stays failed; every later call
/// returns the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ParseError {
    pub code: ErrorCode,
    pub reason: &'static str,
    /// Offset into the buffer passed to the failing `execute` call.
    pub offset: usize,
}

impl ParseError {
    pub(crate) fn new(code: ErrorCode, reason: &'static str, offset: usize) -> Self {
        ParseError {
            code,
            reason,
            offset,
        }
    }
}
