//! Incremental HTTP/1.1 response parser.
//!
//! The parser is fed arbitrary slices of the byte stream and reports what
//! it found through a [`ParserCallbacks`] implementation. It keeps only a
//! small line buffer for a status/header/chunk-size line split across
//! reads; body bytes are handed out as borrowed sub-slices of the input.
//!
//! Callbacks steer the parser with their return values. Pausing stops
//! `execute` after the current element and reports how much input was
//! consumed; the caller keeps the rest and feeds it again later. An upgrade
//! hands the remaining bytes back to the caller for good.
//!
//! # Example
//!
//! ```
//! use protocol_h1::{Control, HeadInfo, HeadersAction, ParseOutcome, ParserCallbacks, ResponseParser};
//!
//! #[derive(Default)]
//! struct Collect {
//!     status: u16,
//!     body: Vec<u8>,
//!     done: bool,
//! }
//!
//! impl ParserCallbacks for Collect {
//!     fn on_headers_complete(&mut self, head: &HeadInfo) -> HeadersAction {
//!         self.status = head.status;
//!         HeadersAction::Continue
//!     }
//!     fn on_body(&mut self, chunk: &[u8]) -> Control {
//!         self.body.extend_from_slice(chunk);
//!         Control::Continue
//!     }
//!     fn on_message_complete(&mut self) -> Control {
//!         self.done = true;
//!         Control::Continue
//!     }
//! }
//!
//! let mut parser = ResponseParser::default();
//! let mut sink = Collect::default();
//! let outcome = parser
//!     .execute(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello", &mut sink)
//!     .unwrap();
//! assert_eq!(outcome, ParseOutcome::Done);
//! assert_eq!(sink.status, 200);
//! assert_eq!(sink.body, b"hello");
//! assert!(sink.done);
//! ```

use crate::error::{ErrorCode, ParseError};
use crate::token::{KnownHeader, is_token, is_valid_header_value, trim};

/// Default cap on status line plus header block, in bytes.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

/// Longest accepted chunk-size line (size plus extensions).
const MAX_CHUNK_LINE_LEN: usize = 1024;

/// Parser tuning. Lenient flags relax framing checks for non-conformant
/// servers and are off by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserOptions {
    /// Cap on the status line plus header block (and separately on the
    /// trailer block).
    pub max_header_size: usize,
    /// Accept a bare CR as a line terminator.
    pub lenient_optional_lf_after_cr: bool,
    /// Accept spaces or tabs between a chunk size and its CRLF or extension.
    pub lenient_spaces_after_chunk_size: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            lenient_optional_lf_after_cr: false,
            lenient_spaces_after_chunk_size: false,
        }
    }
}

/// Summary of a parsed response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadInfo {
    pub status: u16,
    /// Minor version of `HTTP/1.x`.
    pub version_minor: u8,
    /// Whether the connection may carry another response after this one.
    pub keep_alive: bool,
    /// The server switched protocols (101).
    pub upgrade: bool,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Return value of the element callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Pause,
    Error,
}

/// Return value of [`ParserCallbacks::on_headers_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersAction {
    Continue,
    /// The response has no body regardless of its headers (HEAD).
    SkipBody,
    /// Accept the head, then stop before the body.
    Pause,
    /// Stop parsing for good; the rest of the stream is not HTTP.
    Upgrade,
    Error,
}

/// Successful result of [`ResponseParser::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The whole input was consumed.
    Done,
    /// A callback paused; bytes from `consumed` on were not looked at.
    Paused { consumed: usize },
    /// Protocol switched; bytes from `consumed` on belong to the new protocol.
    Upgrade { consumed: usize },
}

/// Receiver of parse events.
pub trait ParserCallbacks {
    fn on_message_begin(&mut self) -> Control {
        Control::Continue
    }

    fn on_status(&mut self, _status: u16, _reason: &[u8]) -> Control {
        Control::Continue
    }

    fn on_header(&mut self, _name: &[u8], _value: &[u8]) -> Control {
        Control::Continue
    }

    fn on_headers_complete(&mut self, head: &HeadInfo) -> HeadersAction;

    fn on_body(&mut self, chunk: &[u8]) -> Control;

    fn on_trailer(&mut self, _name: &[u8], _value: &[u8]) -> Control {
        Control::Continue
    }

    fn on_message_complete(&mut self) -> Control;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilEof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Body(BodyState),
    Upgraded,
    Closed,
    Failed(ParseError),
}

/// Per-message framing facts gathered from the header block.
#[derive(Debug, Default)]
struct Message {
    status: u16,
    version_minor: u8,
    content_length: Option<u64>,
    te_present: bool,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    skip_body: bool,
}

impl Message {
    fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    fn needs_eof(&self, skip_body: bool) -> bool {
        if skip_body
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return false;
        }
        if self.chunked {
            return false;
        }
        !(self.content_length.is_some() && !self.te_present)
    }

    fn should_keep_alive(&self, skip_body: bool) -> bool {
        let persistent = if self.version_minor >= 1 {
            !self.conn_close
        } else {
            self.conn_keep_alive
        };
        persistent && !self.needs_eof(skip_body)
    }
}

enum Step {
    Next,
    Return(ParseOutcome),
}

/// Incremental HTTP/1.1 response parser. One instance per connection.
#[derive(Debug)]
pub struct ResponseParser {
    options: ParserOptions,
    state: State,
    line: Vec<u8>,
    cr_seen: bool,
    header_bytes: usize,
    message: Message,
}

impl Default for ResponseParser {
    fn default() -> Self {
        ResponseParser::new(ParserOptions::default())
    }
}

impl ResponseParser {
    pub fn new(options: ParserOptions) -> Self {
        ResponseParser {
            options,
            state: State::StatusLine,
            line: Vec::with_capacity(128),
            cr_seen: false,
            header_bytes: 0,
            message: Message::default(),
        }
    }

    /// True between the first byte of a status line and message completion.
    pub fn in_message(&self) -> bool {
        match self.state {
            State::StatusLine => !self.line.is_empty() || self.cr_seen,
            State::Headers | State::Body(_) => true,
            _ => false,
        }
    }

    /// True once the connection can carry no further responses.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed | State::Upgraded | State::Failed(_))
    }

    /// Feeds `data` to the parser.
    ///
    /// Zero-length input is meaningful: after a pause it lets pending
    /// transitions (such as completing an empty body) run.
    pub fn execute<C: ParserCallbacks>(
        &mut self,
        data: &[u8],
        cb: &mut C,
    ) -> Result<ParseOutcome, ParseError> {
        let mut pos = 0;
        loop {
            let step = match self.state.clone() {
                State::Failed(err) => return Err(err),
                State::Upgraded => return Ok(ParseOutcome::Upgrade { consumed: 0 }),
                State::Closed => {
                    if pos < data.len() {
                        return Err(self.fail(
                            ErrorCode::ClosedConnection,
                            "Data after `Connection: close`",
                            pos,
                        ));
                    }
                    return Ok(ParseOutcome::Done);
                }
                State::StatusLine | State::Headers => {
                    if !self.read_line(data, &mut pos, true)? {
                        return Ok(ParseOutcome::Done);
                    }
                    let line = std::mem::take(&mut self.line);
                    let step = if self.state == State::StatusLine {
                        self.status_line(&line, cb, pos)
                    } else {
                        self.header_line(&line, cb, pos)
                    };
                    self.line = line;
                    self.line.clear();
                    step?
                }
                State::Body(body) => self.body(body, data, &mut pos, cb)?,
            };
            match step {
                Step::Next => {}
                Step::Return(outcome) => return Ok(outcome),
            }
        }
    }

    /// Signals end of input. Completes a response delimited by connection
    /// close; fails if the stream stopped inside any other message.
    pub fn finish<C: ParserCallbacks>(&mut self, cb: &mut C) -> Result<(), ParseError> {
        match self.state.clone() {
            State::Failed(err) => Err(err),
            State::Closed | State::Upgraded => Ok(()),
            State::StatusLine if !self.in_message() => Ok(()),
            State::Body(BodyState::UntilEof) => {
                self.message = Message::default();
                self.state = State::Closed;
                match cb.on_message_complete() {
                    Control::Error => Err(self.fail(ErrorCode::User, "User callback error", 0)),
                    _ => Ok(()),
                }
            }
            _ => Err(self.fail(ErrorCode::InvalidEofState, "Invalid EOF state", 0)),
        }
    }

    fn fail(&mut self, code: ErrorCode, reason: &'static str, offset: usize) -> ParseError {
        let err = ParseError::new(code, reason, offset);
        self.state = State::Failed(err.clone());
        err
    }

    fn control(&mut self, control: Control, pos: usize) -> Result<Step, ParseError> {
        match control {
            Control::Continue => Ok(Step::Next),
            Control::Pause => Ok(Step::Return(ParseOutcome::Paused { consumed: pos })),
            Control::Error => Err(self.fail(ErrorCode::User, "User callback error", pos)),
        }
    }

    // ── Lines ────────────────────────────────────────────────────────

    /// Moves bytes into `self.line` until a terminator. Returns true when
    /// a complete line is buffered. `head` selects header-size accounting
    /// over the chunk-size line cap.
    fn read_line(&mut self, data: &[u8], pos: &mut usize, head: bool) -> Result<bool, ParseError> {
        while *pos < data.len() {
            let b = data[*pos];
            if self.cr_seen {
                self.cr_seen = false;
                if b == b'\n' {
                    *pos += 1;
                    self.count(head, *pos)?;
                    return Ok(true);
                }
                if self.options.lenient_optional_lf_after_cr {
                    return Ok(true);
                }
                return Err(self.fail(ErrorCode::LfExpected, "Missing expected LF after CR", *pos));
            }
            *pos += 1;
            self.count(head, *pos)?;
            match b {
                b'\r' => self.cr_seen = true,
                b'\n' => return Ok(true),
                _ => self.line.push(b),
            }
        }
        Ok(false)
    }

    fn count(&mut self, head: bool, pos: usize) -> Result<(), ParseError> {
        if head {
            self.header_bytes += 1;
            if self.header_bytes > self.options.max_header_size {
                return Err(self.fail(ErrorCode::HeaderOverflow, "Header overflow", pos));
            }
        } else if self.line.len() > MAX_CHUNK_LINE_LEN {
            return Err(self.fail(ErrorCode::InvalidChunkSize, "Chunk size line too long", pos));
        }
        Ok(())
    }

    fn status_line<C: ParserCallbacks>(
        &mut self,
        line: &[u8],
        cb: &mut C,
        pos: usize,
    ) -> Result<Step, ParseError> {
        // Stray CRLF between messages.
        if line.is_empty() {
            self.header_bytes = 0;
            return Ok(Step::Next);
        }
        let Some(rest) = line.strip_prefix(b"HTTP/") else {
            return Err(self.fail(ErrorCode::InvalidVersion, "Expected HTTP/", pos));
        };
        let minor = match rest {
            [b'1', b'.', minor @ b'0'..=b'9', ..] => minor - b'0',
            _ => return Err(self.fail(ErrorCode::InvalidVersion, "Invalid HTTP version", pos)),
        };
        let rest = &rest[3..];
        let status = match rest {
            [b' ', a @ b'0'..=b'9', b @ b'0'..=b'9', c @ b'0'..=b'9'] => (a, b, c, &rest[4..]),
            [b' ', a @ b'0'..=b'9', b @ b'0'..=b'9', c @ b'0'..=b'9', b' ', ..] => {
                (a, b, c, &rest[5..])
            }
            _ => return Err(self.fail(ErrorCode::InvalidStatus, "Invalid status code", pos)),
        };
        let (a, b, c, reason) = status;
        let code = (a - b'0') as u16 * 100 + (b - b'0') as u16 * 10 + (c - b'0') as u16;

        self.message = Message {
            status: code,
            version_minor: minor,
            ..Message::default()
        };
        self.state = State::Headers;

        let control = cb.on_message_begin();
        if control != Control::Continue {
            return self.control(control, pos);
        }
        let control = cb.on_status(code, reason);
        self.control(control, pos)
    }

    fn split_header<'a>(&mut self, line: &'a [u8], pos: usize) -> Result<(&'a [u8], &'a [u8]), ParseError> {
        if matches!(line.first(), Some(b' ' | b'\t')) {
            return Err(self.fail(ErrorCode::InvalidHeaderToken, "Unexpected obs-fold", pos));
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(self.fail(ErrorCode::InvalidHeaderToken, "Invalid header field char", pos));
        };
        let name = &line[..colon];
        if !is_token(name) {
            return Err(self.fail(ErrorCode::InvalidHeaderToken, "Invalid header field char", pos));
        }
        let value = trim(&line[colon + 1..]);
        if !is_valid_header_value(value) {
            return Err(self.fail(ErrorCode::InvalidHeaderToken, "Invalid header value char", pos));
        }
        Ok((name, value))
    }

    fn header_line<C: ParserCallbacks>(
        &mut self,
        line: &[u8],
        cb: &mut C,
        pos: usize,
    ) -> Result<Step, ParseError> {
        if line.is_empty() {
            return self.headers_complete(cb, pos);
        }
        let (name, value) = self.split_header(line, pos)?;
        match KnownHeader::lookup(name) {
            Some(KnownHeader::ContentLength) => {
                if self.message.content_length.is_some() {
                    return Err(self.fail(
                        ErrorCode::UnexpectedContentLength,
                        "Duplicate Content-Length",
                        pos,
                    ));
                }
                let len = parse_decimal(value).ok_or_else(|| {
                    self.fail(
                        ErrorCode::InvalidContentLength,
                        "Invalid character in Content-Length",
                        pos,
                    )
                })?;
                self.message.content_length = Some(len);
            }
            Some(KnownHeader::TransferEncoding) => {
                self.message.te_present = true;
                let last = value.rsplit(|&b| b == b',').next().map(trim).unwrap_or_default();
                self.message.chunked = last.eq_ignore_ascii_case(b"chunked");
            }
            Some(KnownHeader::Connection) => {
                for token in value.split(|&b| b == b',').map(trim) {
                    if token.eq_ignore_ascii_case(b"close") {
                        self.message.conn_close = true;
                    } else if token.eq_ignore_ascii_case(b"keep-alive") {
                        self.message.conn_keep_alive = true;
                    }
                }
            }
            _ => {}
        }
        let control = cb.on_header(name, value);
        self.control(control, pos)
    }

    fn headers_complete<C: ParserCallbacks>(
        &mut self,
        cb: &mut C,
        pos: usize,
    ) -> Result<Step, ParseError> {
        if self.message.te_present && self.message.content_length.is_some() {
            return Err(self.fail(
                ErrorCode::UnexpectedContentLength,
                "Content-Length can't be present with Transfer-Encoding",
                pos,
            ));
        }
        let head = HeadInfo {
            status: self.message.status,
            version_minor: self.message.version_minor,
            keep_alive: self.message.should_keep_alive(false),
            upgrade: self.message.status == 101,
            content_length: self.message.content_length,
            chunked: self.message.chunked,
        };
        let action = cb.on_headers_complete(&head);
        match action {
            HeadersAction::Error => {
                return Err(self.fail(ErrorCode::User, "User callback error", pos));
            }
            HeadersAction::Upgrade => {
                self.state = State::Upgraded;
                return Ok(Step::Return(ParseOutcome::Upgrade { consumed: pos }));
            }
            _ => {}
        }

        let message = &mut self.message;
        message.skip_body = action == HeadersAction::SkipBody
            || (100..200).contains(&message.status)
            || message.status == 204
            || message.status == 304;
        let body = if message.skip_body {
            BodyState::Length(0)
        } else if message.chunked {
            BodyState::ChunkSize
        } else if message.te_present {
            BodyState::UntilEof
        } else if let Some(len) = message.content_length {
            BodyState::Length(len)
        } else {
            BodyState::UntilEof
        };
        self.state = State::Body(body);

        if action == HeadersAction::Pause {
            return Ok(Step::Return(ParseOutcome::Paused { consumed: pos }));
        }
        Ok(Step::Next)
    }

    // ── Body ─────────────────────────────────────────────────────────

    fn body<C: ParserCallbacks>(
        &mut self,
        body: BodyState,
        data: &[u8],
        pos: &mut usize,
        cb: &mut C,
    ) -> Result<Step, ParseError> {
        match body {
            BodyState::Length(0) => self.message_complete(cb, *pos),
            BodyState::Length(remaining) | BodyState::ChunkData(remaining) => {
                if *pos == data.len() {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                let take = remaining.min((data.len() - *pos) as u64) as usize;
                let chunk = &data[*pos..*pos + take];
                *pos += take;
                let left = remaining - take as u64;
                self.state = State::Body(match body {
                    BodyState::Length(_) => BodyState::Length(left),
                    _ if left == 0 => BodyState::ChunkDataEnd,
                    _ => BodyState::ChunkData(left),
                });
                let control = cb.on_body(chunk);
                self.control(control, *pos)
            }
            BodyState::UntilEof => {
                if *pos == data.len() {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                let chunk = &data[*pos..];
                *pos = data.len();
                let control = cb.on_body(chunk);
                self.control(control, *pos)
            }
            BodyState::ChunkSize => {
                if !self.read_line(data, pos, false)? {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                let size = self.chunk_size(*pos)?;
                self.line.clear();
                self.state = State::Body(if size == 0 {
                    self.header_bytes = 0;
                    BodyState::Trailers
                } else {
                    BodyState::ChunkData(size)
                });
                Ok(Step::Next)
            }
            BodyState::ChunkDataEnd => {
                if *pos == data.len() {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                if !self.cr_seen && !matches!(data[*pos], b'\r' | b'\n') {
                    return Err(self.fail(
                        ErrorCode::CrExpected,
                        "Expected CRLF after chunk data",
                        *pos,
                    ));
                }
                if !self.read_line(data, pos, false)? {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                if !self.line.is_empty() {
                    return Err(self.fail(
                        ErrorCode::CrExpected,
                        "Expected CRLF after chunk data",
                        *pos,
                    ));
                }
                self.state = State::Body(BodyState::ChunkSize);
                Ok(Step::Next)
            }
            BodyState::Trailers => {
                if !self.read_line(data, pos, true)? {
                    return Ok(Step::Return(ParseOutcome::Done));
                }
                let line = std::mem::take(&mut self.line);
                let step = if line.is_empty() {
                    self.message_complete(cb, *pos)
                } else {
                    self.split_header(&line, *pos)
                        .map(|(name, value)| cb.on_trailer(name, value))
                        .and_then(|control| self.control(control, *pos))
                };
                self.line = line;
                self.line.clear();
                step
            }
        }
    }

    fn chunk_size(&mut self, pos: usize) -> Result<u64, ParseError> {
        match parse_chunk_size(&self.line, self.options.lenient_spaces_after_chunk_size) {
            Ok(size) => Ok(size),
            Err(reason) => Err(self.fail(ErrorCode::InvalidChunkSize, reason, pos)),
        }
    }

    fn message_complete<C: ParserCallbacks>(
        &mut self,
        cb: &mut C,
        pos: usize,
    ) -> Result<Step, ParseError> {
        let keep_alive =
            self.message.is_interim() || self.message.should_keep_alive(self.message.skip_body);
        self.message = Message::default();
        self.header_bytes = 0;
        self.state = if keep_alive {
            State::StatusLine
        } else {
            State::Closed
        };
        let control = cb.on_message_complete();
        self.control(control, pos)
    }
}

/// Parses `<hex>[;ext]`, returning the size or the failure reason.
fn parse_chunk_size(line: &[u8], lenient_spaces: bool) -> Result<u64, &'static str> {
    let digits = line.iter().take_while(|b| b.is_ascii_hexdigit()).count();
    if digits == 0 {
        return Err("Invalid character in chunk size");
    }
    let mut rest = &line[digits..];
    if lenient_spaces {
        while let [b' ' | b'\t', tail @ ..] = rest {
            rest = tail;
        }
    }
    if !(rest.is_empty() || rest[0] == b';') {
        return Err("Invalid character in chunk size");
    }
    line[..digits].iter().try_fold(0u64, |size, &b| {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        };
        size.checked_mul(16)
            .and_then(|s| s.checked_add(nibble as u64))
            .ok_or("Chunk size overflow")
    })
}

fn parse_decimal(value: &[u8]) -> Option<u64> {
    if value.is_empty() {
        return None;
    }
    value.iter().try_fold(0u64, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add((b - b'0') as u64)
    })
}
