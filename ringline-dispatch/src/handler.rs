//! The request handler contract and the handles passed to it.
//!
//! Handlers never call back into the engine directly. [`AbortHandle`] and
//! [`ResumeHandle`] post a signal to their client's inbox, which is drained
//! at the end of the current engine call or on the next `drive()`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::error::DispatchError;
use crate::socket::{ConnectionId, Socket};

/// Response header or trailer as raw name/value bytes.
pub type Header = (Bytes, Bytes);

/// Receiver of one request's lifecycle.
///
/// Exactly one terminal callback fires per request: `on_complete`,
/// `on_upgrade` or `on_error`. Returning `Err` from `on_headers` or
/// `on_data` aborts the request and tears down its connection; an `Err`
/// from `on_connect` fails the request before anything is written; an
/// `Err` from `on_complete` is delivered back through `on_error`.
pub trait DispatchHandler {
    /// The request was bound to a connection and is about to be written.
    fn on_connect(&mut self, _abort: AbortHandle) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Response head. Return `Ok(false)` to pause body delivery until
    /// `resume` is called.
    fn on_headers(
        &mut self,
        _status: u16,
        _headers: &[Header],
        _resume: &ResumeHandle,
        _status_text: &str,
    ) -> Result<bool, DispatchError> {
        Ok(true)
    }

    /// A body chunk. Return `Ok(false)` to pause.
    fn on_data(&mut self, _chunk: Bytes) -> Result<bool, DispatchError> {
        Ok(true)
    }

    fn on_complete(&mut self, trailers: &[Header]) -> Result<(), DispatchError>;

    fn on_error(&mut self, err: DispatchError);

    /// Must return true for handlers dispatched with `upgrade` or `CONNECT`.
    fn accepts_upgrade(&self) -> bool {
        false
    }

    /// The connection was switched to another protocol and handed over.
    /// The handler owns the socket from here on.
    fn on_upgrade(&mut self, _status: u16, _headers: &[Header], mut upgraded: Upgraded) {
        upgraded.socket.destroy();
    }

    fn on_body_sent(&mut self, _chunk: &[u8]) {}

    fn on_request_sent(&mut self) {}
}

/// A socket released by the engine after a protocol switch.
pub struct Upgraded {
    pub id: ConnectionId,
    pub socket: Box<dyn Socket>,
    /// Bytes already read past the response head.
    pub head: Bytes,
}

// ── Signals ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum Signal {
    Abort {
        request: u64,
        error: Option<DispatchError>,
    },
    Resume {
        conn: ConnectionId,
    },
}

pub(crate) type Inbox = Rc<RefCell<VecDeque<Signal>>>;

pub(crate) fn new_inbox() -> Inbox {
    Rc::new(RefCell::new(VecDeque::new()))
}

/// Aborts one in-flight request. Safe to call at any time, any number of
/// times; only the first call has an effect.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    inbox: Weak<RefCell<VecDeque<Signal>>>,
    request: u64,
}

impl AbortHandle {
    pub(crate) fn new(inbox: &Inbox, request: u64) -> Self {
        AbortHandle {
            inbox: Rc::downgrade(inbox),
            request,
        }
    }

    /// Fails the request with `err` (default `RequestAborted`) and destroys
    /// its connection.
    pub fn abort(&self, err: Option<DispatchError>) {
        if let Some(inbox) = self.inbox.upgrade() {
            inbox.borrow_mut().push_back(Signal::Abort {
                request: self.request,
                error: err,
            });
        }
    }
}

/// Resumes a paused response.
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    inbox: Weak<RefCell<VecDeque<Signal>>>,
    conn: ConnectionId,
}

impl ResumeHandle {
    pub(crate) fn new(inbox: &Inbox, conn: ConnectionId) -> Self {
        ResumeHandle {
            inbox: Rc::downgrade(inbox),
            conn,
        }
    }

    pub fn resume(&self) {
        if let Some(inbox) = self.inbox.upgrade() {
            inbox.borrow_mut().push_back(Signal::Resume { conn: self.conn });
        }
    }
}

// ── AbortSignal ──────────────────────────────────────────────────────

/// Shared cancellation flag attached to a dispatch.
///
/// Aborting before the request reaches a connection is remembered and
/// applied as soon as it does; aborting while it runs destroys the
/// connection.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    reason: Rc<RefCell<Option<DispatchError>>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.reason.borrow().is_some()
    }

    pub fn reason(&self) -> Option<DispatchError> {
        self.reason.borrow().clone()
    }
}

/// Owner side of an [`AbortSignal`].
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        AbortController::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self, reason: Option<DispatchError>) {
        let mut slot = self.signal.reason.borrow_mut();
        if slot.is_none() {
            *slot = Some(reason.unwrap_or_else(|| {
                DispatchError::Aborted("This operation was aborted".into())
            }));
        }
    }
}
