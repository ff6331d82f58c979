//! The dispatcher contract shared by [`Client`](crate::Client) and
//! [`Pool`](crate::Pool), plus interceptor composition.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::error::DispatchError;
use crate::handler::DispatchHandler;
use crate::request::DispatchOptions;
use crate::socket::{ConnectionId, Socket, SocketEvents};

/// Identity of a client or pool, carried in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatcherId(u64);

impl DispatcherId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DispatcherId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Connect,
    Disconnect(DispatchError),
    ConnectionError(DispatchError),
    /// The dispatcher can accept work again after `dispatch` returned false.
    Drain,
}

/// Lifecycle notification. `targets` lists the emitting dispatcher first,
/// followed by the client it was forwarded from, if any.
#[derive(Debug, Clone)]
pub struct DispatcherEvent {
    pub kind: EventKind,
    pub origin: String,
    pub targets: Vec<DispatcherId>,
}

// ── Completion ───────────────────────────────────────────────────────

type Callback = Box<dyn FnOnce(&Result<(), DispatchError>)>;

#[derive(Default)]
struct CompletionState {
    result: Option<Result<(), DispatchError>>,
    callbacks: Vec<Callback>,
    waker: Option<Waker>,
}

/// Shared outcome of `close()` or `destroy()`.
///
/// Every caller of the same teardown gets a clone of the same completion.
/// Callbacks registered after resolution run immediately.
#[derive(Clone, Default)]
pub struct Completion {
    state: Rc<RefCell<CompletionState>>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &self.state.borrow().result)
            .finish()
    }
}

impl Completion {
    pub(crate) fn new() -> Self {
        Completion::default()
    }

    pub(crate) fn ready(result: Result<(), DispatchError>) -> Self {
        let completion = Completion::new();
        completion.resolve(result);
        completion
    }

    /// Settles the completion. Later calls are ignored.
    pub(crate) fn resolve(&self, result: Result<(), DispatchError>) {
        let (callbacks, waker) = {
            let mut state = self.state.borrow_mut();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result.clone());
            (std::mem::take(&mut state.callbacks), state.waker.take())
        };
        for callback in callbacks {
            callback(&result);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn on_complete(&self, callback: impl FnOnce(&Result<(), DispatchError>) + 'static) {
        let result = {
            let mut state = self.state.borrow_mut();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    pub fn is_complete(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    pub fn result(&self) -> Option<Result<(), DispatchError>> {
        self.state.borrow().result.clone()
    }

    /// Resolves once every part has; the first error wins.
    pub(crate) fn join(parts: Vec<Completion>) -> Completion {
        if parts.is_empty() {
            return Completion::ready(Ok(()));
        }
        let joined = Completion::new();
        let remaining = Rc::new(Cell::new(parts.len()));
        let first_err: Rc<RefCell<Option<DispatchError>>> = Rc::default();
        for part in parts {
            let joined = joined.clone();
            let remaining = remaining.clone();
            let first_err = first_err.clone();
            part.on_complete(move |result| {
                if let Err(err) = result {
                    first_err.borrow_mut().get_or_insert_with(|| err.clone());
                }
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    match first_err.borrow_mut().take() {
                        Some(err) => joined.resolve(Err(err)),
                        None => joined.resolve(Ok(())),
                    }
                }
            });
        }
        joined
    }
}

impl Future for Completion {
    type Output = Result<(), DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match &state.result {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

/// Something that sends requests.
pub trait Dispatcher {
    /// Queues a request. Failures are reported through `handler.on_error`.
    /// Returns false when the caller should hold further dispatches until
    /// a [`EventKind::Drain`] event.
    fn dispatch(&mut self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool;

    /// Stops accepting requests, waits for queued ones to finish, then
    /// tears down. Idempotent.
    fn close(&mut self) -> Completion;

    /// Fails every queued request with `err` (default `ClientDestroyed`)
    /// and tears down immediately. Idempotent.
    fn destroy(&mut self, err: Option<DispatchError>) -> Completion;

    /// Next pending lifecycle event.
    fn poll_event(&mut self) -> Option<DispatcherEvent>;

    fn is_closed(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    /// Wraps `dispatch` in `interceptors`; the last one runs first.
    fn compose(self, interceptors: Vec<Box<dyn Interceptor>>) -> Composed<Self>
    where
        Self: Sized,
    {
        Composed::new(self, interceptors)
    }
}

/// A `dispatch` function as seen by an interceptor.
pub type DispatchFn<'a> = Box<dyn FnMut(DispatchOptions, Box<dyn DispatchHandler>) -> bool + 'a>;

/// Decorates a dispatch function, e.g. to add headers or wrap the handler.
pub trait Interceptor {
    fn wrap<'a>(&'a self, next: DispatchFn<'a>) -> DispatchFn<'a>;
}

/// A dispatcher whose `dispatch` runs through a chain of interceptors.
pub struct Composed<D> {
    inner: D,
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl<D: Dispatcher> Composed<D> {
    pub fn new(inner: D, interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Composed {
            inner,
            interceptors,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: Dispatcher> Dispatcher for Composed<D> {
    fn dispatch(&mut self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool {
        let inner = &mut self.inner;
        let mut chain: DispatchFn<'_> = Box::new(move |opts, handler| inner.dispatch(opts, handler));
        for interceptor in &self.interceptors {
            chain = interceptor.wrap(chain);
        }
        chain(opts, handler)
    }

    fn close(&mut self) -> Completion {
        self.inner.close()
    }

    fn destroy(&mut self, err: Option<DispatchError>) -> Completion {
        self.inner.destroy(err)
    }

    fn poll_event(&mut self) -> Option<DispatcherEvent> {
        self.inner.poll_event()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl<D: Dispatcher + SocketEvents> SocketEvents for Composed<D> {
    fn on_connect_result(
        &mut self,
        id: ConnectionId,
        result: Result<Box<dyn Socket>, DispatchError>,
    ) {
        self.inner.on_connect_result(id, result);
    }

    fn on_socket_data(&mut self, id: ConnectionId, data: &[u8]) {
        self.inner.on_socket_data(id, data);
    }

    fn on_socket_drain(&mut self, id: ConnectionId) {
        self.inner.on_socket_drain(id);
    }

    fn on_socket_end(&mut self, id: ConnectionId) {
        self.inner.on_socket_end(id);
    }

    fn on_socket_error(&mut self, id: ConnectionId, err: DispatchError) {
        self.inner.on_socket_error(id, err);
    }

    fn on_socket_close(&mut self, id: ConnectionId) {
        self.inner.on_socket_close(id);
    }

    fn tick(&mut self) {
        self.inner.tick();
    }

    fn drive(&mut self) {
        self.inner.drive();
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.inner.next_timeout()
    }
}
