//! Pooled HTTP/1.1 request dispatcher.
//!
//! A [`Client`] sends requests to one origin over a single keep-alive
//! connection, pipelining up to `ClientConfig::pipelining` of them and
//! matching responses back in FIFO order. A [`Pool`] spreads requests over
//! several clients and holds the overflow in a shared queue.
//!
//! The engine is sans-IO. A [`Connector`] hands it [`Socket`]s; the driver
//! reports socket activity through [`SocketEvents`], calls
//! [`SocketEvents::tick`] when [`SocketEvents::next_timeout`] passes, and
//! calls [`SocketEvents::drive`] after each batch of events so deferred
//! work (handler resumes, aborts, streaming bodies) gets to run.
//!
//! Responses are delivered to a [`DispatchHandler`]; every dispatch ends in
//! exactly one `on_complete`, `on_error` or `on_upgrade`.
//!
//! # Example
//!
//! ```
//! use ringline_dispatch::{
//!     Client, ClientConfig, ConnectAttempt, ConnectOptions, DispatchError, DispatchHandler,
//!     DispatchOptions, Dispatcher, Header,
//! };
//!
//! struct Print;
//!
//! impl DispatchHandler for Print {
//!     fn on_complete(&mut self, _trailers: &[Header]) -> Result<(), DispatchError> {
//!         println!("done");
//!         Ok(())
//!     }
//!
//!     fn on_error(&mut self, err: DispatchError) {
//!         println!("failed: {err}");
//!     }
//! }
//!
//! // A driver would start a TCP connect here and report back through
//! // `SocketEvents::on_connect_result`.
//! let connector = |_: &ConnectOptions| ConnectAttempt::Pending;
//! let mut client = Client::new("http://localhost:8080", ClientConfig::default(), connector)?;
//! client.dispatch(DispatchOptions::new("GET", "/"), Box::new(Print));
//! assert_eq!(client.stats().pending, 1);
//! # Ok::<(), DispatchError>(())
//! ```

pub mod body;
mod client;
mod config;
mod dispatcher;
mod error;
mod fixed_queue;
mod handler;
pub mod metrics;
mod origin;
mod pool;
mod request;
mod socket;
mod timers;

pub use body::{
    Blob, Body, BodyPoll, BodySender, BodySource, ChannelSource, FormData, channel,
    channel_with_length,
};
pub use client::{Client, ClientStats};
pub use config::{ClientConfig, PoolConfig};
pub use dispatcher::{
    Completion, Composed, DispatchFn, Dispatcher, DispatcherEvent, DispatcherId, EventKind,
    Interceptor,
};
pub use error::DispatchError;
pub use fixed_queue::FixedQueue;
pub use handler::{
    AbortController, AbortHandle, AbortSignal, DispatchHandler, Header, ResumeHandle, Upgraded,
};
pub use origin::Origin;
pub use pool::{Pool, PoolStats};
pub use request::{DispatchOptions, HeaderValue};
pub use socket::{
    ConnectAttempt, ConnectOptions, Connector, ConnectionId, SessionCache, Socket, SocketEvents,
};
pub use timers::{Clock, ManualClock, SystemClock, TimerHandle, TimerWheel};
