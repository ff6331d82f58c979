//! A set of clients to one origin sharing an overflow queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use crate::client::{Client, ClientStats};
use crate::config::PoolConfig;
use crate::dispatcher::{Completion, Dispatcher, DispatcherEvent, DispatcherId, EventKind};
use crate::error::DispatchError;
use crate::fixed_queue::FixedQueue;
use crate::handler::DispatchHandler;
use crate::origin::Origin;
use crate::request::{DispatchOptions, Rejected};
use crate::socket::{ConnectAttempt, ConnectOptions, ConnectionId, Connector, Socket, SocketEvents};
use crate::timers::{Clock, SystemClock};

/// One connector shared by every client of a pool.
#[derive(Clone)]
struct SharedConnector(Rc<RefCell<Box<dyn Connector>>>);

impl Connector for SharedConnector {
    fn connect(&mut self, options: &ConnectOptions) -> ConnectAttempt {
        self.0.borrow_mut().connect(options)
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Clients with a live connection.
    pub connected: usize,
    /// Connected clients that accept more work.
    pub free: usize,
    /// Requests not written yet, including the pool queue.
    pub pending: usize,
    /// Requests held in the pool queue.
    pub queued: usize,
    pub running: usize,
    pub size: usize,
}

/// Spreads requests over up to `connections` clients. Requests that find
/// no free client wait in a pool-wide FIFO.
pub struct Pool {
    id: DispatcherId,
    origin: Origin,
    config: PoolConfig,
    connector: SharedConnector,
    clock: Rc<dyn Clock>,
    clients: Vec<Client>,
    queue: FixedQueue<(DispatchOptions, Box<dyn DispatchHandler>)>,
    need_drain: bool,
    events: VecDeque<DispatcherEvent>,
    closed: bool,
    destroyed: bool,
    /// Resolved once the queue drained and every client closed.
    close_completion: Option<Completion>,
    close_waiting: bool,
    destroy_completion: Option<Completion>,
}

impl Pool {
    pub fn new(
        origin: &str,
        config: PoolConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, DispatchError> {
        Pool::with_clock(origin, config, connector, Rc::new(SystemClock))
    }

    pub fn with_clock(
        origin: &str,
        config: PoolConfig,
        connector: impl Connector + 'static,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let origin = Origin::parse(origin)?;
        Ok(Pool {
            id: DispatcherId::next(),
            origin,
            config,
            connector: SharedConnector(Rc::new(RefCell::new(Box::new(connector)))),
            clock,
            clients: Vec::new(),
            queue: FixedQueue::new(),
            need_drain: false,
            events: VecDeque::new(),
            closed: false,
            destroyed: false,
            close_completion: None,
            close_waiting: false,
            destroy_completion: None,
        })
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.queue.len();
        let mut stats = PoolStats {
            queued,
            pending: queued,
            size: queued,
            ..PoolStats::default()
        };
        for client in &self.clients {
            let ClientStats {
                connected,
                pending,
                running,
                size,
            } = client.stats();
            if connected {
                stats.connected += 1;
                if !client.need_drain() {
                    stats.free += 1;
                }
            }
            stats.pending += pending;
            stats.running += running;
            stats.size += size;
        }
        stats
    }

    /// A client that accepts work, creating one while under the cap.
    fn get_dispatcher(&mut self) -> Option<usize> {
        if let Some(idx) = self.clients.iter().position(|c| !c.need_drain()) {
            return Some(idx);
        }
        if self
            .config
            .connections
            .is_some_and(|max| self.clients.len() >= max)
        {
            return None;
        }
        let client = Client::from_parts(
            self.origin.clone(),
            self.config.client.clone(),
            Box::new(self.connector.clone()),
            self.clock.clone(),
        );
        debug!(origin = %self.origin, pool = %self.id, client = %client.id(), "new client");
        self.clients.push(client);
        Some(self.clients.len() - 1)
    }

    /// Forwards client events, feeding the pool queue on drain.
    fn pump_events(&mut self) {
        loop {
            let mut progressed = false;
            for idx in 0..self.clients.len() {
                while let Some(event) = self.clients[idx].poll_event() {
                    progressed = true;
                    self.on_client_event(idx, event);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn on_client_event(&mut self, idx: usize, event: DispatcherEvent) {
        let mut targets = vec![self.id];
        targets.extend(event.targets);
        match event.kind {
            EventKind::Drain => self.on_client_drain(idx, targets),
            kind => self.events.push_back(DispatcherEvent {
                kind,
                origin: event.origin,
                targets,
            }),
        }
    }

    fn on_client_drain(&mut self, idx: usize, targets: Vec<DispatcherId>) {
        let mut need_drain = false;
        while !need_drain {
            let Some((opts, handler)) = self.queue.shift() else {
                break;
            };
            need_drain = !self.clients[idx].dispatch(opts, handler);
        }

        if !need_drain && self.need_drain {
            self.need_drain = false;
            self.events.push_back(DispatcherEvent {
                kind: EventKind::Drain,
                origin: self.origin.to_string(),
                targets,
            });
        }

        if self.close_waiting && self.queue.is_empty() {
            self.close_waiting = false;
            self.close_clients();
        }
    }

    /// Closes every client and settles the pool's close once they are.
    fn close_clients(&mut self) {
        let parts = self.clients.iter_mut().map(Client::close).collect();
        let joined = Completion::join(parts);
        if let Some(target) = self.close_completion.clone() {
            joined.on_complete(move |result| target.resolve(result.clone()));
        }
    }

    fn client_for(&mut self, id: ConnectionId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.owns(id))
    }
}

impl Dispatcher for Pool {
    fn dispatch(&mut self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool {
        let error = if self.destroyed {
            Some(DispatchError::ClientDestroyed)
        } else if self.closed {
            Some(DispatchError::ClientClosed)
        } else {
            None
        };
        if let Some(error) = error {
            Rejected { error, handler }.notify();
            return false;
        }

        match self.get_dispatcher() {
            None => {
                self.need_drain = true;
                self.queue.push((opts, handler));
            }
            Some(idx) => {
                if !self.clients[idx].dispatch(opts, handler) {
                    self.need_drain = self.get_dispatcher().is_none();
                }
            }
        }
        self.pump_events();
        !self.need_drain
    }

    fn close(&mut self) -> Completion {
        if let Some(completion) = &self.close_completion {
            return completion.clone();
        }
        if self.destroyed {
            return Completion::ready(Err(DispatchError::ClientDestroyed));
        }
        debug!(origin = %self.origin, pool = %self.id, queued = self.queue.len(), "closing pool");
        self.closed = true;
        let completion = Completion::new();
        self.close_completion = Some(completion.clone());
        if self.queue.is_empty() {
            self.close_clients();
        } else {
            self.close_waiting = true;
        }
        self.pump_events();
        completion
    }

    fn destroy(&mut self, err: Option<DispatchError>) -> Completion {
        if let Some(completion) = &self.destroy_completion {
            return completion.clone();
        }
        let err = err.unwrap_or(DispatchError::ClientDestroyed);
        debug!(origin = %self.origin, pool = %self.id, code = err.code(), "destroying pool");
        self.closed = true;
        self.destroyed = true;
        self.close_waiting = false;

        while let Some((_, handler)) = self.queue.shift() {
            Rejected {
                error: err.clone(),
                handler,
            }
            .notify();
        }

        let parts = self
            .clients
            .iter_mut()
            .map(|c| c.destroy(Some(err.clone())))
            .collect();
        let completion = Completion::join(parts);
        if let Some(close) = self.close_completion.clone() {
            completion.on_complete(move |result| close.resolve(result.clone()));
        }
        self.destroy_completion = Some(completion.clone());
        self.pump_events();
        completion
    }

    fn poll_event(&mut self) -> Option<DispatcherEvent> {
        self.events.pop_front()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl SocketEvents for Pool {
    fn on_connect_result(
        &mut self,
        id: ConnectionId,
        result: Result<Box<dyn Socket>, DispatchError>,
    ) {
        match self.client_for(id) {
            Some(client) => client.on_connect_result(id, result),
            None => {
                if let Ok(mut socket) = result {
                    socket.destroy();
                }
            }
        }
        self.pump_events();
    }

    fn on_socket_data(&mut self, id: ConnectionId, data: &[u8]) {
        if let Some(client) = self.client_for(id) {
            client.on_socket_data(id, data);
        }
        self.pump_events();
    }

    fn on_socket_drain(&mut self, id: ConnectionId) {
        if let Some(client) = self.client_for(id) {
            client.on_socket_drain(id);
        }
        self.pump_events();
    }

    fn on_socket_end(&mut self, id: ConnectionId) {
        if let Some(client) = self.client_for(id) {
            client.on_socket_end(id);
        }
        self.pump_events();
    }

    fn on_socket_error(&mut self, id: ConnectionId, err: DispatchError) {
        if let Some(client) = self.client_for(id) {
            client.on_socket_error(id, err);
        }
        self.pump_events();
    }

    fn on_socket_close(&mut self, id: ConnectionId) {
        if let Some(client) = self.client_for(id) {
            client.on_socket_close(id);
        }
        self.pump_events();
    }

    fn tick(&mut self) {
        for client in &mut self.clients {
            client.tick();
        }
        self.pump_events();
    }

    fn drive(&mut self) {
        for client in &mut self.clients {
            client.drive();
        }
        self.pump_events();
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.clients.iter().filter_map(Client::next_timeout).min()
    }
}
