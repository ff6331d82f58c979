//! Dispatcher metrics.
//!
//! Process-wide counters for request outcomes, connection lifecycle and
//! fired timeouts. Exposed through the `metriken` registry.

use metriken::{Counter, Gauge, metric};

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "ringline/dispatch/requests/dispatched",
    description = "Requests accepted by dispatch()"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/requests/completed",
    description = "Requests whose response completed or upgraded"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/requests/failed",
    description = "Requests terminated through on_error"
)]
pub static REQUESTS_FAILED: Counter = Counter::new();

// ── Connections ──────────────────────────────────────────────────

#[metric(
    name = "ringline/dispatch/connections/opened",
    description = "Sockets handed to a client by its connector"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/connections/closed",
    description = "Client sockets torn down or handed off by an upgrade"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/connections/failed",
    description = "Connect attempts that failed or timed out"
)]
pub static CONNECT_FAILURES: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/connections/active",
    description = "Client sockets currently open"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(
    name = "ringline/dispatch/timeouts",
    description = "Connect, headers and body timeouts fired"
)]
pub static TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "ringline/dispatch/keepalive/expired",
    description = "Idle sockets closed by the keep-alive timer"
)]
pub static KEEPALIVE_EXPIRED: Counter = Counter::new();
