//! Connection counters. Kept to a single test so nothing else in this
//! binary moves the process-wide metrics underneath it.

mod common;

use common::{Net, Recorder, client, respond};
use ringline_dispatch::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, CONNECTIONS_OPENED};
use ringline_dispatch::{ClientConfig, DispatchOptions, Dispatcher};

#[test]
fn connection_counters_balance() {
    let opened = CONNECTIONS_OPENED.value();
    let closed = CONNECTIONS_CLOSED.value();
    let active = CONNECTIONS_ACTIVE.value();

    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());

    let (handler, log) = Recorder::new();
    client.dispatch(DispatchOptions::new("GET", "/"), handler);
    assert_eq!(CONNECTIONS_ACTIVE.value(), active + 1);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
    );
    assert!(log.borrow().completed);
    assert_eq!(CONNECTIONS_CLOSED.value(), closed + 1);
    assert_eq!(CONNECTIONS_ACTIVE.value(), active);

    let (handler, log) = Recorder::new();
    client.dispatch(DispatchOptions::new("GET", "/chat").upgrade("websocket"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: upgrade\r\n\r\n",
    );
    assert!(log.borrow().upgraded.is_some());

    assert_eq!(CONNECTIONS_OPENED.value(), opened + 2);
    assert_eq!(CONNECTIONS_CLOSED.value(), closed + 2);
    assert_eq!(CONNECTIONS_ACTIVE.value(), active);
}
