//! End-to-end client behavior against in-memory sockets.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use common::{Log, Net, OK_HELLO, Recorder, client, client_for, elapse, respond};
use ringline_dispatch::{
    AbortController, Body, ClientConfig, DispatchError, DispatchFn, DispatchHandler,
    DispatchOptions, Dispatcher, EventKind, Interceptor, SocketEvents, channel,
};

fn get(path: &str) -> DispatchOptions {
    DispatchOptions::new("GET", path)
}

fn events(client: &mut impl Dispatcher) -> Vec<EventKind> {
    std::iter::from_fn(|| client.poll_event()).map(|e| e.kind).collect()
}

// -- Basic exchanges ----------------------------------------------------------

#[test]
fn simple_get() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    assert_eq!(net.count(), 1);
    {
        let attempts = net.attempts.borrow();
        let options = &attempts[0].options;
        assert_eq!(options.host, "localhost:8080");
        assert_eq!(options.hostname, "localhost");
        assert_eq!(options.protocol, "http:");
        assert_eq!(options.port, 8080);
    }

    let wire = net.last_wire();
    assert_eq!(
        wire.borrow().text(),
        "GET / HTTP/1.1\r\nhost: localhost:8080\r\nconnection: keep-alive\r\n\r\n"
    );
    assert_eq!(client.stats().running, 1);

    respond(&mut client, &net, OK_HELLO);
    let log = log.borrow();
    assert_eq!(log.events, ["connect", "headers 200", "data hello", "complete"]);
    assert!(log.request_sent);
    assert!(log.trailers.is_empty());
    assert_eq!(client.stats().size, 0);
    assert!(client.stats().connected);
    assert!(!wire.borrow().destroyed);
}

#[test]
fn request_origin_does_not_redirect_client() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/").origin("http://elsewhere:9000"), handler);
    assert_eq!(net.attempts.borrow()[0].options.port, 8080);
    assert!(net.last_wire().borrow().text().contains("host: localhost:8080\r\n"));

    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
}

#[test]
fn chunked_response() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\ntest\r\n0\r\n\r\n",
    );
    assert_eq!(log.borrow().events, ["connect", "headers 200", "data test", "complete"]);
}

#[test]
fn response_split_across_reads() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    for piece in OK_HELLO.chunks(3) {
        respond(&mut client, &net, piece);
    }
    let log = log.borrow();
    assert!(log.completed);
    assert_eq!(log.body, b"hello");
}

#[test]
fn events_connect_then_drain() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, _log) = Recorder::new();

    // One request fills a pipelining depth of one.
    assert!(!client.dispatch(get("/"), handler));
    respond(&mut client, &net, OK_HELLO);

    let kinds = events(&mut client);
    assert!(matches!(kinds[..], [EventKind::Connect, EventKind::Drain]));
}

#[test]
fn keep_alive_reuses_socket() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());

    for _ in 0..3 {
        let (handler, log) = Recorder::new();
        client.dispatch(get("/"), handler);
        respond(&mut client, &net, OK_HELLO);
        assert!(log.borrow().completed);
    }
    assert_eq!(net.count(), 1);
    assert_eq!(net.last_wire().borrow().text().matches("GET / ").count(), 3);
}

// -- Keep-alive -----------------------------------------------------------------

#[test]
fn keep_alive_hint_at_threshold_resets() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\nkeep-alive: timeout=1\r\ncontent-length: 5\r\n\r\nhello",
    );

    assert!(log.borrow().completed);
    assert!(log.borrow().error.is_none());
    assert!(net.last_wire().borrow().destroyed);

    let kinds = events(&mut client);
    let reset = kinds.iter().find_map(|k| match k {
        EventKind::Disconnect(err) => Some(err.clone()),
        _ => None,
    });
    assert_eq!(reset.map(|e| e.code()), Some("UND_ERR_INFO"));
    assert!(!client.stats().connected);
}

#[test]
fn idle_socket_closes_after_keep_alive_timeout() {
    let net = Net::default();
    let (mut client, clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
    assert!(client.next_timeout().is_some());

    elapse(&mut client, &clock, Duration::from_secs(3));
    assert!(!net.last_wire().borrow().destroyed);

    elapse(&mut client, &clock, Duration::from_secs(2));
    assert!(net.last_wire().borrow().destroyed);
    assert!(log.borrow().error.is_none());

    // The next request opens a fresh connection.
    let (handler, log) = Recorder::new();
    client.dispatch(get("/again"), handler);
    assert_eq!(net.count(), 2);
    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
}

#[test]
fn keep_alive_hint_sets_idle_timeout() {
    let net = Net::default();
    let (mut client, clock) = client(&net, ClientConfig::default());
    let (handler, _log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\nkeep-alive: timeout=10\r\ncontent-length: 5\r\n\r\nhello",
    );

    // 10s hint minus the 1s threshold.
    elapse(&mut client, &clock, Duration::from_secs(8));
    assert!(!net.last_wire().borrow().destroyed);
    elapse(&mut client, &clock, Duration::from_secs(2));
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn connection_close_response_resets() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 5\r\n\r\nhello",
    );
    assert!(log.borrow().completed);
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn eof_completes_close_delimited_response() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\nstream");
    assert!(!log.borrow().completed);

    client.on_socket_end(net.last_id());
    let log = log.borrow();
    assert!(log.completed);
    assert_eq!(log.body, b"stream");
    assert!(log.error.is_none());
}

// -- Servername -----------------------------------------------------------------

#[test]
fn servername_change_forces_reconnect() {
    let net = Net::default();
    let (mut client, _clock) = client_for("https://example.com", &net, ClientConfig::default());

    let (a, log_a) = Recorder::new();
    client.dispatch(get("/").servername("a.example"), a);
    let (b, log_b) = Recorder::new();
    client.dispatch(get("/").servername("b.example"), b);

    assert_eq!(net.count(), 1);
    assert_eq!(
        net.attempts.borrow()[0].options.servername.as_deref(),
        Some("a.example")
    );
    assert_eq!(net.wire(0).borrow().text().matches("GET / ").count(), 1);

    respond(&mut client, &net, OK_HELLO);
    assert!(log_a.borrow().completed);
    assert!(net.wire(0).borrow().destroyed);
    assert_eq!(net.count(), 2);
    assert_eq!(
        net.attempts.borrow()[1].options.servername.as_deref(),
        Some("b.example")
    );

    respond(&mut client, &net, OK_HELLO);
    assert!(log_b.borrow().completed);
    assert!(log_a.borrow().error.is_none());
    assert!(log_b.borrow().error.is_none());
}

#[test]
fn https_defaults_servername_to_hostname() {
    let net = Net::default();
    let (mut client, _clock) = client_for("https://example.com", &net, ClientConfig::default());
    let (handler, _log) = Recorder::new();

    client.dispatch(get("/"), handler);
    let attempts = net.attempts.borrow();
    assert_eq!(attempts[0].options.servername.as_deref(), Some("example.com"));
    assert_eq!(attempts[0].options.port, 443);
}

// -- Request bodies -----------------------------------------------------------

#[test]
fn content_length_mismatch_never_writes() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    let opts = DispatchOptions::new("POST", "/upload")
        .header("content-length", "10")
        .body("hello");
    client.dispatch(opts, handler);

    assert_eq!(
        log.borrow().error_code(),
        Some("UND_ERR_REQ_CONTENT_LENGTH_MISMATCH")
    );
    assert!(!log.borrow().events.contains(&"connect".to_string()));
    assert!(net.last_wire().borrow().written.is_empty());
    assert_eq!(client.stats().size, 0);
}

#[test]
fn fixed_body_is_framed_with_content_length() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    let opts = DispatchOptions::new("POST", "/echo")
        .header("content-type", "text/plain")
        .body("hello");
    client.dispatch(opts, handler);

    let text = net.last_wire().borrow().text();
    assert!(text.starts_with("POST /echo HTTP/1.1\r\n"));
    assert!(text.contains("content-type: text/plain\r\n"));
    assert!(text.ends_with("content-length: 5\r\n\r\nhello"));
    assert_eq!(log.borrow().body_sent, 5);
    assert!(log.borrow().request_sent);
}

#[test]
fn empty_post_sends_zero_length() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, _log) = Recorder::new();

    client.dispatch(DispatchOptions::new("POST", "/"), handler);
    assert!(net.last_wire().borrow().text().ends_with("content-length: 0\r\n\r\n"));
}

#[test]
fn streamed_body_is_chunked() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();
    let (sender, source) = channel();

    let opts = DispatchOptions::new("POST", "/stream").body(Body::stream(source));
    client.dispatch(opts, handler);
    // Unknown-length streams are started on the next turn.
    client.drive();
    assert_eq!(net.count(), 1);
    assert!(net.last_wire().borrow().written.is_empty());

    sender.send("hello").unwrap();
    client.drive();
    let text = net.last_wire().borrow().text();
    assert!(text.contains("transfer-encoding: chunked\r\n\r\n5\r\nhello\r\n"));

    sender.send(" world").unwrap();
    sender.finish();
    client.drive();
    assert!(net.last_wire().borrow().text().ends_with("6\r\n world\r\n0\r\n\r\n"));
    assert!(log.borrow().request_sent);
    assert_eq!(log.borrow().body_sent, 11);

    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
    assert!(sender.is_closed());
}

#[test]
fn streamed_body_with_length_is_not_chunked() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();
    let (sender, source) = ringline_dispatch::channel_with_length(Some(5));

    let opts = DispatchOptions::new("PUT", "/blob").body(Body::stream(source));
    client.dispatch(opts, handler);
    sender.send("hello").unwrap();
    sender.finish();
    client.drive();

    let text = net.last_wire().borrow().text();
    assert!(text.ends_with("content-length: 5\r\n\r\nhello"));
    assert!(!text.contains("transfer-encoding"));
    assert!(log.borrow().request_sent);
}

#[test]
fn failed_stream_aborts_request() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();
    let (sender, source) = channel();

    client.dispatch(DispatchOptions::new("POST", "/").body(Body::stream(source)), handler);
    client.drive();
    sender.send("part").unwrap();
    client.drive();
    sender.abort(DispatchError::Aborted("producer gave up".into()));
    client.drive();

    assert_eq!(log.borrow().error_code(), Some("ABORT_ERR"));
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn iterator_body() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    let chunks = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")];
    client.dispatch(
        DispatchOptions::new("POST", "/").body(Body::from_chunks(chunks)),
        handler,
    );
    client.drive();
    assert!(
        net.last_wire()
            .borrow()
            .text()
            .ends_with("2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n")
    );
    assert!(log.borrow().request_sent);
}

// -- Pipelining ---------------------------------------------------------------

#[test]
fn pipelined_responses_arrive_in_order() {
    let net = Net::default();
    let config = ClientConfig {
        pipelining: 3,
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut logs = Vec::new();
    for label in ["a", "b", "c"] {
        let (handler, log) = Recorder::ordered(label, &order);
        client.dispatch(get(&format!("/{label}")), handler);
        logs.push(log);
    }
    let text = net.last_wire().borrow().text();
    let a = text.find("GET /a ").unwrap();
    let b = text.find("GET /b ").unwrap();
    let c = text.find("GET /c ").unwrap();
    assert!(a < b && b < c);
    assert_eq!(client.stats().running, 3);

    let wire = [OK_HELLO, OK_HELLO, OK_HELLO].concat();
    respond(&mut client, &net, &wire);
    assert_eq!(*order.borrow(), ["a", "b", "c"]);
    assert!(logs.iter().all(|log| log.borrow().completed));
}

#[test]
fn pipelining_depth_is_respected() {
    let net = Net::default();
    let config = ClientConfig {
        pipelining: 2,
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);

    for _ in 0..4 {
        let (handler, _log) = Recorder::new();
        client.dispatch(get("/"), handler);
    }
    let stats = client.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.pending, 2);

    respond(&mut client, &net, OK_HELLO);
    assert_eq!(client.stats().running, 2);
    assert_eq!(client.stats().pending, 1);
}

#[test]
fn saturated_socket_holds_pipelined_writes_until_drain() {
    let net = Net::default();
    let config = ClientConfig {
        pipelining: 3,
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);

    let (a, _log_a) = Recorder::new();
    client.dispatch(get("/a"), a);
    let wire = net.last_wire();
    events(&mut client);

    // The write of /b fills the send buffer.
    wire.borrow_mut().writable = false;
    let (b, _log_b) = Recorder::new();
    assert!(!client.dispatch(get("/b"), b));
    let (c, log_c) = Recorder::new();
    assert!(!client.dispatch(get("/c"), c));
    client.drive();

    assert!(wire.borrow().text().contains("GET /b "));
    assert!(!wire.borrow().text().contains("GET /c "));
    assert_eq!(client.stats().running, 2);
    assert_eq!(client.stats().pending, 1);
    assert!(events(&mut client).iter().all(|k| !matches!(k, EventKind::Drain)));

    wire.borrow_mut().writable = true;
    client.on_socket_drain(net.last_id());
    assert!(wire.borrow().text().contains("GET /c "));
    assert_eq!(client.stats().running, 3);
    assert!(events(&mut client).iter().all(|k| !matches!(k, EventKind::Drain)));

    let responses = [OK_HELLO, OK_HELLO, OK_HELLO].concat();
    respond(&mut client, &net, &responses);
    assert!(log_c.borrow().completed);
    assert!(events(&mut client).iter().any(|k| matches!(k, EventKind::Drain)));
}

#[test]
fn non_idempotent_request_waits_for_running() {
    let net = Net::default();
    let config = ClientConfig {
        pipelining: 4,
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);

    let (first, _) = Recorder::new();
    client.dispatch(get("/first"), first);
    let (post, post_log) = Recorder::new();
    client.dispatch(DispatchOptions::new("POST", "/write").body("x"), post);

    assert!(!net.last_wire().borrow().text().contains("POST"));
    assert_eq!(client.stats().pending, 1);

    respond(&mut client, &net, OK_HELLO);
    assert!(net.last_wire().borrow().text().contains("POST /write"));
    assert!(post_log.borrow().request_sent);
}

#[test]
fn max_requests_per_client_closes_socket() {
    let net = Net::default();
    let config = ClientConfig {
        max_requests_per_client: Some(1),
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);

    let (handler, _) = Recorder::new();
    client.dispatch(get("/"), handler);
    respond(&mut client, &net, OK_HELLO);
    let (handler, log) = Recorder::new();
    client.dispatch(get("/"), handler);

    let text = net.last_wire().borrow().text();
    assert!(text.ends_with("connection: close\r\n\r\n"));
    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
    assert!(net.last_wire().borrow().destroyed);
}

// -- Backpressure ---------------------------------------------------------------

#[test]
fn paused_handler_stops_delivery_until_resumed() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::with_log(Log {
        pause_once: true,
        ..Log::default()
    });

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello",
    );
    assert!(net.last_wire().borrow().paused);

    respond(&mut client, &net, b"world");
    assert_eq!(log.borrow().body, b"hello");
    assert!(!log.borrow().completed);

    let resume = log.borrow().resume.clone().unwrap();
    resume.resume();
    client.drive();

    let log = log.borrow();
    assert_eq!(log.body, b"helloworld");
    assert!(log.completed);
    assert!(!net.last_wire().borrow().paused);
}

// -- Failures -----------------------------------------------------------------

#[test]
fn headers_timeout() {
    let net = Net::default();
    let config = ClientConfig {
        headers_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let (mut client, clock) = client(&net, config);
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    elapse(&mut client, &clock, Duration::from_millis(100));
    assert!(log.borrow().error.is_none());
    elapse(&mut client, &clock, Duration::from_millis(150));

    assert_eq!(log.borrow().error_code(), Some("UND_ERR_HEADERS_TIMEOUT"));
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn unbounded_timeouts_never_fire() {
    let net = Net::default();
    let config = ClientConfig {
        headers_timeout: Duration::MAX,
        keep_alive_timeout: Duration::MAX,
        ..ClientConfig::default()
    };
    let (mut client, clock) = client(&net, config);
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    elapse(&mut client, &clock, Duration::from_secs(1));
    assert!(log.borrow().error.is_none());

    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
    elapse(&mut client, &clock, Duration::from_secs(3600));
    assert!(!net.last_wire().borrow().destroyed);
    assert!(client.stats().connected);
}

#[test]
fn per_request_headers_timeout_overrides_config() {
    let net = Net::default();
    let (mut client, clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    let mut opts = get("/");
    opts.headers_timeout = Some(Duration::from_millis(50));
    client.dispatch(opts, handler);
    elapse(&mut client, &clock, Duration::from_millis(60));
    assert_eq!(log.borrow().error_code(), Some("UND_ERR_HEADERS_TIMEOUT"));
}

#[test]
fn body_timeout() {
    let net = Net::default();
    let config = ClientConfig {
        body_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let (mut client, clock) = client(&net, config);
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhel");
    elapse(&mut client, &clock, Duration::from_millis(200));
    respond(&mut client, &net, b"lo");
    elapse(&mut client, &clock, Duration::from_millis(200));
    assert!(log.borrow().error.is_none());

    elapse(&mut client, &clock, Duration::from_millis(150));
    let log = log.borrow();
    assert_eq!(log.body, b"hello");
    assert_eq!(log.error_code(), Some("UND_ERR_BODY_TIMEOUT"));
}

#[test]
fn response_exceeding_max_size() {
    let net = Net::default();
    let config = ClientConfig {
        max_response_size: Some(4),
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, OK_HELLO);
    let log = log.borrow();
    assert!(!log.completed);
    assert_eq!(log.error_code(), Some("UND_ERR_RES_EXCEEDED_MAX_SIZE"));
}

#[test]
fn short_body_then_eof_is_length_mismatch() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\nconnection: close\r\n\r\nhello",
    );
    client.on_socket_end(net.last_id());

    let log = log.borrow();
    assert!(!log.completed);
    assert_eq!(log.error_code(), Some("UND_ERR_RES_CONTENT_LENGTH_MISMATCH"));
}

#[test]
fn malformed_response_fails_request() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, b"NOT HTTP\r\n\r\n");
    assert!(log.borrow().error.is_some());
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn socket_error_fails_every_running_request() {
    let net = Net::default();
    let config = ClientConfig {
        pipelining: 2,
        ..ClientConfig::default()
    };
    let (mut client, _clock) = client(&net, config);
    let (a, log_a) = Recorder::new();
    let (b, log_b) = Recorder::new();
    client.dispatch(get("/a"), a);
    client.dispatch(get("/b"), b);

    client.on_socket_error(
        net.last_id(),
        DispatchError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
    );
    assert_eq!(log_a.borrow().error_code(), Some("ERR_IO"));
    assert_eq!(log_b.borrow().error_code(), Some("ERR_IO"));
    assert_eq!(client.stats().size, 0);
}

#[test]
fn peer_close_requeues_nothing_when_idle() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(&mut client, &net, OK_HELLO);
    client.on_socket_close(net.last_id());

    assert!(log.borrow().error.is_none());
    assert!(!client.stats().connected);
    let kinds = events(&mut client);
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Disconnect(_))));
}

#[test]
fn connect_failure_fails_queue() {
    let net = Net::pending();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (a, log_a) = Recorder::new();
    let (b, log_b) = Recorder::new();
    client.dispatch(get("/"), a);
    client.dispatch(get("/"), b);
    assert_eq!(net.count(), 1);

    let refused = DispatchError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
    client.on_connect_result(net.last_id(), Err(refused));

    assert_eq!(log_a.borrow().error_code(), Some("ECONNREFUSED"));
    assert_eq!(log_b.borrow().error_code(), Some("ECONNREFUSED"));
    let kinds = events(&mut client);
    assert!(kinds.iter().any(|k| matches!(k, EventKind::ConnectionError(_))));
}

#[test]
fn connect_timeout() {
    let net = Net::pending();
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    let (mut client, clock) = client(&net, config);
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    elapse(&mut client, &clock, Duration::from_millis(600));
    assert_eq!(log.borrow().error_code(), Some("UND_ERR_CONNECT_TIMEOUT"));

    // A socket that shows up late is thrown away.
    client.on_connect_result(net.id(0), Ok(net.socket(0)));
    assert!(net.wire(0).borrow().destroyed);
    assert!(!client.stats().connected);
}

#[test]
fn altname_failure_only_fails_matching_servername() {
    let net = Net::pending();
    let (mut client, _clock) = client_for("https://example.com", &net, ClientConfig::default());
    let (a, log_a) = Recorder::new();
    let (b, log_b) = Recorder::new();
    client.dispatch(get("/").servername("a.example"), a);
    client.dispatch(get("/").servername("b.example"), b);

    client.on_connect_result(
        net.id(0),
        Err(DispatchError::TlsAltName("a.example".into())),
    );
    assert_eq!(log_a.borrow().error_code(), Some("ERR_TLS_CERT_ALTNAME_INVALID"));
    assert!(log_b.borrow().error.is_none());
    assert_eq!(net.count(), 2);
    assert_eq!(
        net.attempts.borrow()[1].options.servername.as_deref(),
        Some("b.example")
    );
}

#[test]
fn h2_alpn_is_rejected() {
    let net = Net {
        alpn: Some("h2"),
        ..Net::default()
    };
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    assert_eq!(log.borrow().error_code(), Some("UND_ERR_NOT_SUPPORTED"));
    assert!(net.last_wire().borrow().destroyed);
}

// -- Aborts ---------------------------------------------------------------------

#[test]
fn abort_running_request_destroys_socket() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    let abort = log.borrow().abort.clone().unwrap();
    abort.abort(None);
    client.drive();

    assert_eq!(log.borrow().error_code(), Some("UND_ERR_ABORTED"));
    assert!(net.last_wire().borrow().destroyed);

    // Late bytes for the dead socket are ignored.
    client.on_socket_data(net.id(0), OK_HELLO);
    assert!(!log.borrow().completed);
}

#[test]
fn abort_signal_before_connect() {
    let net = Net::pending();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let controller = AbortController::new();
    let (handler, log) = Recorder::new();

    client.dispatch(get("/").signal(controller.signal()), handler);
    controller.abort(None);
    client.drive();

    assert_eq!(log.borrow().error_code(), Some("ABORT_ERR"));
    assert!(!log.borrow().events.contains(&"connect".to_string()));
    assert_eq!(client.stats().size, 0);
}

#[test]
fn abort_signal_while_running() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let controller = AbortController::new();
    let (handler, log) = Recorder::new();

    client.dispatch(get("/").signal(controller.signal()), handler);
    controller.abort(Some(DispatchError::Aborted("stop".into())));
    client.drive();

    assert_eq!(log.borrow().error_code(), Some("ABORT_ERR"));
    assert!(net.last_wire().borrow().destroyed);
}

#[test]
fn already_aborted_signal_is_rejected() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let controller = AbortController::new();
    controller.abort(None);
    let (handler, log) = Recorder::new();

    assert!(!client.dispatch(get("/").signal(controller.signal()), handler));
    assert_eq!(log.borrow().error_code(), Some("ABORT_ERR"));
    assert_eq!(net.count(), 0);
}

// -- Upgrade ----------------------------------------------------------------------

#[test]
fn upgrade_hands_over_socket() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/chat").upgrade("websocket"), handler);
    let text = net.last_wire().borrow().text();
    assert!(text.contains("connection: upgrade\r\nupgrade: websocket\r\n"));

    respond(
        &mut client,
        &net,
        b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: upgrade\r\n\r\n\x81\x00",
    );

    let log = log.borrow();
    assert_eq!(log.events.last().map(String::as_str), Some("upgrade 101"));
    let upgraded = log.upgraded.as_ref().unwrap();
    assert_eq!(&upgraded.head[..], b"\x81\x00");
    assert!(!net.last_wire().borrow().destroyed);
    assert_eq!(client.stats().size, 0);
    assert!(!client.stats().connected);
}

#[test]
fn unexpected_upgrade_is_an_error() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();

    client.dispatch(get("/"), handler);
    respond(
        &mut client,
        &net,
        b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n",
    );
    assert_eq!(log.borrow().error_code(), Some("UND_ERR_SOCKET"));
}

// -- Close / destroy ------------------------------------------------------------

#[test]
fn destroy_fails_every_queued_request() {
    let net = Net::pending();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let logs: Vec<_> = (0..5)
        .map(|_| {
            let (handler, log) = Recorder::new();
            client.dispatch(get("/"), handler);
            log
        })
        .collect();

    let done = client.destroy(Some(DispatchError::Aborted("shutdown".into())));
    assert!(matches!(done.result(), Some(Ok(()))));
    for log in &logs {
        let log = log.borrow();
        assert_eq!(log.error_code(), Some("ABORT_ERR"));
        assert!(!log.events.contains(&"connect".to_string()));
    }

    let (late, late_log) = Recorder::new();
    assert!(!client.dispatch(get("/"), late));
    assert_eq!(late_log.borrow().error_code(), Some("UND_ERR_DESTROYED"));
}

#[test]
fn destroy_is_idempotent() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();
    client.dispatch(get("/"), handler);

    let first = client.destroy(None);
    let second = client.destroy(Some(DispatchError::ClientClosed));
    assert!(first.is_complete());
    assert!(matches!(second.result(), Some(Ok(()))));
    assert_eq!(log.borrow().error_code(), Some("UND_ERR_DESTROYED"));
    assert!(net.last_wire().borrow().destroyed);
    assert_eq!(net.last_wire().borrow().writes, 1);
}

#[test]
fn close_waits_for_running_requests() {
    let net = Net::default();
    let (mut client, _clock) = client(&net, ClientConfig::default());
    let (handler, log) = Recorder::new();
    client.dispatch(get("/"), handler);

    let closed = client.close();
    let again = client.close();
    assert!(!closed.is_complete());
    assert!(client.is_closed());

    let (late, late_log) = Recorder::new();
    client.dispatch(get("/"), late);
    assert_eq!(late_log.borrow().error_code(), Some("UND_ERR_CLOSED"));

    respond(&mut client, &net, OK_HELLO);
    assert!(log.borrow().completed);
    assert!(matches!(closed.result(), Some(Ok(()))));
    assert!(matches!(again.result(), Some(Ok(()))));
    assert!(client.is_destroyed());
    assert!(net.last_wire().borrow().destroyed);

    let late_close = client.close();
    let err = late_close.result().and_then(Result::err);
    assert_eq!(err.map(|e| e.code()), Some("UND_ERR_DESTROYED"));
}

// -- Interceptors -----------------------------------------------------------------

struct AddHeader(&'static str);

impl Interceptor for AddHeader {
    fn wrap<'a>(&'a self, mut next: DispatchFn<'a>) -> DispatchFn<'a> {
        Box::new(move |opts: DispatchOptions, handler: Box<dyn DispatchHandler>| {
            next(opts.header(self.0, "1"), handler)
        })
    }
}

#[test]
fn last_interceptor_runs_first() {
    let net = Net::default();
    let (client, _clock) = client(&net, ClientConfig::default());
    let interceptors: Vec<Box<dyn Interceptor>> =
        vec![Box::new(AddHeader("x-inner")), Box::new(AddHeader("x-outer"))];
    let mut composed = client.compose(interceptors);
    let (handler, _log) = Recorder::new();

    composed.dispatch(get("/"), handler);
    let text = net.last_wire().borrow().text();
    let outer = text.find("x-outer: 1").unwrap();
    let inner = text.find("x-inner: 1").unwrap();
    assert!(outer < inner);

    composed.on_socket_data(net.last_id(), OK_HELLO);
    composed.drive();
    assert_eq!(composed.inner().stats().size, 0);
}
