//! End-to-end tests of the engine over a scripted transport.
//!
//! The transport double below records what the engine sends and lets the
//! test deliver events through the real [`TransportEvents`] handle, from the
//! test thread or from spawned ones — the same arbitrary-context delivery a
//! real transport does.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use micro_fetch::buffer::SegmentedBuffer;
use micro_fetch::protocol::{RequestError, State};
use micro_fetch::request::HttpRequest;
use micro_fetch::transport::{Transport, TransportEvents};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct Wire {
    host: String,
    port: u16,
    tls: bool,
    space: usize,
    sent: Vec<u8>,
    events: Option<TransportEvents>,
    closed: bool,
}

/// Transport double shared between the request (boxed clone) and the test.
#[derive(Clone, Default)]
struct ScriptedTransport(Arc<Mutex<Wire>>);

impl ScriptedTransport {
    fn with_space(space: usize) -> Self {
        let transport = Self::default();
        transport.0.lock().unwrap().space = space;
        transport
    }

    fn events(&self) -> TransportEvents {
        self.0.lock().unwrap().events.clone().expect("transport not connected")
    }

    fn sent_text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap().sent).into_owned()
    }

    fn replenish(&self, space: usize) {
        self.0.lock().unwrap().space = space;
    }

    fn closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, host: &str, port: u16, tls: bool, events: TransportEvents) -> bool {
        let mut wire = self.0.lock().unwrap();
        wire.host = host.to_string();
        wire.port = port;
        wire.tls = tls;
        wire.events = Some(events);
        true
    }

    fn space(&self) -> usize {
        self.0.lock().unwrap().space
    }

    fn add(&mut self, data: &[u8]) -> usize {
        let mut wire = self.0.lock().unwrap();
        let take = data.len().min(wire.space);
        wire.space -= take;
        wire.sent.extend_from_slice(&data[..take]);
        take
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed = true;
    }

    fn error_to_string(&self, code: i32) -> String {
        format!("scripted error {code}")
    }
}

fn scripted_request(space: usize) -> (HttpRequest, ScriptedTransport) {
    init_tracing();
    let transport = ScriptedTransport::with_space(space);
    let request = HttpRequest::with_transport(Box::new(transport.clone()));
    (request, transport)
}

/// Collects callback firings in order, for asserting dispatch behavior.
fn record_callbacks(request: &HttpRequest) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let entries = Arc::clone(&log);
    request.on_begin_response(move |_request, status| {
        entries.lock().unwrap().push(format!("begin {status}"));
    });
    let entries = Arc::clone(&log);
    request.on_received_data(move |_request| {
        entries.lock().unwrap().push("data".to_string());
    });
    let entries = Arc::clone(&log);
    request.on_completion(move |_request| {
        entries.lock().unwrap().push("complete".to_string());
    });
    let entries = Arc::clone(&log);
    request.on_error(move |_request, error| {
        entries.lock().unwrap().push(format!("error: {error}"));
    });

    log
}

#[test]
fn full_exchange_with_content_length() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/greeting").expect("send");
    let events = transport.events();
    {
        let wire = transport.0.lock().unwrap();
        assert_eq!(wire.host, "example.com");
        assert_eq!(wire.port, 80);
        assert!(!wire.tls);
    }

    events.connected();
    assert_eq!(transport.sent_text(), "GET /greeting HTTP/1.1\r\nHost: example.com\r\n\r\n");

    events.received(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 12\r\n\r\nHello ");
    assert!(!request.is_complete());
    events.received(b"World!");

    assert!(request.is_complete());
    assert_eq!(request.status(), 200);
    assert_eq!(request.content_type().as_deref(), Some("text/plain"));
    assert_eq!(request.content_length(), 12);
    assert_eq!(request.error(), None);
    assert_eq!(request.error_string(), None);

    let mut body = [0; 32];
    let n = request.read(&mut body);
    assert_eq!(&body[..n], b"Hello World!");

    assert_eq!(*log.lock().unwrap(), vec!["begin 200", "data", "data", "complete"]);
    assert!(transport.closed());
}

#[test]
fn chunked_exchange() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/stream").expect("send");
    let events = transport.events();
    events.connected();

    events.received(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    events.received(b"5\r\nHello\r\n");
    events.received(b"7\r\n World!\r\n");
    assert!(!request.is_complete());
    events.received(b"0\r\n\r\n");

    assert!(request.is_complete());
    assert_eq!(request.error(), None);

    let mut body = [0; 32];
    let n = request.read(&mut body);
    assert_eq!(&body[..n], b"Hello World!");

    assert_eq!(
        *log.lock().unwrap(),
        vec!["begin 200", "data", "data", "complete"]
    );
}

#[test]
fn close_delimited_body_completes_on_disconnect() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/old-school").expect("send");
    let events = transport.events();
    events.connected();

    events.received(b"HTTP/1.1 200 OK\r\n\r\n");
    events.received(b"however much ");
    events.received(b"the server felt like");
    events.disconnected();

    assert!(request.is_complete());
    assert_eq!(request.error(), None);
    assert_eq!(request.content_length(), 33);

    let mut body = [0; 64];
    let n = request.read(&mut body);
    assert_eq!(&body[..n], b"however much the server felt like");
    assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("complete"));
}

#[test]
fn disconnect_during_headers_is_connection_closed() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-");
    events.disconnected();

    assert!(request.is_complete());
    assert!(matches!(request.error(), Some(RequestError::ConnectionClosed { .. })));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].starts_with("error: server closed connection"));
}

#[test]
fn second_send_is_rejected_without_disturbing_the_first() {
    let (request, transport) = scripted_request(4096);
    request.get("http://example.com/").expect("send");

    let result = request.get("http://example.com/other");
    assert_eq!(result, Err(RequestError::InUse));

    // the in-flight request is untouched and still works
    assert_eq!(request.state(), State::Connecting);
    assert_eq!(request.error(), None);

    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
    assert!(request.is_complete());
    assert_eq!(request.status(), 204);
}

#[test]
fn unsupported_scheme_reports_through_both_channels() {
    let (request, _transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    let result = request.get("ftp://example.com/file");
    assert_eq!(result, Err(RequestError::unsupported_scheme("ftp")));
    assert!(request.is_complete());
    assert_eq!(request.error_string().as_deref(), Some("unsupported URL scheme: ftp"));
    assert_eq!(*log.lock().unwrap(), vec!["error: unsupported URL scheme: ftp"]);
}

#[test]
fn post_body_is_sent_under_backpressure() {
    let (request, transport) = scripted_request(10);

    let body = SegmentedBuffer::from("field=value&other=1");
    request.post("http://example.com/form", "application/x-www-form-urlencoded", body).expect("send");

    let events = transport.events();
    events.connected();

    // replenish the window in small steps, as acknowledgements would
    for _ in 0..64 {
        transport.replenish(10);
        events.acknowledged(10, 0);
    }

    let sent = transport.sent_text();
    assert!(sent.starts_with("POST /form HTTP/1.1\r\nHost: example.com\r\n"));
    assert!(sent.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(sent.contains("Content-Length: 19\r\n"));
    assert!(sent.ends_with("\r\n\r\nfield=value&other=1"));

    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    assert!(request.is_complete());
    assert_eq!(request.status(), 200);
}

#[test]
fn blocking_reader_waits_until_data_arrives() {
    let (request, transport) = scripted_request(4096);

    request.get("http://example.com/slow").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n");

    let mut reader = request.reader().expect("first reader");
    // the reader handle is handed out exactly once
    assert!(request.reader().is_none());

    let (result_sender, result_receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = [0; 12];
        let n = reader.read_bytes(&mut buffer);
        result_sender.send((n, buffer.to_vec())).expect("send result");
    });

    // nothing buffered yet, the reader must be blocked
    assert!(result_receiver.recv_timeout(Duration::from_millis(100)).is_err());

    events.received(b"Hello ");
    // still short of the 12 requested bytes
    assert!(result_receiver.recv_timeout(Duration::from_millis(100)).is_err());

    events.received(b"World!");
    let (n, data) = result_receiver.recv_timeout(Duration::from_secs(5)).expect("reader finished");
    assert_eq!(n, 12);
    assert_eq!(data, b"Hello World!");
}

#[test]
fn blocking_reader_returns_short_at_end_of_stream() {
    let (request, transport) = scripted_request(4096);

    request.get("http://example.com/short").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    assert!(request.is_complete());

    let mut reader = request.reader().expect("reader");
    let mut buffer = [0; 32];
    assert_eq!(reader.read_bytes(&mut buffer), 5);
    assert_eq!(&buffer[..5], b"hello");

    // drained and terminal: every further read is empty
    assert_eq!(reader.read_bytes(&mut buffer), 0);
    assert_eq!(reader.read_byte(), None);
}

#[test]
fn blocking_reader_wakes_on_failure() {
    let (request, transport) = scripted_request(4096);

    request.get("http://example.com/dies").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc");

    let mut reader = request.reader().expect("reader");
    let (result_sender, result_receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = [0; 10];
        let n = reader.read_bytes(&mut buffer);
        result_sender.send((n, buffer.to_vec())).expect("send result");
    });

    assert!(result_receiver.recv_timeout(Duration::from_millis(100)).is_err());

    // content-length promised more, so this disconnect is a failure; the
    // reader must still wake up and hand back what arrived
    events.disconnected();
    let (n, data) = result_receiver.recv_timeout(Duration::from_secs(5)).expect("reader woke");
    assert_eq!(n, 3);
    assert_eq!(&data[..n], b"abc");
    assert!(matches!(request.error(), Some(RequestError::ConnectionClosed { .. })));
}

#[test]
fn error_suppresses_pending_data_notification() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/poisoned").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");

    // one event both appends decoded bytes and hits a bad chunk-size byte;
    // the error must win and the data notification must never fire
    events.received(b"5\r\nHello\r\nBAD");

    assert!(request.is_complete());
    assert!(matches!(request.error(), Some(RequestError::Protocol { .. })));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], "begin 200");
    assert!(log[1].starts_with("error: malformed response"));
}

#[test]
fn abort_settles_the_request_and_releases_the_transport() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    request.get("http://example.com/abandoned").expect("send");
    let events = transport.events();
    events.connected();

    request.abort();
    assert!(request.is_complete());
    assert_eq!(request.error(), Some(RequestError::Aborted));
    assert!(transport.closed());
    assert_eq!(*log.lock().unwrap(), vec!["error: request aborted"]);

    // aborting again or delivering late events changes nothing
    request.abort();
    events.received(b"HTTP/1.1 200 OK\r\n\r\n");
    assert_eq!(request.status(), 0);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn callbacks_observe_the_request_through_the_handle() {
    let (request, transport) = scripted_request(4096);

    let seen = Arc::new(Mutex::new((0u16, 0u64)));
    let seen_in_callback = Arc::clone(&seen);
    request.on_completion(move |request| {
        // accessors must be callable from inside a callback
        *seen_in_callback.lock().unwrap() = (request.status(), request.content_length());
    });

    request.get("http://example.com/introspect").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\ndone");

    assert_eq!(*seen.lock().unwrap(), (201, 4));
}

#[test]
fn abort_from_within_a_callback_is_dispatched_in_order() {
    let (request, transport) = scripted_request(4096);
    let log = record_callbacks(&request);

    // the data handler calls back into the request; the resulting error
    // notification must fire after this handler returns, not deadlock
    let registered = Arc::clone(&log);
    request.on_received_data(move |request| {
        registered.lock().unwrap().push("data".to_string());
        request.abort();
    });

    request.get("http://example.com/self-abort").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\npartial");

    assert_eq!(request.error(), Some(RequestError::Aborted));
    assert_eq!(*log.lock().unwrap(), vec!["begin 200", "data", "error: request aborted"]);
}

#[test]
fn events_from_multiple_threads_are_serialized() {
    let (request, transport) = scripted_request(4096);

    request.get("http://example.com/concurrent").expect("send");
    let events = transport.events();
    events.connected();
    events.received(b"HTTP/1.1 200 OK\r\nContent-Length: 4000\r\n\r\n");

    let mut workers = Vec::new();
    for _ in 0..4 {
        let events = events.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                events.received(&[b'x'; 100]);
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }

    assert!(request.is_complete());
    assert_eq!(request.error(), None);

    let mut total = 0;
    let mut chunk = [0; 512];
    loop {
        let n = request.read(&mut chunk);
        if n == 0 {
            break;
        }
        assert!(chunk[..n].iter().all(|&b| b == b'x'));
        total += n;
    }
    assert_eq!(total, 4000);
}
