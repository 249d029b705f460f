//! tokio-backed reference implementation of the [`Transport`] contract.
//!
//! [`TcpTransport::connect`] spawns a driver task on a tokio runtime and
//! returns immediately; everything after that — the connect outcome, every
//! received byte, the eventual disconnect — reaches the engine as events
//! from that task's context.
//!
//! Sending models a fixed window. [`add`](Transport::add) copies bytes into
//! a queue and shrinks [`space`](Transport::space); the driver writes queued
//! chunks to the socket and reports each finished write through the
//! acknowledged event, which is also when the window grows back. The engine
//! reacts to the acknowledgement by pumping more of its buffers, so
//! backpressure falls out of the window arithmetic.
//!
//! TLS is not implemented; a TLS connect fails synchronously.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::{Transport, TransportEvents};

/// Bytes the transport will queue before reporting a full send window.
const SEND_WINDOW: usize = 16 * 1024;

/// Capacity of the driver's read buffer per receive.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// [`Transport`] over a tokio [`TcpStream`].
///
/// Constructed with an explicit runtime handle, or without one, in which
/// case the runtime ambient at connect time is used.
pub struct TcpTransport {
    handle: Option<Handle>,
    link: Option<Arc<Link>>,
}

impl TcpTransport {
    /// Uses the runtime ambient at connect time.
    pub fn new() -> Self {
        Self { handle: None, link: None }
    }

    /// Spawns the driver on `handle` regardless of the calling context.
    pub fn with_handle(handle: Handle) -> Self {
        Self { handle: Some(handle), link: None }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16, tls: bool, events: TransportEvents) -> bool {
        if tls {
            warn!("tls connection requested, not supported by TcpTransport");
            return false;
        }
        let Some(handle) = self.handle.clone().or_else(|| Handle::try_current().ok()) else {
            warn!("no tokio runtime reachable, cannot connect");
            return false;
        };

        let link = Arc::new(Link::new());
        self.link = Some(Arc::clone(&link));

        let host = host.to_string();
        handle.spawn(drive(link, host, port, events));
        true
    }

    fn space(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.space())
    }

    fn add(&mut self, data: &[u8]) -> usize {
        self.link.as_ref().map_or(0, |link| link.push(data))
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            trace!("closing tcp transport");
            link.close();
        }
    }

    fn error_to_string(&self, code: i32) -> String {
        if code > 0 { io::Error::from_raw_os_error(code).to_string() } else { format!("transport error {code}") }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        Transport::close(self);
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport").field("connected", &self.link.is_some()).finish_non_exhaustive()
    }
}

/// State shared between the engine-facing methods and the driver task.
struct Link {
    window: Mutex<Window>,
    /// Wakes the driver's write half when bytes are queued or on close.
    queued: Notify,
    /// Ends the driver task on a locally initiated close.
    shutdown: Notify,
}

struct Window {
    queue: VecDeque<Bytes>,
    /// Queued-but-unacknowledged byte count; what `space` subtracts.
    in_flight: usize,
    closed: bool,
}

impl Link {
    fn new() -> Self {
        Self {
            window: Mutex::new(Window { queue: VecDeque::new(), in_flight: 0, closed: false }),
            queued: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn space(&self) -> usize {
        SEND_WINDOW.saturating_sub(self.lock().in_flight)
    }

    fn push(&self, data: &[u8]) -> usize {
        let take = {
            let mut window = self.lock();
            if window.closed {
                return 0;
            }
            let take = data.len().min(SEND_WINDOW.saturating_sub(window.in_flight));
            if take == 0 {
                return 0;
            }
            window.queue.push_back(Bytes::copy_from_slice(&data[..take]));
            window.in_flight += take;
            take
        };
        self.queued.notify_one();
        take
    }

    fn pop(&self) -> Option<Bytes> {
        self.lock().queue.pop_front()
    }

    fn acknowledge(&self, len: usize) {
        let mut window = self.lock();
        window.in_flight = window.in_flight.saturating_sub(len);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        self.lock().closed = true;
        self.shutdown.notify_one();
        self.queued.notify_one();
    }
}

fn error_code(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(-1)
}

/// The driver task: connects, then moves bytes in both directions until the
/// peer closes, an error occurs, or the engine closes the transport.
async fn drive(link: Arc<Link>, host: String, port: u16, events: TransportEvents) {
    let stream = tokio::select! {
        result = TcpStream::connect((host.as_str(), port)) => match result {
            Ok(stream) => stream,
            Err(error) => {
                debug!(%host, port, %error, "connect failed");
                events.failed(error_code(&error));
                return;
            }
        },
        _ = link.shutdown.notified() => return,
    };

    trace!(%host, port, "connected");
    let started = Instant::now();
    events.connected();

    let (mut read_half, mut write_half) = stream.into_split();

    let receive = async {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            buffer.clear();
            match read_half.read_buf(&mut buffer).await {
                Ok(0) => {
                    trace!("peer closed the connection");
                    events.disconnected();
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, "received");
                    events.received(&buffer);
                }
                Err(error) => {
                    debug!(%error, "receive failed");
                    events.failed(error_code(&error));
                    return;
                }
            }
        }
    };

    let transmit = async {
        loop {
            let chunk = loop {
                if let Some(chunk) = link.pop() {
                    break chunk;
                }
                if link.is_closed() {
                    return;
                }
                link.queued.notified().await;
            };

            if let Err(error) = write_half.write_all(&chunk).await {
                debug!(%error, "transmit failed");
                events.failed(error_code(&error));
                return;
            }
            link.acknowledge(chunk.len());
            let elapsed = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
            events.acknowledged(chunk.len(), elapsed);
        }
    };

    tokio::select! {
        () = receive => {}
        () = transmit => {}
        _ = link.shutdown.notified() => trace!("transport closed locally"),
    }
}
