//! The public request object.
//!
//! [`HttpRequest`] drives one HTTP/1.1 exchange over a callback-driven
//! transport. It is a cheap-to-clone handle: every clone refers to the same
//! underlying request, which is how the same object can be sent from one
//! thread, read from another, and observed from its callbacks.
//!
//! # Lifecycle
//!
//! A request is single-use. [`send`](HttpRequest::send) arms it exactly
//! once; when the exchange settles — success or failure — the request stays
//! immutable and a fresh one is needed to retry. The first error recorded
//! is the one reported, always.
//!
//! # Consuming the response
//!
//! Three non-exclusive ways:
//!
//! - register callbacks ([`on_begin_response`](HttpRequest::on_begin_response),
//!   [`on_received_data`](HttpRequest::on_received_data),
//!   [`on_completion`](HttpRequest::on_completion),
//!   [`on_error`](HttpRequest::on_error)) — fired outside any internal
//!   lock, never concurrently with each other, on an unspecified context;
//! - poll with the non-blocking [`read`](HttpRequest::read);
//! - take the single blocking [`reader`](HttpRequest::reader) on a
//!   dedicated thread.
//!
//! Callbacks receive a request handle; by the time one runs, the request
//! may already have advanced further, so the handle — not the event that
//! scheduled the callback — is the source of truth.

use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::buffer::SegmentedBuffer;
use crate::protocol::{RequestError, State};
use crate::transport::{TcpTransport, Transport, TransportEvents};

pub(crate) mod bridge;
pub(crate) mod machine;

pub use bridge::BodyReader;
use bridge::Shared;
use machine::Machine;

/// A single asynchronous HTTP/1.1 request.
///
/// See the [module documentation](self) for the lifecycle and the ways to
/// consume the response.
pub struct HttpRequest {
    shared: Arc<Shared>,
}

impl HttpRequest {
    /// A request over the bundled tokio TCP transport. The connect step
    /// needs a tokio runtime reachable from the calling context.
    pub fn new() -> Self {
        Self::with_transport(Box::new(TcpTransport::new()))
    }

    /// A request over a caller-supplied transport.
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self { shared: Arc::new(Shared::new(Machine::new(transport))) }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Serializes and sends the request, returning as soon as the
    /// asynchronous connect is underway.
    ///
    /// `content_type` is only emitted when a `body` is present;
    /// `Content-Length` is always emitted for a body. Fails with
    /// [`RequestError::InUse`] when called on anything but a fresh request
    /// (leaving the in-flight exchange untouched), with
    /// [`RequestError::UnsupportedScheme`] for non-http(s) URLs, and with
    /// [`RequestError::CannotConnect`] when the transport rejects the
    /// connection attempt outright.
    pub fn send(
        &self,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<SegmentedBuffer>,
    ) -> Result<(), RequestError> {
        let events = TransportEvents::new(Arc::downgrade(&self.shared));
        self.shared.enter(|machine| machine.send(&method, url, content_type, body, events))
    }

    /// Convenience `GET` without a body.
    pub fn get(&self, url: &str) -> Result<(), RequestError> {
        self.send(Method::GET, url, None, None)
    }

    /// Convenience `POST` with a body.
    pub fn post(&self, url: &str, content_type: &str, body: SegmentedBuffer) -> Result<(), RequestError> {
        self.send(Method::POST, url, Some(content_type), Some(body))
    }

    /// Cancels an in-flight request: it settles with
    /// [`RequestError::Aborted`], the error callback fires once, and the
    /// transport is torn down. Aborting a settled request does nothing.
    pub fn abort(&self) {
        self.shared.enter(|machine| machine.abort());
    }

    /// Registers the callback fired once the response headers are complete,
    /// with the parsed status code.
    pub fn on_begin_response<F>(&self, handler: F)
    where
        F: FnMut(&HttpRequest, u16) + Send + 'static,
    {
        self.shared.lock_callbacks().begin_response = Some(Box::new(handler));
    }

    /// Registers the callback fired when new body data is available.
    pub fn on_received_data<F>(&self, handler: F)
    where
        F: FnMut(&HttpRequest) + Send + 'static,
    {
        self.shared.lock_callbacks().received_data = Some(Box::new(handler));
    }

    /// Registers the callback fired exactly once on successful completion.
    pub fn on_completion<F>(&self, handler: F)
    where
        F: FnMut(&HttpRequest) + Send + 'static,
    {
        self.shared.lock_callbacks().completion = Some(Box::new(handler));
    }

    /// Registers the callback fired exactly once on failure. An error
    /// suppresses any data or completion notification still pending.
    pub fn on_error<F>(&self, handler: F)
    where
        F: FnMut(&HttpRequest, &RequestError) + Send + 'static,
    {
        self.shared.lock_callbacks().error = Some(Box::new(handler));
    }

    /// The request has settled, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.shared.lock_inner().state().is_terminal()
    }

    /// Current lifecycle state, for diagnostics.
    pub fn state(&self) -> State {
        self.shared.lock_inner().state()
    }

    /// Parsed HTTP status code; 0 until the status line has been parsed.
    pub fn status(&self) -> u16 {
        self.shared.lock_inner().status()
    }

    /// The response `Content-Type`, verbatim, once seen.
    pub fn content_type(&self) -> Option<String> {
        self.shared.lock_inner().content_type().map(ToString::to_string)
    }

    /// The announced `Content-Length` if one was seen; for close-delimited
    /// bodies, the byte count actually received once complete; 0 otherwise.
    pub fn content_length(&self) -> u64 {
        self.shared.lock_inner().content_length()
    }

    /// The terminal error, if the request failed.
    pub fn error(&self) -> Option<RequestError> {
        self.shared.lock_inner().error().cloned()
    }

    /// Human-readable form of [`error`](HttpRequest::error).
    pub fn error_string(&self) -> Option<String> {
        self.error().map(|error| error.to_string())
    }

    /// Non-blocking read: drains whatever body bytes are buffered right
    /// now, which may be none.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        self.shared.lock_inner().read_body(dest)
    }

    /// Hands out the blocking body reader.
    ///
    /// There is exactly one per request: the first call returns it, every
    /// later call returns `None`. This is what keeps the single-waiter
    /// wake-up handoff sound — see [`BodyReader`].
    pub fn reader(&self) -> Option<BodyReader> {
        let mut machine = self.shared.lock_inner();
        if machine.reader_taken {
            return None;
        }
        machine.reader_taken = true;
        drop(machine);
        Some(BodyReader::new(Arc::clone(&self.shared)))
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Another handle to the same request, not a new request.
impl Clone for HttpRequest {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.shared.lock_inner();
        f.debug_struct("HttpRequest")
            .field("state", &machine.state())
            .field("status", &machine.status())
            .finish_non_exhaustive()
    }
}
