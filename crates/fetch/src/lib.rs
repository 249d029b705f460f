//! An asynchronous micro HTTP client engine
//!
//! This crate provides a lightweight, efficient HTTP/1.1 client engine that
//! turns a raw, callback-driven byte stream — connect, send, receive and
//! close events from a TCP transport — into a structured request/response
//! exchange, while also exposing a pull-style blocking read interface to a
//! consumer thread.
//!
//! # Features
//!
//! - Full HTTP/1.1 request/response framing
//! - Incremental parsing from arbitrarily fragmented input
//! - Chunked transfer decoding and close-delimited bodies
//! - Send-window aware request transmission with backpressure
//! - Callback and blocking-reader consumption, safely concurrent
//! - Pluggable transports, with a tokio TCP implementation included
//! - Clean error handling: the first error wins and is final
//!
//!
//! # Example
//!
//! ```no_run
//! use micro_fetch::request::HttpRequest;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize logging
//!     let subscriber = tracing_subscriber::FmtSubscriber::builder()
//!         .with_max_level(tracing::Level::INFO)
//!         .finish();
//!     tracing::subscriber::set_global_default(subscriber)
//!         .expect("setting default subscriber failed");
//!
//!     let request = HttpRequest::new();
//!
//!     request.on_begin_response(|_request, status| {
//!         tracing::info!(status, "response started");
//!     });
//!     request.on_completion(|request| {
//!         tracing::info!(bytes = request.content_length(), "response finished");
//!     });
//!     request.on_error(|_request, error| {
//!         tracing::error!(%error, "request failed");
//!     });
//!
//!     request.get("http://example.com/").expect("send request");
//!
//!     // the blocking reader lives on its own thread
//!     let mut reader = request.reader().expect("first reader");
//!     let body = tokio::task::spawn_blocking(move || {
//!         let mut collected = Vec::new();
//!         let mut chunk = [0u8; 256];
//!         loop {
//!             let n = reader.read_bytes(&mut chunk);
//!             if n == 0 {
//!                 break;
//!             }
//!             collected.extend_from_slice(&chunk[..n]);
//!         }
//!         collected
//!     })
//!     .await
//!     .expect("reader thread");
//!
//!     println!("{}", String::from_utf8_lossy(&body));
//! }
//! ```
//!
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`buffer`]: the segmented byte queue both directions are buffered in
//! - [`protocol`]: protocol vocabulary — errors, URL parts, request states
//! - [`request`]: the request object, its state machine and the
//!   concurrency bridge
//! - [`transport`]: the transport contract and the tokio TCP
//!   implementation
//!
//!
//! # Core Components
//!
//! ## Request lifecycle
//!
//! [`request::HttpRequest`] is the entry point. `send` serializes the
//! request and starts an asynchronous connect; from then on the transport's
//! events drive a state machine through sending, status line, headers and
//! body until the exchange settles. A settled request is immutable — each
//! request object is used exactly once.
//!
//! ## Buffering
//!
//! [`buffer::SegmentedBuffer`] stores bytes in fixed-size fragments, so
//! growth never reallocates or copies what was already written, and
//! fragments are freed as soon as they are consumed. Status and header
//! lines are extracted incrementally from it as they complete.
//!
//! ## Concurrency
//!
//! Transport events arrive on a context the engine does not control, while
//! a consumer may block for body data on its own thread. One lock per
//! request serializes all state mutation; user callbacks are dispatched
//! strictly after the lock is released, and a condition-variable handoff
//! wakes the single blocking reader when data or completion arrives.
//!
//! ## Error Handling
//!
//! Failures surface as [`protocol::RequestError`] through the error
//! callback and the `error()` accessor. The first error recorded is final:
//! later failures never overwrite it. Malformed response framing fails the
//! request rather than being silently tolerated.
//!
//! # Limitations
//!
//! - HTTP/1.1 only, one request per connection (no keep-alive reuse)
//! - No TLS support in the bundled transport
//! - No redirects, cookies or content decompression
//! - Maximum status/header line length: 512 bytes

pub mod buffer;
pub mod protocol;
pub mod request;
pub mod transport;

mod utils;
pub(crate) use utils::ensure;
