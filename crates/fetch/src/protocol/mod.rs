//! Protocol-level types shared across the client.
//!
//! This module holds the vocabulary the engine speaks:
//!
//! - **Errors** ([`error`]): [`RequestError`], the single terminal error type
//!   a request can settle into. First error wins — the earliest failure is
//!   the one reported.
//! - **URLs** ([`url`]): [`UrlParts`], the minimal scheme/host/port/path
//!   decomposition performed once per request.
//! - **States** ([`state`]): [`State`], the request lifecycle tag driven by
//!   the transport's events.
//!
//! The wire format itself (request line, headers, chunked framing) is plain
//! HTTP/1.1 and is produced and consumed by the request state machine; no
//! additional message types are needed on the client side.

mod error;
pub use error::RequestError;

mod state;
pub use state::State;

mod url;
pub use url::UrlParts;
