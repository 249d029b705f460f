//! The transport seam between the engine and a socket implementation.
//!
//! The engine never touches a socket. It programs against [`Transport`], a
//! callback-driven, non-blocking contract: `connect` returns immediately,
//! outgoing bytes are pushed through a bounded send window (`space`/`add`),
//! and everything the connection produces — connected, acknowledged, data,
//! disconnect, error, timeout — arrives later through a [`TransportEvents`]
//! handle, on whatever execution context the transport owns.
//!
//! Ownership is one-directional: the request owns its transport and drops it
//! on terminal transition; the transport only holds the weak events handle.
//! Events delivered after the request is gone land in a no-op, so a transport
//! task that outlives its request cannot touch freed state.
//!
//! [`tcp::TcpTransport`] is the bundled reference implementation on tokio.

use std::sync::Weak;

use crate::request::bridge::Shared;

pub mod tcp;
pub use tcp::TcpTransport;

/// A callback-driven, non-blocking byte-stream transport.
///
/// Implementations deliver their events through the [`TransportEvents`]
/// handle passed to [`connect`](Transport::connect), from any context they
/// like; the engine serializes internally. All methods here are invoked by
/// the engine with its request lock held, so they must not block and must
/// not call back into the events handle reentrantly.
pub trait Transport: Send {
    /// Starts an asynchronous connection attempt, returning `false` on
    /// immediate failure (no events will follow) and `true` when the attempt
    /// is underway (outcome reported through `events`).
    fn connect(&mut self, host: &str, port: u16, tls: bool, events: TransportEvents) -> bool;

    /// Currently available send-window size in bytes.
    fn space(&self) -> usize;

    /// Best-effort non-blocking enqueue for sending. Returns the number of
    /// bytes accepted; fewer than `data.len()` signals backpressure.
    fn add(&mut self, data: &[u8]) -> usize;

    /// Terminates the connection. Idempotent.
    fn close(&mut self);

    /// Human-readable text for a transport error code.
    fn error_to_string(&self, code: i32) -> String;
}

/// The engine-side sink a transport delivers its events into.
///
/// Cheap to clone; holds only a weak reference to the request internals.
/// Every method is non-blocking from the transport's perspective in the
/// sense that it never waits on the consumer — it takes the request lock,
/// advances the state machine, and dispatches any resulting notifications.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    shared: Weak<Shared>,
}

impl TransportEvents {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// The connection attempt succeeded; the engine starts sending.
    pub fn connected(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_connected());
        }
    }

    /// `len` previously added bytes were acknowledged; send-window space is
    /// available again. `time_ms` is the transport's own timing measurement
    /// and is currently unused by the engine.
    pub fn acknowledged(&self, len: usize, time_ms: u32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_acknowledged(len, time_ms));
        }
    }

    /// Bytes arrived from the server.
    pub fn received(&self, data: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_data(data));
        }
    }

    /// The connection closed. Depending on the request phase this is either
    /// the normal end of a close-delimited body or a premature close.
    pub fn disconnected(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_disconnected());
        }
    }

    /// The transport failed with an implementation-defined error code.
    pub fn failed(&self, code: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_failed(code));
        }
    }

    /// The transport timed out with an implementation-defined code.
    pub fn timed_out(&self, code: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enter(|machine| machine.on_timed_out(code));
        }
    }
}
