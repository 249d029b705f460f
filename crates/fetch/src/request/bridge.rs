//! The concurrency bridge between transport context, callbacks and readers.
//!
//! [`Shared`] is the one object every execution context meets at: the
//! transport delivers events through it, the consumer's blocking reads park
//! on it, and user callbacks are dispatched from it. Three rules keep this
//! safe:
//!
//! 1. **One lock for all state.** Every transport event and every consumer
//!    read acquires the machine lock before touching any field, for the
//!    shortest span needed to mutate state.
//! 2. **Two-phase notification.** Side effects are computed under the lock
//!    (as [`Notifications`](super::machine::Notifications) flags) and fired
//!    after it is released, so a
//!    callback can call back into the request without deadlocking. A
//!    dispatch gate serializes the callbacks of one request; they never run
//!    concurrently with each other.
//! 3. **Single parked reader.** The blocking reader waits on a condition
//!    variable and is woken by the data-arrival path or by the terminal
//!    transition. Only one [`BodyReader`] is ever handed out, so at most
//!    one waiter can exist.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::trace;

use crate::protocol::RequestError;
use crate::request::HttpRequest;
use crate::request::machine::Machine;
use crate::transport::Transport;

type BeginResponseHandler = Box<dyn FnMut(&HttpRequest, u16) + Send>;
type DataHandler = Box<dyn FnMut(&HttpRequest) + Send>;
type CompletionHandler = Box<dyn FnMut(&HttpRequest) + Send>;
type ErrorHandler = Box<dyn FnMut(&HttpRequest, &RequestError) + Send>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) begin_response: Option<BeginResponseHandler>,
    pub(crate) received_data: Option<DataHandler>,
    pub(crate) completion: Option<CompletionHandler>,
    pub(crate) error: Option<ErrorHandler>,
}

/// Request internals shared by the public handle, the transport events and
/// the blocking reader.
pub(crate) struct Shared {
    inner: Mutex<Machine>,
    data_ready: Condvar,
    callbacks: Mutex<Callbacks>,
    /// Held while user callbacks run; never held together with `inner`.
    dispatch_gate: Mutex<()>,
}

impl Shared {
    pub(crate) fn new(machine: Machine) -> Self {
        Self {
            inner: Mutex::new(machine),
            data_ready: Condvar::new(),
            callbacks: Mutex::new(Callbacks::default()),
            dispatch_gate: Mutex::new(()),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Machine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the machine under the lock, wakes a parked reader if the
    /// mutation produced body data or a terminal transition, then dispatches
    /// pending notifications with the lock released.
    pub(crate) fn enter<R>(self: &Arc<Self>, f: impl FnOnce(&mut Machine) -> R) -> R {
        let result = {
            let mut machine = self.lock_inner();
            let result = f(&mut machine);
            self.wake_reader(&mut machine);
            result
        };
        self.dispatch();
        result
    }

    /// Single-registration, single-wake handoff: a parked reader is woken
    /// and deregistered exactly when new body data or a terminal state is
    /// there for it to observe.
    fn wake_reader(&self, machine: &mut Machine) {
        if machine.reader_waiting && (machine.notify.data || machine.state().is_terminal()) {
            trace!("waking parked reader");
            machine.reader_waiting = false;
            self.data_ready.notify_one();
        }
    }

    /// Delivers pending notifications to the user's callbacks.
    ///
    /// Whoever wins the dispatch gate drains flags until none remain; a
    /// loser returns immediately, relying on the winner's re-check. The
    /// gate is re-checked once more after release to close the window where
    /// flags are raised between the winner's last drain and its release.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        loop {
            {
                let _gate = match self.dispatch_gate.try_lock() {
                    Ok(gate) => gate,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    // an active dispatcher will pick the new flags up
                    Err(TryLockError::WouldBlock) => return,
                };
                self.run_dispatch();
            }
            if !self.lock_inner().has_notifications() {
                return;
            }
        }
    }

    fn run_dispatch(self: &Arc<Self>) {
        loop {
            let (flags, status, error) = {
                let mut machine = self.lock_inner();
                (machine.take_notifications(), machine.status(), machine.error().cloned())
            };
            if flags.is_clear() {
                return;
            }

            let request = HttpRequest::from_shared(Arc::clone(self));

            if flags.error {
                trace!("posting error notification");
                if let Some(error) = error {
                    self.fire_error(&request, &error);
                }
                // an error suppresses the data/completion flags taken with
                // it and forces transport teardown
                self.release_transport();
                continue;
            }

            if flags.begin {
                trace!(status, "posting begin-response notification");
                self.fire_begin_response(&request, status);
            }
            if flags.data {
                trace!("posting data notification");
                self.fire_received_data(&request);
            }
            if flags.complete {
                trace!("posting completion notification");
                self.fire_completion(&request);
                self.release_transport();
            }
        }
    }

    // Handlers are taken out of the table for the duration of the call so
    // the table lock is never held while user code runs; a handler the user
    // re-registered mid-call wins over the one being restored.

    fn fire_begin_response(&self, request: &HttpRequest, status: u16) {
        let taken = self.lock_callbacks().begin_response.take();
        if let Some(mut handler) = taken {
            handler(request, status);
            let mut callbacks = self.lock_callbacks();
            if callbacks.begin_response.is_none() {
                callbacks.begin_response = Some(handler);
            }
        }
    }

    fn fire_received_data(&self, request: &HttpRequest) {
        let taken = self.lock_callbacks().received_data.take();
        if let Some(mut handler) = taken {
            handler(request);
            let mut callbacks = self.lock_callbacks();
            if callbacks.received_data.is_none() {
                callbacks.received_data = Some(handler);
            }
        }
    }

    fn fire_completion(&self, request: &HttpRequest) {
        let taken = self.lock_callbacks().completion.take();
        if let Some(mut handler) = taken {
            handler(request);
            let mut callbacks = self.lock_callbacks();
            if callbacks.completion.is_none() {
                callbacks.completion = Some(handler);
            }
        }
    }

    fn fire_error(&self, request: &HttpRequest, error: &RequestError) {
        let taken = self.lock_callbacks().error.take();
        if let Some(mut handler) = taken {
            handler(request, error);
            let mut callbacks = self.lock_callbacks();
            if callbacks.error.is_none() {
                callbacks.error = Some(handler);
            }
        }
    }

    /// Closes and drops the transport once the request is settled. Later
    /// transport events find a terminal machine and are ignored.
    fn release_transport(&self) {
        let transport: Option<Box<dyn Transport>> = self.lock_inner().take_transport();
        if let Some(mut transport) = transport {
            trace!("releasing transport");
            transport.close();
        }
    }
}

/// Blocking, pull-style reader for the response body.
///
/// At most one of these exists per request (see
/// [`HttpRequest::reader`]); it cannot be cloned, and reading takes
/// `&mut self`, so at most one thread can ever be parked waiting for data.
pub struct BodyReader {
    shared: Arc<Shared>,
}

impl BodyReader {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Blocking read of a single byte; `None` at end of stream. Whether the
    /// end was clean is answered by [`HttpRequest::error`].
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0];
        (self.read_bytes(&mut byte) == 1).then_some(byte[0])
    }

    /// Fills `dest`, blocking until enough body data has arrived or the
    /// stream is terminal. A short count is returned only at end of stream;
    /// it is not an error by itself.
    pub fn read_bytes(&mut self, dest: &mut [u8]) -> usize {
        let mut filled = 0;
        let mut machine = self.shared.lock_inner();
        loop {
            filled += machine.read_body(&mut dest[filled..]);
            if filled == dest.len() || machine.state().is_terminal() {
                return filled;
            }

            trace!(filled, requested = dest.len(), "reader waiting for more data");
            machine.reader_waiting = true;
            machine = self.shared.data_ready.wait(machine).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader").finish_non_exhaustive()
    }
}
