//! The request state machine.
//!
//! [`Machine`] owns everything one request mutates: the serialized request
//! head, the optional request body, the incoming response bytes, the decoded
//! body, and the lifecycle [`State`]. Transport events drive it forward;
//! every method here runs with the request lock held (see
//! [`bridge`](super::bridge)), so the code can mutate freely without further
//! synchronization. User-visible side effects never happen here directly —
//! they are recorded in [`Notifications`] and fired by the dispatcher after
//! the lock is released.
//!
//! Incoming framing is parsed incrementally: the status line and header
//! lines are extracted from the response buffer as soon as a terminator is
//! buffered, and body bytes flow through either the content-length
//! accounting or the chunked decoder. Malformed framing — a status line
//! without a status, a header without a colon, a stray byte or an overflow
//! in a chunk-size line, an over-long line — fails the request with a
//! protocol error rather than being skipped.

use std::fmt::Write as _;

use http::Method;
use tracing::{debug, trace};

use crate::buffer::{FRAGMENT_SIZE, SegmentedBuffer};
use crate::ensure;
use crate::protocol::{RequestError, State, UrlParts};
use crate::transport::{Transport, TransportEvents};

/// Longest acceptable status or header line, terminator excluded.
const MAX_LINE_LENGTH: usize = 512;

/// Callbacks owed to the user once the current lock is released.
///
/// Set during state transitions, taken and cleared by the dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Notifications {
    /// Headers are complete; deliver the status code.
    pub(crate) begin: bool,
    /// New body bytes are buffered.
    pub(crate) data: bool,
    /// The request finished successfully.
    pub(crate) complete: bool,
    /// The request failed; the recorded error is final.
    pub(crate) error: bool,
}

impl Notifications {
    pub(crate) fn is_clear(self) -> bool {
        !(self.begin || self.data || self.complete || self.error)
    }
}

/// Sub-state of the chunked-transfer decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    /// Scanning a chunk-size line: decimal digits, `\r` tolerated, `\n`
    /// terminates. Line breaks before the first digit belong to the
    /// previous chunk's trailing break and are skipped.
    Size { value: u64, seen_digit: bool },
    /// Consuming the remaining payload bytes of the current chunk.
    Data { remaining: u64 },
}

impl ChunkPhase {
    fn size() -> Self {
        Self::Size { value: 0, seen_digit: false }
    }
}

/// All mutable state of one request. Exactly one of these exists per
/// request; the bridge wraps it in the request lock.
pub(crate) struct Machine {
    state: State,
    error: Option<RequestError>,

    /// Serialized request line and headers, drained while sending.
    outgoing: SegmentedBuffer,
    /// Caller-supplied request body, drained after the head.
    request_body: Option<SegmentedBuffer>,

    /// Raw response bytes during the status-line and header phases.
    incoming: SegmentedBuffer,
    /// Decoded body bytes awaiting the consumer.
    body: SegmentedBuffer,

    status: u16,
    content_type: Option<String>,
    content_length: Option<u64>,
    /// Body bytes decoded so far; grows monotonically until terminal.
    received: u64,
    chunk: Option<ChunkPhase>,

    transport: Option<Box<dyn Transport>>,

    pub(crate) notify: Notifications,
    /// A blocking reader is parked on the condition variable.
    pub(crate) reader_waiting: bool,
    /// The single blocking-reader handle has been handed out.
    pub(crate) reader_taken: bool,
}

impl Machine {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            state: State::Empty,
            error: None,
            outgoing: SegmentedBuffer::new(),
            request_body: None,
            incoming: SegmentedBuffer::new(),
            body: SegmentedBuffer::new(),
            status: 0,
            content_type: None,
            content_length: None,
            received: 0,
            chunk: None,
            transport: Some(transport),
            notify: Notifications::default(),
            reader_waiting: false,
            reader_taken: false,
        }
    }

    /// Serializes the request and initiates the connection.
    ///
    /// Valid only from [`State::Empty`]; otherwise returns
    /// [`RequestError::InUse`] and leaves the in-flight request untouched.
    /// Scheme and synchronous connect failures are recorded (terminal) and
    /// returned.
    pub(crate) fn send(
        &mut self,
        method: &Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<SegmentedBuffer>,
        events: TransportEvents,
    ) -> Result<(), RequestError> {
        ensure!(self.state == State::Empty, RequestError::InUse);

        let url = UrlParts::parse(url);
        if url.scheme != "http" && url.scheme != "https" {
            let error = RequestError::unsupported_scheme(&url.scheme);
            self.fail(error.clone());
            return Err(error);
        }

        let _ = write!(self.outgoing, "{method} {} HTTP/1.1\r\nHost: {}\r\n", url.path, url.host);
        if let Some(body) = &body {
            if let Some(content_type) = content_type {
                let _ = write!(self.outgoing, "Content-Type: {content_type}\r\n");
            }
            let _ = write!(self.outgoing, "Content-Length: {}\r\n", body.available());
        }
        let _ = self.outgoing.write_str("\r\n");
        trace!(bytes = self.outgoing.available(), "serialized request head");

        self.request_body = body;
        self.state = State::Connecting;

        let connected = match self.transport.as_deref_mut() {
            Some(transport) => transport.connect(&url.host, url.port, url.is_tls(), events),
            None => false,
        };
        if !connected {
            debug!(host = %url.host, port = url.port, "connect failed");
            let error = RequestError::cannot_connect(format!("connect to {}:{} failed", url.host, url.port));
            self.fail(error.clone());
            self.outgoing.clear();
            self.request_body = None;
            self.transport = None;
            return Err(error);
        }

        trace!(host = %url.host, port = url.port, "connecting");
        Ok(())
    }

    /// Fails the request from any state, terminal states excepted: the first
    /// error wins and is never overwritten.
    pub(crate) fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!("aborting request");
        self.fail(RequestError::Aborted);
    }

    pub(crate) fn on_connected(&mut self) {
        trace!("transport connected");
        if self.state == State::Connecting {
            self.state = State::SendingRequest;
        }
        self.pump_send();
    }

    pub(crate) fn on_acknowledged(&mut self, len: usize, _time_ms: u32) {
        trace!(len, "transport acknowledged");
        // an acknowledge can race the connected event
        if self.state == State::Connecting {
            self.state = State::SendingRequest;
        }
        self.pump_send();
    }

    pub(crate) fn on_data(&mut self, data: &[u8]) {
        trace!(bytes = data.len(), "got transport data");
        if self.state.is_receiving_head() {
            self.incoming.write(data);
            while self.state.is_receiving_head() {
                let Some(line) = self.incoming.read_line(MAX_LINE_LENGTH) else {
                    break;
                };
                if line.is_truncated() {
                    self.fail(RequestError::protocol("response line too long"));
                    break;
                }
                let parsed = if self.state == State::ReceivingStatusLine {
                    self.parse_status_line(line.text())
                } else {
                    self.parse_header_line(line.text())
                };
                if let Err(error) = parsed {
                    self.fail(error);
                    break;
                }
            }
        } else if self.state == State::ReceivingBody {
            self.receive_body(data);
        } else {
            trace!(state = ?self.state, "ignoring data outside the receive phase");
        }
    }

    pub(crate) fn on_disconnected(&mut self) {
        trace!("transport disconnected");
        match self.state {
            State::ReceivingBody if self.chunk.is_none() && self.content_length.is_none() => {
                // close-delimited body: the disconnect is the end-of-body marker
                trace!("request completed by disconnect");
                self.complete();
            }
            State::Empty | State::Complete | State::Failed => {}
            _ => {
                self.fail(RequestError::connection_closed("connection closed before the response was complete"));
            }
        }
        self.transport = None;
    }

    pub(crate) fn on_failed(&mut self, code: i32) {
        let reason = self.describe_transport_error(code);
        debug!(code, %reason, "transport error");
        if self.state == State::Connecting {
            self.fail(RequestError::cannot_connect(reason));
        } else {
            self.fail(RequestError::connection_closed(reason));
        }
        self.transport = None;
    }

    pub(crate) fn on_timed_out(&mut self, code: i32) {
        let reason = self.describe_transport_error(code);
        debug!(code, %reason, "transport timeout");
        self.fail(RequestError::timeout(reason));
        self.transport = None;
    }

    /// Drains outgoing buffers into the transport's send window.
    ///
    /// Idempotent under repeated space-available events: outside the sending
    /// states, or with nothing buffered, this sends nothing.
    fn pump_send(&mut self) {
        if !self.state.is_sending() {
            return;
        }
        let Some(transport) = self.transport.as_deref_mut() else {
            return;
        };

        if self.state == State::SendingRequest && pump(&mut self.outgoing, transport) {
            if self.request_body.is_some() {
                trace!("request head sent, sending body");
                self.state = State::SendingBody;
            } else {
                trace!("request sent, receiving response");
                self.state = State::ReceivingStatusLine;
            }
        }

        if self.state == State::SendingBody {
            let Some(body) = self.request_body.as_mut() else {
                return;
            };
            if pump(body, transport) {
                trace!("request body sent, receiving response");
                self.state = State::ReceivingStatusLine;
            }
        }
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), RequestError> {
        let after_version = line
            .split_once(' ')
            .ok_or_else(|| RequestError::protocol(format!("malformed status line: {line:?}")))?
            .1;
        let token = after_version.trim_start_matches(' ');
        let value =
            parse_decimal(token).ok_or_else(|| RequestError::protocol(format!("malformed status line: {line:?}")))?;
        ensure!(value <= u64::from(u16::MAX), RequestError::protocol(format!("status code out of range: {value}")));

        trace!(status = value, "got http status");
        self.status = value as u16;
        self.state = State::ReceivingHeaders;
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), RequestError> {
        if line.is_empty() {
            self.finish_headers();
            return Ok(());
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::protocol(format!("invalid header line: {line:?}")))?;
        let value = value.trim_start_matches([' ', '\t']);

        if name.eq_ignore_ascii_case("content-length") {
            let length = parse_decimal(value)
                .ok_or_else(|| RequestError::protocol(format!("invalid content-length: {value:?}")))?;
            trace!(length, "got content-length");
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("content-type") {
            trace!(content_type = value, "got content-type");
            self.content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked") {
            trace!("got chunked response");
            self.chunk = Some(ChunkPhase::size());
        }

        Ok(())
    }

    /// The empty line after the headers: switch to the body phase and run
    /// any bytes buffered past the terminator through body processing —
    /// they may hold the start of the body or all of it.
    fn finish_headers(&mut self) {
        trace!(status = self.status, "end of headers");
        self.state = State::ReceivingBody;
        self.notify.begin = true;

        let mut spill = [0; FRAGMENT_SIZE];
        while self.state == State::ReceivingBody {
            let n = self.incoming.read(&mut spill);
            if n == 0 {
                break;
            }
            self.receive_body(&spill[..n]);
        }

        // a zero or already-satisfied content-length completes without any
        // further body event
        if self.state == State::ReceivingBody && self.chunk.is_none() {
            self.check_length_complete();
        }
    }

    fn receive_body(&mut self, data: &[u8]) {
        if self.chunk.is_some() {
            if let Err(error) = self.receive_chunked(data) {
                self.fail(error);
            }
        } else {
            self.append_body(data);
        }
    }

    /// Appends decoded body bytes, clamped so a known content-length is
    /// never exceeded, and flags the data notification.
    fn append_body(&mut self, data: &[u8]) {
        let mut length = data.len();
        if let Some(content_length) = self.content_length {
            let remaining = content_length.saturating_sub(self.received);
            length = length.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        trace!(bytes = length, "buffering body data");
        self.body.write(&data[..length]);
        self.received += length as u64;
        self.notify.data = true;

        if self.chunk.is_none() {
            self.check_length_complete();
        }
    }

    fn check_length_complete(&mut self) {
        if let Some(content_length) = self.content_length {
            if self.received >= content_length {
                self.complete();
            }
        }
    }

    fn receive_chunked(&mut self, mut data: &[u8]) -> Result<(), RequestError> {
        while !data.is_empty() && self.state == State::ReceivingBody {
            match self.chunk {
                Some(ChunkPhase::Size { mut value, mut seen_digit }) => {
                    let mut advanced = 0;
                    let mut entered_data = false;
                    for &byte in data {
                        advanced += 1;
                        match byte {
                            b'0'..=b'9' => {
                                value = value
                                    .checked_mul(10)
                                    .and_then(|v| v.checked_add(u64::from(byte - b'0')))
                                    .ok_or_else(|| RequestError::protocol("chunk size overflow"))?;
                                seen_digit = true;
                            }
                            b'\r' => {}
                            b'\n' if seen_digit => {
                                if value == 0 {
                                    // zero-size chunk terminates the body
                                    self.complete();
                                    return Ok(());
                                }
                                trace!(size = value, "got chunk size");
                                self.chunk = Some(ChunkPhase::Data { remaining: value });
                                entered_data = true;
                                break;
                            }
                            // the line break trailing the previous chunk's data
                            b'\n' => {}
                            _ => {
                                return Err(RequestError::protocol(format!(
                                    "invalid byte {byte:#04x} in chunk size"
                                )));
                            }
                        }
                    }
                    if !entered_data {
                        self.chunk = Some(ChunkPhase::Size { value, seen_digit });
                    }
                    data = &data[advanced..];
                }

                Some(ChunkPhase::Data { remaining }) => {
                    let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(data.len());
                    self.append_body(&data[..take]);
                    let remaining = remaining - take as u64;
                    self.chunk =
                        Some(if remaining == 0 { ChunkPhase::size() } else { ChunkPhase::Data { remaining } });
                    data = &data[take..];
                }

                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn complete(&mut self) {
        trace!(received = self.received, "request complete");
        self.state = State::Complete;
        self.notify.complete = true;
    }

    /// Records the terminal error. First error wins: a request that is
    /// already terminal is left untouched.
    fn fail(&mut self, error: RequestError) {
        if self.state.is_terminal() {
            return;
        }
        debug!(%error, "request failed");
        self.error = Some(error);
        self.state = State::Failed;
        self.notify.error = true;
    }

    fn describe_transport_error(&self, code: i32) -> String {
        match self.transport.as_ref() {
            Some(transport) => transport.error_to_string(code),
            None => format!("transport error {code}"),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn status(&self) -> u16 {
        self.status
    }

    pub(crate) fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The announced content length if one was seen, else the byte count
    /// actually received once complete, else 0.
    pub(crate) fn content_length(&self) -> u64 {
        if let Some(length) = self.content_length {
            length
        } else if self.state == State::Complete {
            self.received
        } else {
            0
        }
    }

    pub(crate) fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    /// Non-blocking drain of buffered body bytes.
    pub(crate) fn read_body(&mut self, dest: &mut [u8]) -> usize {
        self.body.read(dest)
    }

    pub(crate) fn take_notifications(&mut self) -> Notifications {
        std::mem::take(&mut self.notify)
    }

    pub(crate) fn has_notifications(&self) -> bool {
        !self.notify.is_clear()
    }

    pub(crate) fn take_transport(&mut self) -> Option<Box<dyn Transport>> {
        self.transport.take()
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: State) {
        self.state = state;
    }
}

/// Drains `buffer` into the transport's send window, copying no more than
/// the window accepts. Returns `true` once the buffer is fully drained,
/// `false` when the window fills up first.
fn pump(buffer: &mut SegmentedBuffer, transport: &mut dyn Transport) -> bool {
    let mut space = transport.space();
    trace!(space, buffered = buffer.available(), "draining send buffer");
    while space > 0 {
        let accepted = match buffer.peek(space) {
            Some(chunk) => transport.add(chunk),
            None => return true,
        };
        if accepted == 0 {
            return false;
        }
        buffer.consume(accepted);
        space -= accepted;
    }
    buffer.is_empty()
}

/// Leading unsigned-decimal digits of `text`. `None` when there is no digit
/// or the value overflows; parsing stops at the first non-digit.
fn parse_decimal(text: &str) -> Option<u64> {
    let mut value: u64 = 0;
    let mut digits = 0;
    for byte in text.bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(byte - b'0'))?;
        digits += 1;
    }
    (digits > 0).then_some(value)
}
