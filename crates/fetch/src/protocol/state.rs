/// Lifecycle of a single request.
///
/// Transitions run in declaration order, `SendingBody` being skipped for
/// body-less requests. `Failed` is reachable from every non-terminal state
/// and is absorbing: the first error wins and is never overwritten.
///
/// Phase questions are asked through the predicates below, never by
/// comparing variants numerically — the variant order is documentation,
/// not an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly constructed, `send` not called yet.
    Empty,
    /// Connect initiated, waiting for the transport.
    Connecting,
    /// Draining the serialized request line and headers.
    SendingRequest,
    /// Draining the caller-supplied request body.
    SendingBody,
    /// Waiting for (the rest of) the status line.
    ReceivingStatusLine,
    /// Status line parsed, collecting header lines.
    ReceivingHeaders,
    /// Headers done, accumulating body bytes.
    ReceivingBody,
    /// Body fully received; the response is immutable now.
    Complete,
    /// Terminal failure; see the recorded [`RequestError`](super::RequestError).
    Failed,
}

impl State {
    /// The request has finished, successfully or not. No further transition
    /// happens and no transport event mutates the machine anymore.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Currently draining bytes towards the server.
    pub(crate) fn is_sending(self) -> bool {
        matches!(self, Self::SendingRequest | Self::SendingBody)
    }

    /// Currently collecting status line or header lines.
    pub(crate) fn is_receiving_head(self) -> bool {
        matches!(self, Self::ReceivingStatusLine | Self::ReceivingHeaders)
    }
}
