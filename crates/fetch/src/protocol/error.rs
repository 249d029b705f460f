use thiserror::Error;

/// Terminal failure of a request.
///
/// First error wins: once a request records one of these it is never
/// overwritten by a later failure, so the reported error is the root cause.
/// All errors are final for the request instance; retrying means building a
/// new request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unsupported URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("request already started")]
    InUse,

    #[error("cannot connect: {reason}")]
    CannotConnect { reason: String },

    #[error("request timed out: {reason}")]
    Timeout { reason: String },

    #[error("server closed connection: {reason}")]
    ConnectionClosed { reason: String },

    #[error("malformed response: {reason}")]
    Protocol { reason: String },

    #[error("request aborted")]
    Aborted,
}

impl RequestError {
    pub fn unsupported_scheme<S: ToString>(scheme: S) -> Self {
        Self::UnsupportedScheme { scheme: scheme.to_string() }
    }

    pub fn cannot_connect<S: ToString>(reason: S) -> Self {
        Self::CannotConnect { reason: reason.to_string() }
    }

    pub fn timeout<S: ToString>(reason: S) -> Self {
        Self::Timeout { reason: reason.to_string() }
    }

    pub fn connection_closed<S: ToString>(reason: S) -> Self {
        Self::ConnectionClosed { reason: reason.to_string() }
    }

    pub fn protocol<S: ToString>(reason: S) -> Self {
        Self::Protocol { reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_detail() {
        let error = RequestError::cannot_connect("connection refused");
        assert_eq!(error.to_string(), "cannot connect: connection refused");

        let error = RequestError::unsupported_scheme("ftp");
        assert_eq!(error.to_string(), "unsupported URL scheme: ftp");

        assert_eq!(RequestError::InUse.to_string(), "request already started");
    }
}
