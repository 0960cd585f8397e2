//! Request- and message-level error types.
//!
//! Connection failures are reported as [`TransportError`]s by the transport
//! and carried into [`ProxyError`] when they fail pending requests.

use std::time::Duration;

use thiserror::Error;

pub use crate::transport::TransportError;

/// Malformed message header.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header ended before all fields were read.
    #[error("message header truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes needed to read the next field.
        need: usize,
        /// Bytes available.
        have: usize,
    },
    /// The leading word is not a strict binary version word.
    #[error("unsupported protocol version word {0:#010x}")]
    BadVersion(u32),
    /// The announced method name length is negative.
    #[error("negative message name length {0}")]
    NegativeNameLength(i32),
    /// The method name is not UTF-8.
    #[error("message name is not valid utf-8")]
    InvalidName,
}

/// Failure delivered to the caller of one request.
#[derive(Clone, Debug, Error)]
pub enum ProxyError {
    /// The chosen backend connection no longer accepts work.
    #[error("request sent to inactive backend {addr}")]
    InactiveBackend {
        /// Address of the backend connection.
        addr: String,
    },
    /// No heartbeat reply arrived within the allowed window.
    #[error("backend heartbeat timed out after {0:?}")]
    HeartbeatTimeout(Duration),
    /// The request stayed pending longer than the expiry age.
    #[error("request {service}.{method} timed out after {elapsed:?}")]
    Timeout {
        /// Logical service of the request.
        service: String,
        /// Method of the request.
        method: String,
        /// Time spent pending.
        elapsed: Duration,
    },
    /// The backend answered with a different method than was called.
    #[error("invalid response: expected method {expected}, got {actual}")]
    InvalidResponse {
        /// Method that was called.
        expected: String,
        /// Method named in the response.
        actual: String,
    },
    /// The request was dropped without ever being completed.
    #[error("request abandoned before completion")]
    Abandoned,
    /// The backend connection was taken offline while the request waited.
    #[error("backend {addr} stopped")]
    Stopped {
        /// Address of the backend connection.
        addr: String,
    },
    /// The backend connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::{ProtocolError, ProxyError};
    use crate::transport::EofError;

    #[rstest]
    #[case::inactive(
        ProxyError::InactiveBackend { addr: "10.0.0.1:9000".into() },
        "request sent to inactive backend 10.0.0.1:9000"
    )]
    #[case::timeout(
        ProxyError::Timeout { service: "user".into(), method: "get".into(), elapsed: Duration::from_secs(5) },
        "request user.get timed out after 5s"
    )]
    #[case::transport(
        ProxyError::from(crate::transport::TransportError::from(EofError::CleanClose)),
        "connection closed cleanly at frame boundary"
    )]
    #[case::protocol(
        ProxyError::from(ProtocolError::BadVersion(0x1234)),
        "unsupported protocol version word 0x00001234"
    )]
    fn display_messages(#[case] err: ProxyError, #[case] expected: &str) {
        assert_eq!(err.to_string(), expected);
    }
}
