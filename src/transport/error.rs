//! Error types for the framed transport.
//!
//! - [`FramingError`]: the length prefix announced a frame the transport refuses to carry.
//! - [`EofError`]: the peer closed the stream, either cleanly between frames or part way through
//!   one.
//! - [`TransportError`]: top-level enum wrapping both plus I/O failures.
//!
//! Every variant is fatal to the connection that produced it. The variants
//! only differ in how they are logged.

use std::{io, sync::Arc};

use thiserror::Error;

/// Frame boundary violations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Frame length prefix indicates size exceeding configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Size announced by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },
}

/// End-of-stream conditions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// The peer closed the stream at a frame boundary.
    #[error("connection closed cleanly at frame boundary")]
    CleanClose,

    /// The peer closed the stream while the length prefix was being read.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Size of the length prefix.
        header_size: usize,
    },

    /// The peer closed the stream while a payload was being read.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte frame received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Size announced by the length prefix.
        expected: usize,
    },
}

/// Fatal transport failure.
///
/// Cloneable so one connection failure can be reported to every request
/// that was pending on it.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// Frame boundary violation.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// Stream ended.
    #[error(transparent)]
    Eof(#[from] EofError),
    /// Underlying I/O failure.
    #[error("transport i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self { Self::Io(Arc::new(error)) }
}

impl TransportError {
    /// Returns `true` when the peer closed the stream between frames.
    #[must_use]
    pub fn is_clean_close(&self) -> bool { matches!(self, Self::Eof(EofError::CleanClose)) }
}
