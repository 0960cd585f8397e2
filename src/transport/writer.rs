//! Write side of the framed transport.
//!
//! Writes accumulate in a payload buffer. [`FrameWriter::flush_buffer`]
//! length-prefixes the payload into the transport buffer, which reaches the
//! stream when forced or when the [`FlushPolicy`] says enough frames or time
//! have piled up.

use bytes::BytesMut;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{Duration, Instant},
};
use tokio_util::codec::{Encoder, LengthDelimitedCodec};

use super::{
    LENGTH_HEADER_SIZE,
    error::{FramingError, TransportError},
};

/// When buffered frames are pushed to the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Frames buffered before a flush is forced.
    pub max_buffered: usize,
    /// Longest time buffered frames may wait.
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_buffered: 20,
            max_interval: Duration::from_micros(100),
        }
    }
}

/// Buffered writer emitting length-prefixed frames.
pub struct FrameWriter<W> {
    inner: W,
    codec: LengthDelimitedCodec,
    max_frame_length: usize,
    payload: BytesMut,
    pending: bool,
    outbound: BytesMut,
    policy: FlushPolicy,
    buffered: usize,
    last_flush: Instant,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap `inner` with the given limits.
    pub fn new(inner: W, max_frame_length: usize, policy: FlushPolicy) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_HEADER_SIZE)
            .big_endian()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            inner,
            codec,
            max_frame_length,
            payload: BytesMut::new(),
            pending: false,
            outbound: BytesMut::new(),
            policy,
            buffered: 0,
            last_flush: Instant::now(),
        }
    }

    /// Append `bytes` to the frame being assembled. No I/O happens here.
    pub fn write(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
        self.pending = true;
    }

    /// Close the assembled frame and flush according to policy.
    ///
    /// With `force` the transport buffer is written out regardless of the
    /// policy. Calling this with nothing assembled only applies the flush
    /// decision.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] when the assembled payload is
    /// longer than the maximum, and [`TransportError::Io`] when the stream
    /// fails.
    pub async fn flush_buffer(&mut self, force: bool) -> Result<(), TransportError> {
        if self.pending {
            self.pending = false;
            let payload = self.payload.split().freeze();
            if payload.len() > self.max_frame_length {
                return Err(FramingError::OversizedFrame {
                    size: payload.len(),
                    max: self.max_frame_length,
                }
                .into());
            }
            self.codec.encode(payload, &mut self.outbound)?;
            self.buffered += 1;
        }
        if force || self.need_flush() {
            self.flush_transport().await?;
        }
        Ok(())
    }

    /// Write `frame` as one complete frame and flush according to policy.
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::flush_buffer`].
    pub async fn send_frame(&mut self, frame: &[u8], force: bool) -> Result<(), TransportError> {
        self.write(frame);
        self.flush_buffer(force).await
    }

    /// Flush everything buffered and shut the stream down.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the stream fails.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.flush_buffer(true).await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Number of frames waiting in the transport buffer.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buffered }

    fn need_flush(&self) -> bool {
        self.buffered > 0
            && (self.buffered >= self.policy.max_buffered
                || self.last_flush.elapsed() > self.policy.max_interval)
    }

    async fn flush_transport(&mut self) -> Result<(), TransportError> {
        if !self.outbound.is_empty() {
            self.inner.write_all(&self.outbound).await?;
            self.outbound.clear();
        }
        self.inner.flush().await?;
        self.buffered = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}
