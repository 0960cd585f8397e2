//! Read side of the framed transport.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::{
    LENGTH_HEADER_SIZE,
    error::{EofError, FramingError, TransportError},
};
use crate::{
    buffer_pool::{BufferPool, PooledBuf},
    byte_order::read_network_u32,
};

/// Reads whole length-prefixed frames into pooled buffers.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    pool: BufferPool,
    max_frame_length: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `inner`, rejecting frames longer than `max_frame_length`.
    pub fn new(inner: R, pool: BufferPool, max_frame_length: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            pool,
            max_frame_length,
        }
    }

    /// Read the next complete frame payload.
    ///
    /// Waits until the whole frame has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] when the length prefix exceeds
    /// the maximum, an [`EofError`] when the stream ends, and
    /// [`TransportError::Io`] for any other read failure. All are fatal.
    pub async fn read_frame(&mut self) -> Result<PooledBuf, TransportError> {
        let mut header = [0u8; LENGTH_HEADER_SIZE];
        let mut filled = 0;
        while filled < LENGTH_HEADER_SIZE {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    EofError::CleanClose
                } else {
                    EofError::MidHeader {
                        bytes_received: filled,
                        header_size: LENGTH_HEADER_SIZE,
                    }
                }
                .into());
            }
            filled += n;
        }

        let size = usize::try_from(read_network_u32(header)).unwrap_or(usize::MAX);
        if size > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size,
                max: self.max_frame_length,
            }
            .into());
        }

        let mut frame = self.pool.acquire(size);
        let mut received = 0;
        while received < size {
            let n = self.inner.read(&mut frame[received..]).await?;
            if n == 0 {
                self.pool.release(frame);
                return Err(EofError::MidFrame {
                    bytes_received: received,
                    expected: size,
                }
                .into());
            }
            received += n;
        }
        Ok(frame)
    }

    /// Pool used for frame buffers.
    #[must_use]
    pub fn pool(&self) -> &BufferPool { &self.pool }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    use super::FrameReader;
    use crate::{
        buffer_pool::BufferPool,
        transport::error::{EofError, FramingError, TransportError},
    };

    async fn read_from(bytes: &[u8], max: usize) -> Result<Vec<u8>, TransportError> {
        let (mut client, server) = tokio::io::duplex(64);
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            client.write_all(&bytes).await.unwrap();
        });
        let mut reader = FrameReader::new(server, BufferPool::new(), max);
        reader.read_frame().await.map(|frame| frame.to_vec())
    }

    #[tokio::test]
    async fn reads_split_frame() {
        let frame = read_from(&[0, 0, 0, 3, b'a', b'b', b'c', 0xff], 16)
            .await
            .unwrap();
        assert_eq!(frame, b"abc");
    }

    #[rstest]
    #[case::clean(&[], EofError::CleanClose)]
    #[case::mid_header(&[0, 0], EofError::MidHeader { bytes_received: 2, header_size: 4 })]
    #[case::mid_frame(&[0, 0, 0, 5, 1, 2], EofError::MidFrame { bytes_received: 2, expected: 5 })]
    #[tokio::test]
    async fn classifies_eof(#[case] bytes: &[u8], #[case] expected: EofError) {
        let err = read_from(bytes, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::Eof(e) if e == expected));
    }

    #[tokio::test]
    async fn rejects_oversized_length_prefix() {
        let err = read_from(&[0, 0, 0, 17], 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::OversizedFrame { size: 17, max: 16 })
        ));
    }
}
