//! Length-prefixed framing over byte streams.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by that
//! many payload bytes. Reading and writing are split so a connection's read
//! loop and write loop can each own one half.

use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
};

pub mod error;
mod reader;
mod writer;

pub use error::{EofError, FramingError, TransportError};
pub use reader::FrameReader;
pub use writer::{FlushPolicy, FrameWriter};

use crate::buffer_pool::BufferPool;

/// Length prefix size in bytes.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Default maximum frame length in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16_384_000;

/// Byte streams a framed transport can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream used for dialed connections.
pub type BoxedTransport = Box<dyn Transport>;

/// Limits shared by both halves of a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    /// Largest accepted frame payload.
    pub max_frame_length: usize,
    /// Write-side batching policy.
    pub flush: FlushPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            flush: FlushPolicy::default(),
        }
    }
}

/// Split `stream` into a frame reader and a frame writer.
pub fn framed<T: Transport>(
    stream: T,
    pool: BufferPool,
    options: TransportOptions,
) -> (FrameReader<ReadHalf<T>>, FrameWriter<WriteHalf<T>>) {
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader::new(read, pool, options.max_frame_length),
        FrameWriter::new(write, options.max_frame_length, options.flush),
    )
}

/// Connect to `addr`.
///
/// Addresses containing a `:` are dialed over TCP; anything else is taken
/// as a unix socket path.
///
/// # Errors
///
/// Returns the connect error, or [`io::ErrorKind::Unsupported`] for unix
/// socket paths on platforms without them.
pub async fn connect(addr: &str) -> io::Result<BoxedTransport> {
    if addr.contains(':') {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        return Ok(Box::new(stream));
    }
    #[cfg(unix)]
    {
        let stream = tokio::net::UnixStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unix socket {addr} not supported on this platform"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{FlushPolicy, TransportOptions, framed};
    use crate::buffer_pool::BufferPool;

    fn options(max: usize) -> TransportOptions {
        TransportOptions {
            max_frame_length: max,
            flush: FlushPolicy::default(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn frames_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let read_back = rt.block_on(async {
                let (client, server) = tokio::io::duplex(8192);
                let (_, mut writer) = framed(client, BufferPool::new(), options(4096));
                let (mut reader, _) = framed(server, BufferPool::new(), options(4096));
                writer.send_frame(&payload, true).await.unwrap();
                reader.read_frame().await.unwrap().to_vec()
            });
            prop_assert_eq!(read_back, payload);
        }
    }

    #[tokio::test]
    async fn frame_at_maximum_round_trips() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let max = 20_000;
        let (_, mut writer) = framed(client, BufferPool::new(), options(max));
        let (mut reader, _) = framed(server, BufferPool::new(), options(max));
        let payload = vec![7u8; max];
        let send = tokio::spawn(async move {
            writer.send_frame(&payload, true).await.unwrap();
            writer
        });
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.len(), max);
        assert!(frame.iter().all(|&b| b == 7));
        drop(send.await.unwrap());
    }

    #[tokio::test]
    async fn reader_rejects_frames_beyond_its_maximum() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut writer) = framed(client, BufferPool::new(), options(64));
        let (mut reader, _) = framed(server, BufferPool::new(), options(32));
        writer.send_frame(&[1u8; 33], true).await.unwrap();
        assert!(reader.read_frame().await.is_err());
    }
}
