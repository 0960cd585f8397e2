//! Client sessions.
//!
//! A session serves one client connection. In [`SessionMode::Ordered`] it
//! answers one request before reading the next; in
//! [`SessionMode::Pipelined`] requests are dispatched concurrently and
//! answered in the order they finish.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

mod ordered;
mod pipelined;

use crate::{
    activity::ActivityClock,
    buffer_pool::{BufferPool, PooledBuf},
    dispatch::Dispatcher,
    error::ProtocolError,
    message,
    metrics::{self, Direction},
    request::Request,
    transport::{self, FrameReader, FrameWriter, Transport, TransportError, TransportOptions},
};

/// Default bound on concurrently dispatched requests per pipelined session.
pub const DEFAULT_MAX_PIPELINE: usize = 1000;

/// How a session schedules its requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// One request in flight. Names carry a `service:` prefix.
    Ordered,
    /// Many requests in flight, answered as they finish. Names are bare
    /// method names.
    Pipelined,
}

impl SessionMode {
    fn service_in_name(self) -> bool { matches!(self, Self::Ordered) }

    /// Module named in exceptions raised by sessions of this mode.
    #[must_use]
    pub fn module(self) -> &'static str {
        match self {
            Self::Ordered => "ordered_session",
            Self::Pipelined => "pipelined_session",
        }
    }
}

/// Failure that ended a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The client sent a frame that is not a message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Settings for one session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Scheduling mode.
    pub mode: SessionMode,
    /// Framing limits and flush policy of the client connection.
    pub transport: TransportOptions,
    /// Pool request frames are read into.
    pub buffer_pool: BufferPool,
    /// Bound on concurrently dispatched requests when pipelined.
    pub max_pipeline: usize,
    /// Touched for every dispatched request.
    pub clock: ActivityClock,
    /// Stops reading new requests when cancelled.
    pub shutdown: CancellationToken,
    /// Log per-request detail.
    pub verbose: bool,
}

impl SessionOptions {
    /// Defaults for `mode`.
    #[must_use]
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            transport: TransportOptions::default(),
            buffer_pool: BufferPool::new(),
            max_pipeline: DEFAULT_MAX_PIPELINE,
            clock: ActivityClock::new(),
            shutdown: CancellationToken::new(),
            verbose: false,
        }
    }
}

/// Serve the client on `stream` until it disconnects or `shutdown` fires.
///
/// # Errors
///
/// Returns the transport or protocol error that ended the session. A
/// client closing between frames is not an error.
pub async fn serve<T: Transport>(
    stream: T,
    peer: impl Into<String>,
    dispatcher: Arc<dyn Dispatcher>,
    options: SessionOptions,
) -> Result<(), SessionError> {
    let peer = peer.into();
    let _active = ActiveSession::new();
    let (mut reader, mut writer) =
        transport::framed(stream, options.buffer_pool.clone(), options.transport);
    let mode = options.mode;
    info!("session opened: peer={peer}, mode={mode:?}");
    let ctx = Context {
        peer,
        dispatcher,
        options,
    };
    let result = match mode {
        SessionMode::Ordered => ordered::run(&ctx, &mut reader, &mut writer).await,
        SessionMode::Pipelined => pipelined::run(&ctx, &mut reader, &mut writer).await,
    };
    if let Err(e) = writer.shutdown().await {
        debug!("session writer shutdown failed: peer={}, error={e}", ctx.peer);
    }
    match &result {
        Ok(ops) => info!("session closed: peer={}, ops={ops}", ctx.peer),
        Err(e) => warn!("session closed: peer={}, error={e}", ctx.peer),
    }
    result.map(|_| ())
}

/// Counts a running session in the sessions gauge.
struct ActiveSession;

impl ActiveSession {
    fn new() -> Self {
        metrics::inc_sessions();
        Self
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) { metrics::dec_sessions(); }
}

struct Context {
    peer: String,
    dispatcher: Arc<dyn Dispatcher>,
    options: SessionOptions,
}

/// A request ready to be written back.
enum Outcome {
    Answered(Request),
    /// The request was lost; only the exception replacing it is left.
    Lost(Vec<u8>),
}

impl Context {
    fn module(&self) -> &'static str { self.options.mode.module() }

    fn pool(&self) -> &BufferPool { &self.options.buffer_pool }

    fn decode(&self, frame: PooledBuf) -> Result<Request, ProtocolError> {
        metrics::inc_frames(Direction::Inbound);
        Request::from_frame(frame, self.options.mode.service_in_name())
    }

    /// Dispatch `request` and wait for its answer.
    async fn exchange(&self, request: Request) -> Outcome {
        exchange(self.dispatcher.as_ref(), &self.options.clock, self.module(), request).await
    }

    /// Queue the reply for `outcome` on `writer` and recycle its buffers.
    fn write_outcome<W: AsyncWrite + Unpin>(&self, writer: &mut FrameWriter<W>, outcome: Outcome) {
        match outcome {
            Outcome::Answered(request) => {
                if let Some(error) = request.error() {
                    info!(
                        "request failed, answering with exception: peer={}, service={}, method={}, error={error}",
                        self.peer,
                        request.service(),
                        request.method()
                    );
                }
                if self.options.verbose {
                    debug!(
                        "reply to client: peer={}, service={}, method={}, elapsed={:?}",
                        self.peer,
                        request.service(),
                        request.method(),
                        request.elapsed()
                    );
                }
                if request.message_type() != message::MessageType::Heartbeat {
                    metrics::record_latency(request.service(), request.method(), request.elapsed());
                }
                writer.write(&request.reply_frame(self.module()));
                request.recycle(self.pool());
            }
            Outcome::Lost(frame) => writer.write(&frame),
        }
        metrics::inc_frames(Direction::Outbound);
    }
}

async fn exchange(
    dispatcher: &dyn Dispatcher,
    clock: &ActivityClock,
    module: &str,
    request: Request,
) -> Outcome {
    clock.touch();
    let service = request.service().to_owned();
    let method = request.method().to_owned();
    let seq_id = request.seq_id();
    match dispatcher.call(request).await {
        Ok(request) => Outcome::Answered(request),
        Err(e) => {
            warn!("request lost: service={service}, method={method}, error={e}");
            Outcome::Lost(message::dispatch_error(module, &service, &method, seq_id, &e))
        }
    }
}

/// Next client frame, or `None` once the client closed cleanly or
/// `stop` fired.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus operations internally"
)]
async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    stop: &CancellationToken,
) -> Result<Option<PooledBuf>, SessionError> {
    tokio::select! {
        biased;

        () = stop.cancelled() => Ok(None),
        res = reader.read_frame() => match res {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.is_clean_close() => Ok(None),
            Err(e) => Err(e.into()),
        },
    }
}
