//! Read side of a backend connection.

use log::{debug, error, info, warn};
use tokio::io::AsyncRead;

use super::connection::{BackendConnection, Outbound};
use crate::{
    buffer_pool::PooledBuf,
    error::ProxyError,
    message::{MessageHeader, MessageType, decode_header},
    metrics::{self, Direction},
    transport::{FrameReader, TransportError},
};

pub(super) struct ReadLoop<R> {
    conn: BackendConnection,
    reader: FrameReader<R>,
}

impl<R: AsyncRead + Unpin> ReadLoop<R> {
    pub(super) fn new(conn: BackendConnection, reader: FrameReader<R>) -> Self { Self { conn, reader } }

    /// Match response frames to pending requests until shutdown or a fatal
    /// error. A fatal error fails every pending request before returning.
    pub(super) async fn run(&mut self) -> Result<(), ProxyError> {
        loop {
            let frame = match self.next_frame().await {
                None => return Ok(()),
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if e.is_clean_close() {
                        info!(
                            "backend closed connection: service={}, addr={}",
                            self.conn.service(),
                            self.conn.addr()
                        );
                    } else {
                        error!(
                            "backend read failed: service={}, addr={}, error={e}",
                            self.conn.service(),
                            self.conn.addr()
                        );
                        metrics::inc_errors("transport");
                    }
                    return Err(self.fail_pending(e.into()));
                }
            };
            metrics::inc_frames(Direction::Inbound);
            self.handle_frame(frame).await?;
        }
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn next_frame(&mut self) -> Option<Result<PooledBuf, TransportError>> {
        let shutdown = &self.conn.shared.shutdown;
        tokio::select! {
            biased;

            () = shutdown.cancelled() => None,
            res = self.reader.read_frame() => Some(res),
        }
    }

    fn fail_pending(&self, error: ProxyError) -> ProxyError {
        self.conn.mark_inactive();
        for entry in self.conn.shared.pending.purge() {
            debug!(
                "failing pending request: service={}, method={}, seq_id={:?}",
                entry.request().service(),
                entry.request().method(),
                entry.request().rewritten_seq_id()
            );
            entry.fail(error.clone());
        }
        self.conn.signal_if_drained();
        error
    }

    async fn handle_frame(&mut self, frame: PooledBuf) -> Result<(), ProxyError> {
        let header = match decode_header(&frame) {
            Ok(header) => header,
            Err(e) => {
                error!(
                    "undecodable backend frame: service={}, addr={}, error={e}",
                    self.conn.service(),
                    self.conn.addr()
                );
                metrics::inc_errors("protocol");
                self.reader.pool().release(frame);
                return Err(self.fail_pending(e.into()));
            }
        };
        match header.message_type {
            MessageType::Heartbeat => {
                self.conn.touch_heartbeat();
                self.reader.pool().release(frame);
            }
            MessageType::Stop => {
                self.reader.pool().release(frame);
                self.on_stop().await;
            }
            _ => self.complete(&header, frame),
        }
        Ok(())
    }

    /// The backend asked to stop: take no more work and answer with a stop
    /// confirm once everything already queued has been written.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn on_stop(&mut self) {
        info!(
            "backend requested stop: service={}, addr={}",
            self.conn.service(),
            self.conn.addr()
        );
        self.conn.mark_inactive();
        let shared = &self.conn.shared;
        tokio::select! {
            biased;

            () = shared.shutdown.cancelled() => {}
            res = shared.tx.send(Outbound::StopConfirm) => {
                if res.is_err() {
                    debug!("stop confirm not queued, queue closed: addr={}", shared.addr);
                }
            }
        }
    }

    fn complete(&self, header: &MessageHeader, frame: PooledBuf) {
        let shared = &self.conn.shared;
        let Some(mut entry) = shared.pending.pop(header.seq_id) else {
            warn!(
                "response for unknown sequence id: service={}, addr={}, method={}, seq_id={}",
                shared.service, shared.addr, header.name, header.seq_id
            );
            self.reader.pool().release(frame);
            return;
        };
        self.conn.signal_if_drained();

        if header.name != entry.request().method() {
            let error = entry.request().invalid_response(&header.name);
            warn!(
                "backend answered a different method: service={}, addr={}, error={error}",
                shared.service, shared.addr
            );
            metrics::inc_errors("protocol");
            self.reader.pool().release(frame);
            entry.fail(error);
            return;
        }

        if shared.options.verbose {
            debug!(
                "response from backend: service={}, method={}, backend_seq_id={}",
                shared.service, header.name, header.seq_id
            );
        }
        let request = entry.request_mut();
        request.set_response(frame, header.message_type);
        request.restore_seq_id();
        entry.complete();
    }
}
