//! Write side of a backend connection.
//!
//! The only place sequence ids are rewritten. Requests leave in queue
//! order; each is recorded in the pending table before its bytes are
//! flushed so the response can never outrun the record.

use log::{debug, error, warn};
use tokio::{
    io::AsyncWrite,
    sync::mpsc,
    time::{self, Duration, Instant, Interval, MissedTickBehavior},
};

use super::connection::{BackendConnection, Outbound};
use crate::{
    error::ProxyError,
    message,
    metrics::{self, Direction},
    request::InFlight,
    seq_id::SeqIds,
    transport::FrameWriter,
};

/// Time allowed for the final flush when the connection closes.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Event {
    Shutdown,
    Drain,
    Tick,
    Item(Option<Outbound>),
}

pub(super) struct WriteLoop<W> {
    conn: BackendConnection,
    rx: mpsc::Receiver<Outbound>,
    writer: FrameWriter<W>,
    ids: SeqIds,
}

impl<W: AsyncWrite + Unpin> WriteLoop<W> {
    pub(super) fn new(
        conn: BackendConnection,
        rx: mpsc::Receiver<Outbound>,
        writer: FrameWriter<W>,
    ) -> Self {
        let ids = SeqIds::new(conn.shared.options.seq_ids);
        Self {
            conn,
            rx,
            writer,
            ids,
        }
    }

    /// Drain the queue until shutdown, a fatal error or the end of an
    /// offline drain.
    pub(super) async fn run(&mut self) -> Result<(), ProxyError> {
        let period = self.conn.shared.options.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut draining = false;
        loop {
            match self.next_event(&mut ticker, draining).await {
                Event::Shutdown => return Ok(()),
                Event::Drain => {
                    draining = true;
                    self.rx.close();
                }
                Event::Tick => self.on_tick().await?,
                Event::Item(Some(item)) => self.write_item(item).await?,
                Event::Item(None) => return self.finish().await,
            }
        }
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn next_event(&mut self, ticker: &mut Interval, draining: bool) -> Event {
        let shared = &self.conn.shared;
        tokio::select! {
            biased;

            () = shared.shutdown.cancelled() => Event::Shutdown,
            () = shared.draining.cancelled(), if !draining => Event::Drain,
            _ = ticker.tick() => Event::Tick,
            item = self.rx.recv() => Event::Item(item),
        }
    }

    async fn on_tick(&mut self) -> Result<(), ProxyError> {
        let silence = self.conn.heartbeat_age();
        if silence > self.conn.shared.options.heartbeat_timeout {
            warn!(
                "backend heartbeat timed out: service={}, addr={}, silence={silence:?}",
                self.conn.service(),
                self.conn.addr()
            );
            metrics::inc_errors("heartbeat");
            return Err(ProxyError::HeartbeatTimeout(silence));
        }
        if self.conn.is_active() {
            if self
                .conn
                .shared
                .tx
                .try_send(Outbound::Ping(Instant::now()))
                .is_err()
            {
                debug!(
                    "heartbeat skipped, queue full: service={}, addr={}",
                    self.conn.service(),
                    self.conn.addr()
                );
            }
            self.sweep_expired();
        }
        Ok(())
    }

    fn sweep_expired(&self) {
        let shared = &self.conn.shared;
        let Some(cutoff) = Instant::now().checked_sub(shared.options.request_expiry) else {
            return;
        };
        let expired = shared.pending.remove_expired(cutoff);
        if expired.is_empty() {
            return;
        }
        for entry in expired {
            let error = entry.request().timeout_error();
            warn!(
                "request expired: service={}, method={}, addr={}, elapsed={:?}",
                entry.request().service(),
                entry.request().method(),
                shared.addr,
                entry.request().elapsed()
            );
            metrics::inc_errors("timeout");
            entry.fail(error);
        }
        self.conn.signal_if_drained();
    }

    async fn write_item(&mut self, item: Outbound) -> Result<(), ProxyError> {
        match item {
            Outbound::Call(in_flight) => self.write_call(in_flight).await,
            Outbound::Ping(queued_at) => self.write_ping(queued_at).await,
            Outbound::StopConfirm => {
                self.write_stop_confirm().await;
                Ok(())
            }
        }
    }

    async fn write_call(&mut self, mut in_flight: InFlight) -> Result<(), ProxyError> {
        let id = self.ids.next_id();
        in_flight.request_mut().replace_seq_id(id);
        self.writer.write(in_flight.request().payload());
        if self.conn.shared.options.verbose {
            let request = in_flight.request();
            debug!(
                "request to backend: service={}, method={}, seq_id={}, backend_seq_id={id}",
                request.service(),
                request.method(),
                request.seq_id()
            );
        }
        if let Some(displaced) = self.conn.shared.pending.insert(id, in_flight) {
            displaced.fail(ProxyError::Abandoned);
        }
        let force = self.rx.is_empty();
        match self.writer.flush_buffer(force).await {
            Ok(()) => {
                metrics::inc_frames(Direction::Outbound);
                Ok(())
            }
            Err(e) => {
                error!(
                    "backend write failed: service={}, addr={}, error={e}",
                    self.conn.service(),
                    self.conn.addr()
                );
                metrics::inc_errors("transport");
                let error = ProxyError::from(e);
                if let Some(entry) = self.conn.shared.pending.pop(id) {
                    entry.fail(error.clone());
                }
                Err(error)
            }
        }
    }

    async fn write_ping(&mut self, queued_at: Instant) -> Result<(), ProxyError> {
        let age = queued_at.elapsed();
        if age > self.conn.shared.options.ping_expiry {
            warn!(
                "expired heartbeat discarded: service={}, addr={}, age={age:?}",
                self.conn.service(),
                self.conn.addr()
            );
        } else {
            self.writer.write(&message::ping_frame(self.ids.next_id()));
        }
        let force = self.rx.is_empty();
        self.flush(force).await
    }

    async fn write_stop_confirm(&mut self) {
        self.writer.write(&message::stop_confirm_frame());
        if let Err(e) = self.writer.flush_buffer(true).await {
            error!(
                "stop confirm write failed: service={}, addr={}, error={e}",
                self.conn.service(),
                self.conn.addr()
            );
        }
    }

    async fn flush(&mut self, force: bool) -> Result<(), ProxyError> {
        self.writer.flush_buffer(force).await.map_err(|e| {
            error!(
                "backend flush failed: service={}, addr={}, error={e}",
                self.conn.service(),
                self.conn.addr()
            );
            metrics::inc_errors("transport");
            ProxyError::from(e)
        })
    }

    /// The queue closed after the connection went offline. Flush what was
    /// written and give outstanding responses until the request expiry to
    /// arrive.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn finish(&mut self) -> Result<(), ProxyError> {
        self.flush(true).await?;
        let grace = self.conn.shared.options.request_expiry;
        let shutdown = self.conn.shared.shutdown.clone();
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {}
            res = time::timeout(grace, self.conn.wait_drained()) => {
                if res.is_err() {
                    warn!(
                        "offline backend still has pending requests: service={}, addr={}, pending={}",
                        self.conn.service(),
                        self.conn.addr(),
                        self.conn.pending_count()
                    );
                }
            }
        }
        Ok(())
    }

    /// Fail every request still queued with `cause`.
    pub(super) fn fail_queued(&mut self, cause: &ProxyError) {
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            if let Outbound::Call(in_flight) = item {
                in_flight.fail(cause.clone());
            }
        }
    }

    /// Flush and shut the write half down, ignoring failures. A peer that
    /// stopped reading gets [`CLOSE_GRACE`] before the half is dropped.
    pub(super) async fn close(&mut self) {
        match time::timeout(CLOSE_GRACE, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(
                "backend writer shutdown failed: service={}, addr={}, error={e}",
                self.conn.service(),
                self.conn.addr()
            ),
            Err(_) => debug!(
                "backend writer shutdown timed out: service={}, addr={}",
                self.conn.service(),
                self.conn.addr()
            ),
        }
    }
}
