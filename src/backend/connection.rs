//! Handle and lifecycle of one backend connection.
//!
//! The actor runs a write loop and a read loop over the two halves of the
//! stream, each as its own task under one cancellation token. Whichever
//! loop ends first cancels the other. Teardown then marks the connection
//! inactive, fails whatever is still queued and purges the pending table
//! with the terminal error.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use log::{error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{BackendOptions, counter::OpenBackend, read_loop::ReadLoop, write_loop::WriteLoop};
use crate::{
    error::ProxyError,
    pending::PendingTable,
    request::InFlight,
    transport::{self, Transport},
};

/// Slot value of a connection that is in no active set.
pub(crate) const NO_SLOT: usize = usize::MAX;

/// Callback told when a connection changes state.
///
/// Called once when the connection is spawned and once when it turns
/// inactive. The callback reads the current state through
/// [`BackendConnection::is_active`].
pub type StateListener = Arc<dyn Fn(&BackendConnection) + Send + Sync>;

/// Work queued for the write loop.
pub(super) enum Outbound {
    Call(InFlight),
    Ping(Instant),
    StopConfirm,
}

pub(super) struct Shared {
    pub(super) addr: String,
    pub(super) service: String,
    pub(super) options: BackendOptions,
    pub(super) tx: mpsc::Sender<Outbound>,
    pub(super) pending: PendingTable<InFlight>,
    pub(super) shutdown: CancellationToken,
    pub(super) draining: CancellationToken,
    pub(super) drained: Notify,
    active: AtomicBool,
    offline: AtomicBool,
    slot: AtomicUsize,
    epoch: Instant,
    last_heartbeat_ms: AtomicU64,
    listener: Option<StateListener>,
}

/// Handle to a running backend connection actor.
///
/// Cloning is cheap; all clones refer to the same actor.
#[derive(Clone)]
pub struct BackendConnection {
    pub(super) shared: Arc<Shared>,
}

impl BackendConnection {
    /// Start an actor over `stream`.
    ///
    /// The connection starts active and `listener`, if any, is told so
    /// before the actor runs. The join handle yields the terminal result:
    /// `Ok` when the connection was taken offline and drained, otherwise
    /// the error that ended it.
    pub fn spawn<T: Transport>(
        stream: T,
        addr: impl Into<String>,
        service: impl Into<String>,
        options: BackendOptions,
        listener: Option<StateListener>,
    ) -> (Self, JoinHandle<Result<(), ProxyError>>) {
        let (conn, write_loop, read_loop) = Self::prepare(stream, addr, service, options, listener);
        let handle = tokio::spawn(conn.clone().run(write_loop, read_loop));
        (conn, handle)
    }

    fn prepare<T: Transport>(
        stream: T,
        addr: impl Into<String>,
        service: impl Into<String>,
        options: BackendOptions,
        listener: Option<StateListener>,
    ) -> (
        Self,
        WriteLoop<tokio::io::WriteHalf<T>>,
        ReadLoop<tokio::io::ReadHalf<T>>,
    ) {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (reader, writer) =
            transport::framed(stream, options.buffer_pool.clone(), options.transport);
        let epoch = Instant::now();
        let conn = Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                service: service.into(),
                pending: PendingTable::with_capacity(options.pending_capacity),
                options,
                tx,
                shutdown: CancellationToken::new(),
                draining: CancellationToken::new(),
                drained: Notify::new(),
                active: AtomicBool::new(true),
                offline: AtomicBool::new(false),
                slot: AtomicUsize::new(NO_SLOT),
                epoch,
                last_heartbeat_ms: AtomicU64::new(0),
                listener,
            }),
        };
        conn.notify_listener();
        let write_loop = WriteLoop::new(conn.clone(), rx, writer);
        let read_loop = ReadLoop::new(conn.clone(), reader);
        (conn, write_loop, read_loop)
    }

    async fn run<R, W>(
        self,
        mut write_loop: WriteLoop<W>,
        mut read_loop: ReadLoop<R>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let _open = OpenBackend::new(&self.shared.service);
        info!(
            "backend connection added: service={}, addr={}, open={}",
            self.shared.service,
            self.shared.addr,
            super::open_backend_count()
        );
        let shutdown = self.shared.shutdown.clone();
        let reading = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let res = read_loop.run().await;
                shutdown.cancel();
                res
            }
        });
        let written = write_loop.run().await;
        shutdown.cancel();
        let read = reading.await.unwrap_or_else(|e| {
            error!(
                "backend read loop failed: service={}, addr={}, error={e}",
                self.shared.service, self.shared.addr
            );
            Err(ProxyError::Abandoned)
        });
        self.mark_inactive();

        let result = written.and(read);
        let cause = match &result {
            Err(e) => e.clone(),
            Ok(()) => ProxyError::Stopped {
                addr: self.shared.addr.clone(),
            },
        };
        write_loop.fail_queued(&cause);
        write_loop.close().await;
        for entry in self.shared.pending.purge() {
            entry.fail(cause.clone());
        }
        match &result {
            Ok(()) => info!(
                "backend connection removed: service={}, addr={}",
                self.shared.service, self.shared.addr
            ),
            Err(e) => warn!(
                "backend connection removed: service={}, addr={}, error={e}",
                self.shared.service, self.shared.addr
            ),
        }
        result
    }

    /// Queue `in_flight` for this backend.
    ///
    /// Waits while the queue is full. An inactive connection fails the
    /// request at once with [`ProxyError::InactiveBackend`].
    pub async fn push_back(&self, in_flight: InFlight) {
        if !self.is_active() {
            warn!(
                "request pushed to inactive backend: service={}, addr={}, method={}",
                self.shared.service,
                self.shared.addr,
                in_flight.request().method()
            );
            in_flight.fail(self.inactive_error());
            return;
        }
        if let Err(mpsc::error::SendError(Outbound::Call(in_flight))) =
            self.shared.tx.send(Outbound::Call(in_flight)).await
        {
            in_flight.fail(self.inactive_error());
        }
    }

    fn inactive_error(&self) -> ProxyError {
        ProxyError::InactiveBackend {
            addr: self.shared.addr.clone(),
        }
    }

    /// Stop accepting work and let the actor drain.
    ///
    /// Queued requests are still written. The actor then waits up to the
    /// request expiry for outstanding responses before it exits cleanly.
    pub fn mark_offline(&self) {
        if !self.shared.offline.swap(true, Ordering::AcqRel) {
            info!(
                "backend connection marked offline: service={}, addr={}",
                self.shared.service, self.shared.addr
            );
            self.mark_inactive();
            self.shared.draining.cancel();
        }
    }

    /// Close the connection without draining.
    pub fn close(&self) {
        self.mark_inactive();
        self.shared.shutdown.cancel();
    }

    /// Turn the connection inactive. Only the first call has any effect.
    pub(super) fn mark_inactive(&self) {
        if self
            .shared
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(
                "backend connection inactive: service={}, addr={}",
                self.shared.service, self.shared.addr
            );
            self.notify_listener();
        }
    }

    fn notify_listener(&self) {
        if let Some(listener) = &self.shared.listener {
            listener(self);
        }
    }

    /// Record that a heartbeat reply arrived.
    pub(super) fn touch_heartbeat(&self) {
        let elapsed = self.shared.epoch.elapsed().as_millis();
        self.shared
            .last_heartbeat_ms
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Release);
    }

    /// Time since the last heartbeat reply, or since the actor started.
    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        let last = Duration::from_millis(self.shared.last_heartbeat_ms.load(Ordering::Acquire));
        self.shared.epoch.elapsed().saturating_sub(last)
    }

    /// Wait until no request is pending.
    pub(super) async fn wait_drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Wake [`Self::wait_drained`] when the pending table has emptied.
    pub(super) fn signal_if_drained(&self) {
        if self.shared.pending.is_empty() {
            self.shared.drained.notify_waiters();
        }
    }

    /// Remote address.
    #[must_use]
    pub fn addr(&self) -> &str { &self.shared.addr }

    /// Logical service served by the backend.
    #[must_use]
    pub fn service(&self) -> &str { &self.shared.service }

    /// Whether the connection accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool { self.shared.active.load(Ordering::Acquire) }

    /// Whether the connection was taken offline.
    #[must_use]
    pub fn is_offline(&self) -> bool { self.shared.offline.load(Ordering::Acquire) }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize { self.shared.pending.len() }

    /// Position in the owning pool's active set.
    pub(crate) fn slot(&self) -> usize { self.shared.slot.load(Ordering::Acquire) }

    pub(crate) fn set_slot(&self, slot: usize) { self.shared.slot.store(slot, Ordering::Release); }

    /// Whether both handles refer to the same actor.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool { Arc::ptr_eq(&self.shared, &other.shared) }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("service", &self.shared.service)
            .field("addr", &self.shared.addr)
            .field("active", &self.is_active())
            .field("slot", &self.slot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxedTransport;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn actor_over_a_boxed_transport_is_send() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let stream: BoxedTransport = Box::new(ours);
        let (conn, write_loop, read_loop) = BackendConnection::prepare(
            stream,
            "10.0.0.1:9000",
            "user",
            BackendOptions::default(),
            None,
        );
        let actor = conn.clone().run(write_loop, read_loop);
        assert_send(&actor);
        drop(actor);
        assert!(conn.is_active());
    }
}
