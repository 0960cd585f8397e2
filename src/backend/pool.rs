//! Round-robin selection over the active connections of one service.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    BackendOptions,
    connection::{BackendConnection, NO_SLOT, StateListener},
};
use crate::{
    activity::ActivityClock,
    dispatch::Dispatcher,
    error::ProxyError,
    message::{self, MessageType},
    request::{Completion, InFlight, Request},
    transport::Transport,
};

/// Module named in exceptions raised by the pool itself.
pub const POOL_MODULE: &str = "BackendPool";

/// Period of the pool's report log line.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Connections that currently accept work.
///
/// Kept compact: every connection's slot is its index, so removal swaps
/// the last connection into the hole. Connections before `cursor` were
/// already visited this cycle.
#[derive(Default)]
struct ActiveSet {
    conns: Vec<BackendConnection>,
    cursor: usize,
}

impl ActiveSet {
    fn insert(&mut self, conn: &BackendConnection) -> bool {
        if conn.slot() != NO_SLOT {
            return false;
        }
        conn.set_slot(self.conns.len());
        self.conns.push(conn.clone());
        true
    }

    fn remove(&mut self, conn: &BackendConnection) -> bool {
        let mut slot = conn.slot();
        if self.conns.get(slot).is_none_or(|held| !held.same_as(conn)) {
            return false;
        }
        // A visited connection first trades places with the last visited
        // one, so the swap below only moves an unvisited connection into an
        // unvisited slot.
        if slot < self.cursor {
            self.cursor -= 1;
            self.conns.swap(slot, self.cursor);
            if let Some(kept) = self.conns.get(slot) {
                kept.set_slot(slot);
            }
            slot = self.cursor;
        }
        self.conns.swap_remove(slot);
        if let Some(moved) = self.conns.get(slot) {
            moved.set_slot(slot);
        }
        conn.set_slot(NO_SLOT);
        true
    }

    fn next(&mut self) -> Option<BackendConnection> {
        if self.conns.is_empty() {
            return None;
        }
        if self.cursor >= self.conns.len() {
            self.cursor = 0;
        }
        let conn = self.conns[self.cursor].clone();
        self.cursor += 1;
        Some(conn)
    }
}

/// The active backend connections of one service.
pub struct BackendPool {
    service: String,
    active: Mutex<ActiveSet>,
    clock: ActivityClock,
    verbose: bool,
}

impl BackendPool {
    /// Create an empty pool for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>, verbose: bool) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            active: Mutex::new(ActiveSet::default()),
            clock: ActivityClock::new(),
            verbose,
        })
    }

    /// Logical service served by the pool.
    #[must_use]
    pub fn service(&self) -> &str { &self.service }

    fn lock(&self) -> MutexGuard<'_, ActiveSet> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listener that keeps this pool's active set in step with a
    /// connection. It holds the pool weakly.
    #[must_use]
    pub fn listener(self: &Arc<Self>) -> StateListener {
        let pool: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |conn: &BackendConnection| {
            if let Some(pool) = pool.upgrade() {
                pool.state_changed(conn);
            }
        })
    }

    /// Start a connection over `stream` that reports to this pool.
    pub fn attach<T: Transport>(
        self: &Arc<Self>,
        stream: T,
        addr: impl Into<String>,
        options: BackendOptions,
    ) -> (BackendConnection, JoinHandle<Result<(), ProxyError>>) {
        BackendConnection::spawn(stream, addr, self.service.clone(), options, Some(self.listener()))
    }

    /// Bring the active set in line with `conn`'s state: an active
    /// connection is appended unless already present, an inactive one is
    /// removed.
    pub fn state_changed(&self, conn: &BackendConnection) {
        let mut set = self.lock();
        if conn.is_active() {
            if set.insert(conn) {
                info!(
                    "backend joined pool: service={}, addr={}, workers={}",
                    self.service,
                    conn.addr(),
                    set.conns.len()
                );
            }
        } else if set.remove(conn) {
            info!(
                "backend left pool: service={}, addr={}, workers={}",
                self.service,
                conn.addr(),
                set.conns.len()
            );
        }
    }

    /// Next connection in round-robin order.
    #[must_use]
    pub fn next_connection(&self) -> Option<BackendConnection> {
        let mut set = self.lock();
        let conn = set.next();
        if self.verbose {
            debug!(
                "pool selection: service={}, workers={}, cursor={}",
                self.service,
                set.conns.len(),
                set.cursor
            );
        }
        conn
    }

    /// Number of connections accepting work.
    #[must_use]
    pub fn active_count(&self) -> usize { self.lock().conns.len() }

    /// Snapshot of the connections accepting work, in slot order.
    #[must_use]
    pub fn connections(&self) -> Vec<BackendConnection> { self.lock().conns.clone() }

    /// Clock of the last request dispatched through the pool.
    #[must_use]
    pub fn clock(&self) -> &ActivityClock { &self.clock }

    /// Wait until nothing was dispatched for `grace`, then take every
    /// active connection offline.
    pub async fn stop(&self, grace: Duration) {
        self.clock.wait_idle(grace).await;
        let conns = self.connections();
        for conn in &conns {
            conn.mark_offline();
        }
        info!(
            "pool stopped: service={}, connections={}",
            self.service,
            conns.len()
        );
    }

    /// Log the pool size every [`REPORT_INTERVAL`] until `shutdown`.
    pub fn spawn_reporter(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        info!(
                            "pool report: service={}, workers={}, open_backends={}",
                            pool.service,
                            pool.active_count(),
                            super::open_backend_count()
                        );
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Dispatcher for BackendPool {
    async fn dispatch(&self, mut request: Request) -> Completion {
        self.clock.touch();
        request.set_service(&self.service);
        let Some(conn) = self.next_connection() else {
            if self.verbose {
                warn!(
                    "no backend available: service={}, method={}",
                    self.service,
                    request.method()
                );
            }
            let frame = message::worker_not_found(
                POOL_MODULE,
                &self.service,
                request.method(),
                request.seq_id(),
            );
            request.respond_with(frame, MessageType::Exception);
            return Completion::ready(request);
        };
        let (in_flight, completion) = InFlight::new(request);
        conn.push_back(in_flight).await;
        completion
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::{fixture, rstest};
    use tokio::io::DuplexStream;

    use super::BackendPool;
    use crate::{
        backend::{BackendConnection, BackendOptions},
        buffer_pool::PooledBuf,
        dispatch::Dispatcher,
        message::{MessageType, decode_header, encode_message_begin},
        request::Request,
    };

    #[fixture]
    fn pool() -> Arc<BackendPool> { BackendPool::new("user", false) }

    fn attach(pool: &Arc<BackendPool>, n: usize) -> (Vec<BackendConnection>, Vec<DuplexStream>) {
        (0..n)
            .map(|i| {
                let (ours, theirs) = tokio::io::duplex(1024);
                let (conn, _) = pool.attach(ours, format!("10.0.0.{i}:9000"), BackendOptions::default());
                (conn, theirs)
            })
            .unzip()
    }

    fn request(name: &str) -> Request {
        let mut frame = Vec::new();
        encode_message_begin(&mut frame, name, MessageType::Call, 42);
        Request::from_frame(PooledBuf::from(frame), false).unwrap()
    }

    fn pick(pool: &BackendPool, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| pool.next_connection().unwrap().addr().to_owned())
            .collect()
    }

    fn addrs<'a>(conns: impl IntoIterator<Item = &'a BackendConnection>) -> Vec<String> {
        conns.into_iter().map(|c| c.addr().to_owned()).collect()
    }

    #[rstest]
    #[tokio::test]
    async fn round_robin_repeats_the_same_rotation(pool: Arc<BackendPool>) {
        let (conns, _peers) = attach(&pool, 3);
        assert_eq!(pool.active_count(), 3);

        let first = pick(&pool, 3);
        let second = pick(&pool, 3);
        assert_eq!(first, addrs(&conns));
        assert_eq!(second, first);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[tokio::test]
    async fn removal_mid_cycle_neither_skips_nor_repeats(
        pool: Arc<BackendPool>,
        #[case] removed: usize,
    ) {
        let (conns, _peers) = attach(&pool, 4);
        let visited = pick(&pool, 2);
        conns[removed].mark_offline();

        let survivors: Vec<String> = addrs(conns.iter().filter(|c| !c.same_as(&conns[removed])));
        let mut unvisited: Vec<String> = survivors
            .iter()
            .filter(|a| !visited.contains(a))
            .cloned()
            .collect();
        let mut rest = pick(&pool, unvisited.len());
        rest.sort();
        unvisited.sort();
        assert_eq!(rest, unvisited);

        let mut cycle = pick(&pool, survivors.len());
        cycle.sort();
        assert_eq!(cycle, survivors);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[tokio::test]
    async fn removal_keeps_slots_valid(pool: Arc<BackendPool>, #[case] removed: usize) {
        let (conns, _peers) = attach(&pool, 4);
        conns[removed].mark_offline();

        let remaining = pool.connections();
        assert_eq!(remaining.len(), 3);
        for (index, conn) in remaining.iter().enumerate() {
            assert_eq!(conn.slot(), index);
            assert!(!conn.same_as(&conns[removed]));
        }
        assert_eq!(conns[removed].slot(), super::NO_SLOT);
    }

    #[rstest]
    #[tokio::test]
    async fn empty_pool_answers_worker_not_found(pool: Arc<BackendPool>) {
        let answered = pool.call(request("get")).await.unwrap();
        let data = answered.response_data().unwrap();
        let header = decode_header(data).unwrap();
        assert_eq!(header.message_type, MessageType::Exception);
        assert_eq!(header.name, "get");
        assert_eq!(header.seq_id, 42);
        let text = String::from_utf8_lossy(data);
        assert!(text.contains("user.get Not Found"), "{text}");
    }
}
