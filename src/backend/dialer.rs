//! Outbound connections to a discovered backend endpoint.
//!
//! An [`EndpointDialer`] keeps one connection to its address alive until it
//! is taken offline. Failed dials are retried with a short backoff; a
//! connection that ends with an error is redialed at once. A connection
//! that drains after [`EndpointDialer::mark_offline`] ends the dialer.

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};

use log::{error, info, warn};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use super::{BackendConnection, BackendOptions, BackendPool};
use crate::{
    seq_id::SeqIdAllocator,
    server::BackoffConfig,
    transport::{self, BoxedTransport},
};

/// Time allowed for a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pauses between failed connect attempts: 1s, 2s, then 4s.
pub const DIAL_BACKOFF: BackoffConfig = BackoffConfig {
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(4),
};

/// Keeps a connection to one endpoint attached to a pool.
pub struct EndpointDialer {
    addr: String,
    offline: CancellationToken,
    current: Mutex<Option<BackendConnection>>,
}

impl EndpointDialer {
    /// Start dialing `addr` and attach every established connection to
    /// `pool`.
    ///
    /// The dialer reserves one sequence-id range from `allocator` and uses
    /// it for all of its connections.
    pub fn start(
        addr: impl Into<String>,
        pool: Arc<BackendPool>,
        mut options: BackendOptions,
        allocator: &SeqIdAllocator,
    ) -> Arc<Self> {
        options.seq_ids = allocator.allocate();
        let dialer = Arc::new(Self {
            addr: addr.into(),
            offline: CancellationToken::new(),
            current: Mutex::new(None),
        });
        info!(
            "endpoint dialer started: service={}, addr={}, seq_ids={:?}",
            pool.service(),
            dialer.addr,
            options.seq_ids
        );
        tokio::spawn(Arc::clone(&dialer).run(pool, options));
        dialer
    }

    /// Address being dialed.
    #[must_use]
    pub fn addr(&self) -> &str { &self.addr }

    /// Whether the dialer was taken offline.
    #[must_use]
    pub fn is_offline(&self) -> bool { self.offline.is_cancelled() }

    /// The current connection, if one is established.
    #[must_use]
    pub fn connection(&self) -> Option<BackendConnection> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop redialing and take the current connection offline.
    pub fn mark_offline(&self) {
        if self.offline.is_cancelled() {
            return;
        }
        self.offline.cancel();
        if let Some(conn) = self.connection() {
            conn.mark_offline();
        }
    }

    async fn run(self: Arc<Self>, pool: Arc<BackendPool>, options: BackendOptions) {
        while let Some(stream) = self.dial(pool.service()).await {
            let (conn, handle) = pool.attach(stream, self.addr.clone(), options.clone());
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.clone());
            if self.offline.is_cancelled() {
                conn.mark_offline();
            }
            match handle.await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => warn!(
                    "backend connection lost, redialing: service={}, addr={}, error={e}",
                    pool.service(),
                    self.addr
                ),
                Err(e) => {
                    error!(
                        "backend connection task failed: service={}, addr={}, error={e}",
                        pool.service(),
                        self.addr
                    );
                    break;
                }
            }
        }
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(
            "endpoint dialer stopped: service={}, addr={}",
            pool.service(),
            self.addr
        );
    }

    /// Connect, backing off per [`DIAL_BACKOFF`] between failures. Returns
    /// `None` once the dialer is taken offline.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn dial(&self, service: &str) -> Option<BoxedTransport> {
        let mut backoff = DIAL_BACKOFF.initial_delay;
        loop {
            let attempt = tokio::select! {
                biased;

                () = self.offline.cancelled() => return None,
                res = time::timeout(CONNECT_TIMEOUT, transport::connect(&self.addr)) => {
                    res.unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
                }
            };
            match attempt {
                Ok(stream) => {
                    info!("backend dialed: service={service}, addr={}", self.addr);
                    return Some(stream);
                }
                Err(e) => error!(
                    "backend dial failed: service={service}, addr={}, retry_in={backoff:?}, error={e}",
                    self.addr
                ),
            }
            tokio::select! {
                biased;

                () = self.offline.cancelled() => return None,
                () = time::sleep(backoff) => {}
            }
            backoff = DIAL_BACKOFF.next(backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        net::TcpListener,
        time::{self, Duration},
    };

    use super::{DIAL_BACKOFF, EndpointDialer};
    use crate::{
        backend::{BackendOptions, BackendPool},
        seq_id::SeqIdAllocator,
    };

    async fn wait_for(pool: &BackendPool, count: usize) {
        time::timeout(Duration::from_secs(5), async {
            while pool.active_count() != count {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn redial_delays_double_up_to_four_seconds() {
        let delays: Vec<_> = std::iter::successors(Some(DIAL_BACKOFF.initial_delay), |d| {
            Some(DIAL_BACKOFF.next(*d))
        })
        .take(5)
        .map(|d| d.as_secs())
        .collect();
        assert_eq!(delays, [1, 2, 4, 4, 4]);
    }

    #[tokio::test]
    async fn dialed_connection_joins_and_leaves_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = BackendPool::new("user", false);
        let allocator = SeqIdAllocator::new();

        let dialer = EndpointDialer::start(
            addr.clone(),
            Arc::clone(&pool),
            BackendOptions::default(),
            &allocator,
        );
        let (_socket, _) = listener.accept().await.unwrap();
        wait_for(&pool, 1).await;
        assert_eq!(dialer.connection().unwrap().addr(), addr);

        dialer.mark_offline();
        assert!(dialer.is_offline());
        wait_for(&pool, 0).await;
    }

    #[tokio::test]
    async fn dropped_connection_is_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = BackendPool::new("user", false);
        let allocator = SeqIdAllocator::new();

        let dialer = EndpointDialer::start(addr, Arc::clone(&pool), BackendOptions::default(), &allocator);
        let (first, _) = listener.accept().await.unwrap();
        wait_for(&pool, 1).await;
        drop(first);

        let (_second, _) = time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_for(&pool, 1).await;
        dialer.mark_offline();
    }
}
