//! Endpoints of one service.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use log::{error, info, warn};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use super::RouterOptions;
use crate::{
    backend::{BackendPool, EndpointDialer},
    discovery::Discovery,
    seq_id::SeqIdAllocator,
};

/// The pool of one service and the dialers feeding it.
pub struct ServiceRoute {
    service: String,
    pool: Arc<BackendPool>,
    dialers: Mutex<HashMap<String, Arc<EndpointDialer>>>,
    stopped: CancellationToken,
}

impl ServiceRoute {
    /// Start watching the endpoints of `service`.
    pub fn start(
        discovery: Arc<dyn Discovery>,
        service: String,
        options: RouterOptions,
        allocator: Arc<SeqIdAllocator>,
    ) -> Arc<Self> {
        let route = Arc::new(Self {
            pool: BackendPool::new(service.clone(), options.verbose),
            service,
            dialers: Mutex::new(HashMap::new()),
            stopped: CancellationToken::new(),
        });
        route.pool.spawn_reporter(route.stopped.clone());
        tokio::spawn(Arc::clone(&route).watch_endpoints(discovery, options, allocator));
        route
    }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str { &self.service }

    /// Pool requests for the service are dispatched to.
    #[must_use]
    pub fn pool(&self) -> &Arc<BackendPool> { &self.pool }

    /// Addresses currently dialed.
    #[must_use]
    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<EndpointDialer>>> {
        self.dialers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop watching, wait for `grace` without requests, then take every
    /// backend offline.
    pub async fn stop(&self, grace: Duration) {
        self.stopped.cancel();
        self.pool.stop(grace).await;
        self.close();
    }

    /// Stop watching and take every backend offline now.
    pub fn close(&self) {
        self.stopped.cancel();
        let dialers: Vec<_> = self.lock().drain().map(|(_, d)| d).collect();
        for dialer in dialers {
            dialer.mark_offline();
        }
        info!("service route closed: service={}", self.service);
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn watch_endpoints(
        self: Arc<Self>,
        discovery: Arc<dyn Discovery>,
        options: RouterOptions,
        allocator: Arc<SeqIdAllocator>,
    ) {
        let path = discovery.topology().service_path(&self.service);
        loop {
            match discovery.watch_children(&path).await {
                Ok((ids, signal)) => {
                    let addrs = self.resolve(discovery.as_ref(), &ids).await;
                    self.reconcile(&addrs, &options, &allocator);
                    tokio::select! {
                        biased;

                        () = self.stopped.cancelled() => break,
                        _ = signal => {}
                    }
                }
                Err(e) => {
                    error!(
                        "endpoint watch failed: path={path}, retry_in={:?}, error={e}",
                        options.retry_delay
                    );
                    tokio::select! {
                        biased;

                        () = self.stopped.cancelled() => break,
                        () = time::sleep(options.retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn resolve(&self, discovery: &dyn Discovery, ids: &[String]) -> HashSet<String> {
        let topology = discovery.topology();
        let mut addrs = HashSet::with_capacity(ids.len());
        for id in ids {
            match discovery.get_endpoint(&self.service, id).await {
                Ok(endpoint) if topology.accepts_frontend(&endpoint.frontend) => {
                    info!(
                        "endpoint found: service={}, id={id}, frontend={}",
                        self.service, endpoint.frontend
                    );
                    addrs.insert(endpoint.frontend);
                }
                Ok(endpoint) => warn!(
                    "endpoint ignored, unix socket outside test product: service={}, frontend={}",
                    self.service, endpoint.frontend
                ),
                Err(e) => error!(
                    "endpoint read failed: service={}, id={id}, error={e}",
                    self.service
                ),
            }
        }
        addrs
    }

    fn reconcile(&self, addrs: &HashSet<String>, options: &RouterOptions, allocator: &SeqIdAllocator) {
        if self.stopped.is_cancelled() {
            return;
        }
        let mut dialers = self.lock();
        for addr in addrs {
            if dialers.get(addr).is_some_and(|d| !d.is_offline()) {
                continue;
            }
            let dialer = EndpointDialer::start(
                addr.clone(),
                Arc::clone(&self.pool),
                options.backend.clone(),
                allocator,
            );
            dialers.insert(addr.clone(), dialer);
        }
        dialers.retain(|addr, dialer| {
            let keep = addrs.contains(addr);
            if !keep {
                info!(
                    "endpoint removed: service={}, addr={addr}",
                    self.service
                );
                dialer.mark_offline();
            }
            keep
        });
    }
}
