//! Routing requests to the backends of their service.
//!
//! The [`Router`] watches the product's services node. Each service found
//! there gets a [`ServiceRoute`] that watches the service's endpoints and
//! keeps one [`EndpointDialer`](crate::backend::EndpointDialer) per
//! reachable address attached to the service's pool. Services that vanish
//! from the registry are stopped once their traffic has died down.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

mod route;

pub use route::ServiceRoute;

use crate::{
    backend::{BackendOptions, BackendPool},
    discovery::Discovery,
    dispatch::Dispatcher,
    message::{self, MessageType},
    request::{Completion, Request},
    seq_id::SeqIdAllocator,
};

/// Quiet period a removed service waits for before its connections are
/// taken offline.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Pause before retrying a failed registry watch.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Settings shared by every route.
#[derive(Clone, Debug)]
pub struct RouterOptions {
    /// Options for each backend connection.
    pub backend: BackendOptions,
    /// Quiet period before a removed service is stopped.
    pub stop_grace: Duration,
    /// Pause before retrying a failed watch.
    pub retry_delay: Duration,
    /// Log per-request detail.
    pub verbose: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            retry_delay: DEFAULT_RETRY_DELAY,
            verbose: false,
        }
    }
}

/// Dispatches requests by service name.
pub struct Router {
    discovery: Arc<dyn Discovery>,
    routes: DashMap<String, Arc<ServiceRoute>>,
    allocator: Arc<SeqIdAllocator>,
    options: RouterOptions,
    shutdown: CancellationToken,
}

impl Router {
    /// Start watching the services of `discovery`'s product.
    pub fn start(discovery: Arc<dyn Discovery>, options: RouterOptions) -> Arc<Self> {
        let router = Arc::new(Self {
            discovery,
            routes: DashMap::new(),
            allocator: Arc::new(SeqIdAllocator::new()),
            options,
            shutdown: CancellationToken::new(),
        });
        info!(
            "router started: product={}",
            router.discovery.topology().product()
        );
        tokio::spawn(Arc::clone(&router).watch_services());
        router
    }

    /// Pool of `service`, if the service is known.
    #[must_use]
    pub fn pool(&self, service: &str) -> Option<Arc<BackendPool>> {
        self.routes.get(service).map(|route| Arc::clone(route.pool()))
    }

    /// Names of the known services.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop watching and take every backend offline at once.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for route in self.routes.iter() {
            route.close();
        }
        self.routes.clear();
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn watch_services(self: Arc<Self>) {
        let path = self.discovery.topology().services_path();
        if let Err(e) = self.discovery.create_path(&path).await {
            error!("services path not created: path={path}, error={e}");
        }
        loop {
            match self.discovery.watch_children(&path).await {
                Ok((names, signal)) => {
                    self.reconcile(&names);
                    tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => break,
                        _ = signal => {}
                    }
                }
                Err(e) => {
                    error!(
                        "services watch failed: path={path}, retry_in={:?}, error={e}",
                        self.options.retry_delay
                    );
                    tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => break,
                        () = time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }
        info!("router stopped watching services: path={path}");
    }

    fn reconcile(&self, names: &[String]) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        for name in &wanted {
            if !self.routes.contains_key(*name) {
                info!("service found: service={name}");
                let route = ServiceRoute::start(
                    Arc::clone(&self.discovery),
                    (*name).to_owned(),
                    self.options.clone(),
                    Arc::clone(&self.allocator),
                );
                self.routes.insert((*name).to_owned(), route);
            }
        }
        let gone: Vec<String> = self
            .routes
            .iter()
            .filter(|e| !wanted.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for name in gone {
            if let Some((_, route)) = self.routes.remove(&name) {
                warn!("service removed: service={name}");
                let grace = self.options.stop_grace;
                tokio::spawn(async move { route.stop(grace).await });
            }
        }
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, mut request: Request) -> Completion {
        let pool = self.pool(request.service());
        match pool {
            Some(pool) => pool.dispatch(request).await,
            None => {
                info!(
                    "service not found: service={}, method={}",
                    request.service(),
                    request.method()
                );
                let frame =
                    message::service_not_found(request.service(), request.method(), request.seq_id());
                request.respond_with(frame, MessageType::Exception);
                Completion::ready(request)
            }
        }
    }
}
