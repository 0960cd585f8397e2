//! Load balancer in front of the workers of one service.
//!
//! Workers connect to the backend listener and each connection joins the
//! service's [`BackendPool`]. Clients connect to the frontend and are
//! served by pipelined sessions dispatching into that pool. Once a worker
//! is available the frontend is registered in the registry; on shutdown
//! the registration is removed first and traffic allowed to die down
//! before the workers are released.

use std::{future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use log::{error, info, warn};
use tokio::time::{self, Duration};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptLoopOptions, BackoffConfig, ServerError, accept_loop, bind};
use crate::{
    backend::{BackendOptions, BackendPool},
    discovery::{Discovery, Registration, ServiceEndpoint, service_identity},
    dispatch::Dispatcher,
    session::{self, SessionMode, SessionOptions},
    transport::BoxedTransport,
};

/// Wait between a worker becoming available and registration.
pub const DEFAULT_REGISTER_DELAY: Duration = Duration::from_secs(5);

/// Quiet period required before the workers are released on shutdown.
pub const DEFAULT_EXIT_IDLE: Duration = Duration::from_secs(5);

const WORKER_POLL: Duration = Duration::from_secs(1);

/// Settings of a load balancer.
#[derive(Clone, Debug)]
pub struct LbOptions {
    /// Service the workers implement.
    pub service: String,
    /// Address clients connect to, and the address registered.
    pub frontend: String,
    /// Address workers connect to.
    pub backend_addr: String,
    /// Options of each worker connection.
    pub backend: BackendOptions,
    /// Options of each client session. The mode is forced to pipelined.
    pub session: SessionOptions,
    /// Wait between the first worker and registration.
    pub register_delay: Duration,
    /// Quiet period before workers are released on shutdown.
    pub exit_idle: Duration,
    /// Recorded in the registry entry.
    pub deploy_path: String,
    /// Recorded in the registry entry.
    pub code_url_version: String,
    /// Back-off for both listeners.
    pub backoff: BackoffConfig,
}

impl LbOptions {
    /// Defaults for `service` served on `frontend` with workers on
    /// `backend_addr`.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        frontend: impl Into<String>,
        backend_addr: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            frontend: frontend.into(),
            backend_addr: backend_addr.into(),
            backend: BackendOptions::default(),
            session: SessionOptions::new(SessionMode::Pipelined),
            register_delay: DEFAULT_REGISTER_DELAY,
            exit_idle: DEFAULT_EXIT_IDLE,
            deploy_path: String::new(),
            code_url_version: String::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Run the load balancer until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if either listener cannot be bound.
pub async fn run(
    discovery: Arc<dyn Discovery>,
    options: LbOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServerError> {
    let backends = bind(&options.backend_addr).await?;
    let frontend = bind(&options.frontend).await?;
    let pool = BackendPool::new(options.service.clone(), options.session.verbose);
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    pool.spawn_reporter(token.clone());
    info!(
        "load balancer started: service={}, frontend={}, backend={}",
        options.service, options.frontend, options.backend_addr
    );

    let accept_options = AcceptLoopOptions {
        shutdown: token.clone(),
        tracker: tracker.clone(),
        backoff: options.backoff,
    };
    let worker_loop = tokio::spawn(accept_loop(
        backends,
        attach_worker(Arc::clone(&pool), options.backend.clone()),
        accept_options.clone(),
    ));

    let mut session_options = options.session.clone();
    session_options.mode = SessionMode::Pipelined;
    session_options.clock = pool.clock().clone();
    session_options.shutdown = token.clone();
    let client_loop = tokio::spawn(accept_loop(
        frontend,
        serve_client(Arc::clone(&pool) as Arc<dyn Dispatcher>, session_options),
        accept_options,
    ));

    let registration = register_when_ready(&discovery, &pool, &options, shutdown).await;
    if let Some(registration) = registration
        && let Err(e) = registration.deregister().await
    {
        error!("deregistration failed: service={}, error={e}", options.service);
    }

    info!(
        "load balancer stopping: service={}, exit_idle={:?}",
        options.service, options.exit_idle
    );
    pool.stop(options.exit_idle).await;
    token.cancel();
    for handle in [worker_loop, client_loop] {
        if let Err(e) = handle.await {
            error!("accept loop failed: error={e}");
        }
    }
    tracker.close();
    tracker.wait().await;
    info!("load balancer stopped: service={}", options.service);
    Ok(())
}

fn attach_worker(
    pool: Arc<BackendPool>,
    options: BackendOptions,
) -> impl Fn(BoxedTransport, String) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |stream, peer| {
        let (conn, handle) = pool.attach(stream, peer, options.clone());
        async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => info!(
                    "worker connection ended: addr={}, error={e}",
                    conn.addr()
                ),
                Err(e) => error!("worker connection task failed: addr={}, error={e}", conn.addr()),
            }
        }
        .boxed()
    }
}

fn serve_client(
    dispatcher: Arc<dyn Dispatcher>,
    options: SessionOptions,
) -> impl Fn(BoxedTransport, String) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |stream, peer| {
        let dispatcher = Arc::clone(&dispatcher);
        let options = options.clone();
        async move {
            // Failures are logged by the session itself.
            let _ = session::serve(stream, peer, dispatcher, options).await;
        }
        .boxed()
    }
}

/// Register the frontend once a worker has been available for
/// `register_delay`, then hold the registration until `shutdown`.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus operations internally"
)]
async fn register_when_ready(
    discovery: &Arc<dyn Discovery>,
    pool: &BackendPool,
    options: &LbOptions,
    shutdown: impl Future<Output = ()>,
) -> Option<Registration> {
    tokio::pin!(shutdown);
    while pool.active_count() == 0 {
        tokio::select! {
            biased;

            () = &mut shutdown => return None,
            () = time::sleep(WORKER_POLL) => {}
        }
    }
    info!(
        "worker available, registering in {:?}: service={}",
        options.register_delay, options.service
    );
    tokio::select! {
        biased;

        () = &mut shutdown => return None,
        () = time::sleep(options.register_delay) => {}
    }

    let endpoint = ServiceEndpoint::new(
        options.service.clone(),
        service_identity(&options.frontend),
        options.frontend.clone(),
        options.deploy_path.clone(),
        options.code_url_version.clone(),
    );
    let registration = match Registration::register(Arc::clone(discovery), endpoint).await {
        Ok(registration) => Some(registration),
        Err(e) => {
            warn!(
                "registration failed, serving unregistered: service={}, error={e}",
                options.service
            );
            None
        }
    };
    shutdown.await;
    registration
}
