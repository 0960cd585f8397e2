//! Proxy in front of every service of a product.
//!
//! Clients send ordered requests whose names carry the service, and the
//! [`Router`] forwards each one to a backend of that service discovered in
//! the registry.

use std::{future::Future, sync::Arc};

use futures::FutureExt;
use log::{error, info};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptLoopOptions, BackoffConfig, ServerError, accept_loop, bind};
use crate::{
    discovery::Discovery,
    dispatch::Dispatcher,
    router::{Router, RouterOptions},
    session::{self, SessionMode, SessionOptions},
    transport::BoxedTransport,
};

/// Settings of a proxy.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
    /// Address clients connect to.
    pub address: String,
    /// Options of the router and its backend connections.
    pub router: RouterOptions,
    /// Options of each client session. The mode is forced to ordered.
    pub session: SessionOptions,
    /// Back-off for the listener.
    pub backoff: BackoffConfig,
}

impl ProxyOptions {
    /// Defaults for a proxy listening on `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            router: RouterOptions::default(),
            session: SessionOptions::new(SessionMode::Ordered),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Run the proxy until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the listener cannot be bound.
pub async fn run(
    discovery: Arc<dyn Discovery>,
    options: ProxyOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServerError> {
    let listener = bind(&options.address).await?;
    let router = Router::start(discovery, options.router.clone());
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    info!("proxy started: address={}", options.address);

    let mut session_options = options.session.clone();
    session_options.mode = SessionMode::Ordered;
    session_options.shutdown = token.clone();
    let dispatcher: Arc<dyn Dispatcher> = Arc::clone(&router) as Arc<dyn Dispatcher>;
    let handler = move |stream: BoxedTransport, peer: String| {
        let dispatcher = Arc::clone(&dispatcher);
        let options = session_options.clone();
        async move {
            let _ = session::serve(stream, peer, dispatcher, options).await;
        }
        .boxed()
    };
    let accepting = tokio::spawn(accept_loop(
        listener,
        handler,
        AcceptLoopOptions {
            shutdown: token.clone(),
            tracker: tracker.clone(),
            backoff: options.backoff,
        },
    ));

    shutdown.await;
    info!("proxy stopping: address={}", options.address);
    token.cancel();
    if let Err(e) = accepting.await {
        error!("accept loop failed: error={e}");
    }
    tracker.close();
    tracker.wait().await;
    router.shutdown();
    info!("proxy stopped: address={}", options.address);
    Ok(())
}
