//! Keeping a backend's endpoint registered.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::{
    task::JoinHandle,
    time::{self, Duration},
};
use tokio_util::sync::CancellationToken;

use super::{Discovery, DiscoveryError, ServiceEndpoint, WatchEvent};

/// Pause before retrying a failed watch.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// A registered endpoint and the task that keeps it registered.
///
/// The endpoint node disappears with the registry session, so the task
/// watches the service node and registers the endpoint again whenever the
/// session expires.
pub struct Registration {
    discovery: Arc<dyn Discovery>,
    endpoint: ServiceEndpoint,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Registration {
    /// Replace any stale node for `endpoint` with a fresh one and keep it
    /// registered until [`Registration::deregister`].
    ///
    /// # Errors
    ///
    /// Returns the registry error if the first registration fails.
    pub async fn register(
        discovery: Arc<dyn Discovery>,
        endpoint: ServiceEndpoint,
    ) -> Result<Self, DiscoveryError> {
        refresh(discovery.as_ref(), &endpoint).await?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(keep_registered(
            Arc::clone(&discovery),
            endpoint.clone(),
            shutdown.clone(),
        ));
        Ok(Self {
            discovery,
            endpoint,
            shutdown,
            task,
        })
    }

    /// The registered record.
    #[must_use]
    pub fn endpoint(&self) -> &ServiceEndpoint { &self.endpoint }

    /// Stop re-registering and delete the endpoint node.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the node cannot be deleted.
    pub async fn deregister(self) -> Result<(), DiscoveryError> {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("registration task failed: error={e}");
        }
        self.discovery
            .delete_endpoint(&self.endpoint.service, &self.endpoint.service_id)
            .await?;
        info!(
            "endpoint deregistered: service={}, id={}",
            self.endpoint.service, self.endpoint.service_id
        );
        Ok(())
    }
}

async fn refresh(discovery: &dyn Discovery, endpoint: &ServiceEndpoint) -> Result<(), DiscoveryError> {
    discovery
        .delete_endpoint(&endpoint.service, &endpoint.service_id)
        .await?;
    discovery.register_endpoint(endpoint).await
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus operations internally"
)]
async fn keep_registered(
    discovery: Arc<dyn Discovery>,
    endpoint: ServiceEndpoint,
    shutdown: CancellationToken,
) {
    let service_path = discovery.topology().service_path(&endpoint.service);
    loop {
        match discovery.watch_node(&service_path).await {
            Ok((_, signal)) => {
                let event = tokio::select! {
                    biased;

                    () = shutdown.cancelled() => return,
                    event = signal => event,
                };
                if event != WatchEvent::SessionExpired {
                    continue;
                }
                warn!(
                    "registry session expired, registering again: service={}, id={}",
                    endpoint.service, endpoint.service_id
                );
                if let Err(e) = refresh(discovery.as_ref(), &endpoint).await {
                    error!(
                        "endpoint registration failed: service={}, error={e}",
                        endpoint.service
                    );
                }
            }
            Err(e) => {
                error!(
                    "watch on service failed, retrying: path={service_path}, retry_in={RETRY_DELAY:?}, error={e}"
                );
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => return,
                    () = time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::{self, Duration};

    use super::Registration;
    use crate::discovery::{Discovery, MemoryDiscovery, ServiceEndpoint, Topology};

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::new("user", "10_0_0_1_9000", "10.0.0.1:9000", "/srv", "v1")
    }

    #[tokio::test]
    async fn endpoint_returns_after_session_expiry() {
        let registry = Arc::new(MemoryDiscovery::new(Topology::new("online")));
        let registration = Registration::register(registry.clone(), endpoint()).await.unwrap();
        let path = registry.topology().endpoint_path("user", "10_0_0_1_9000");
        assert!(registry.exists(&path));

        time::sleep(Duration::from_millis(20)).await;
        registry.expire_session();
        time::timeout(Duration::from_secs(1), async {
            while !registry.exists(&path) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        registration.deregister().await.unwrap();
        assert!(!registry.exists(&path));
    }
}
