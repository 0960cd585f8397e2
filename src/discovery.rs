//! Service discovery.
//!
//! Backends announce themselves as endpoint nodes under
//! `/zk/product/{product}/services/{service}/{id}`; proxies watch those
//! nodes to learn where each service lives. The registry itself is reached
//! through the [`Discovery`] trait. [`MemoryDiscovery`] keeps the tree in
//! process for tests and stand-alone deployments.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

mod memory;
mod registration;

pub use memory::MemoryDiscovery;
pub use registration::Registration;

/// Product whose endpoints may be unix socket paths.
pub const TEST_PRODUCT: &str = "test";

/// Longest identity derived by [`service_identity`].
pub const MAX_IDENTITY_LEN: usize = 20;

/// Registry failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The path does not exist.
    #[error("no node at {0}")]
    NoNode(String),
    /// The node data is not a valid endpoint record.
    #[error("invalid endpoint data at {path}: {source}")]
    InvalidEndpoint {
        /// Path of the offending node.
        path: String,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The endpoint record could not be encoded.
    #[error("failed to encode endpoint: {0}")]
    Encode(#[source] serde_json::Error),
    /// The registry is unreachable.
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

/// What a watch fired for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Children of the watched path were added or removed.
    ChildrenChanged,
    /// Data of the watched node changed, or the node was deleted.
    DataChanged,
    /// The registry session was lost; ephemeral nodes are gone.
    SessionExpired,
}

/// One-shot notification returned alongside a watched read.
///
/// Resolves to the first [`WatchEvent`] after the read. A registry that
/// drops the watch without firing it resolves to
/// [`WatchEvent::SessionExpired`].
#[derive(Debug)]
pub struct WatchSignal(oneshot::Receiver<WatchEvent>);

impl WatchSignal {
    /// Create a signal and the sender that fires it.
    #[must_use]
    pub fn channel() -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }
}

impl Future for WatchSignal {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(WatchEvent::SessionExpired))
    }
}

/// Registry paths of one product.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    product: String,
    base: String,
}

impl Topology {
    /// Paths for `product`.
    #[must_use]
    pub fn new(product: impl Into<String>) -> Self {
        let product = product.into();
        let base = format!("/zk/product/{product}");
        Self { product, base }
    }

    /// Product name.
    #[must_use]
    pub fn product(&self) -> &str { &self.product }

    /// Root of the product's tree.
    #[must_use]
    pub fn base_path(&self) -> &str { &self.base }

    /// Parent of every service node.
    #[must_use]
    pub fn services_path(&self) -> String { format!("{}/services", self.base) }

    /// Node of one service.
    #[must_use]
    pub fn service_path(&self, service: &str) -> String { format!("{}/services/{service}", self.base) }

    /// Node of one endpoint of a service.
    #[must_use]
    pub fn endpoint_path(&self, service: &str, id: &str) -> String {
        format!("{}/services/{service}/{id}", self.base)
    }

    /// Prefix `path` with the product root unless it already has it.
    #[must_use]
    pub fn full_path(&self, path: &str) -> String {
        if path.starts_with(&self.base) {
            path.to_owned()
        } else {
            format!("{}{path}", self.base)
        }
    }

    /// Whether an endpoint advertising `frontend` can be dialed from this
    /// product. Unix socket paths are only accepted for the test product.
    #[must_use]
    pub fn accepts_frontend(&self, frontend: &str) -> bool {
        frontend.contains(':') || self.product == TEST_PRODUCT
    }
}

/// Endpoint record stored as JSON in each endpoint node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub service_id: String,
    pub frontend: String,
    pub deploy_path: String,
    pub code_url_version: String,
    pub hostname: String,
    pub start_time: String,
}

impl ServiceEndpoint {
    /// Record for this host, started now.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        service_id: impl Into<String>,
        frontend: impl Into<String>,
        deploy_path: impl Into<String>,
        code_url_version: impl Into<String>,
    ) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "Unknown".to_owned());
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default();
        Self {
            service: service.into(),
            service_id: service_id.into(),
            frontend: frontend.into(),
            deploy_path: deploy_path.into(),
            code_url_version: code_url_version.into(),
            hostname,
            start_time,
        }
    }

    /// Encode as the JSON stored in the registry.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, DiscoveryError> {
        serde_json::to_vec(self).map_err(DiscoveryError::Encode)
    }

    /// Decode the JSON stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidEndpoint`] for malformed data.
    pub fn from_json(path: &str, data: &[u8]) -> Result<Self, DiscoveryError> {
        serde_json::from_slice(data).map_err(|source| DiscoveryError::InvalidEndpoint {
            path: path.to_owned(),
            source,
        })
    }
}

/// Derive an endpoint id from a frontend address.
///
/// Dots and colons become underscores, slashes are dropped and only the
/// last [`MAX_IDENTITY_LEN`] characters are kept.
#[must_use]
pub fn service_identity(frontend: &str) -> String {
    let id: Vec<char> = frontend
        .chars()
        .filter(|&c| c != '/')
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    let skip = id.len().saturating_sub(MAX_IDENTITY_LEN);
    id[skip..].iter().collect()
}

/// A service registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Paths this registry serves.
    fn topology(&self) -> &Topology;

    /// Create `path` and its parents if missing. Existing data is kept.
    async fn create_path(&self, path: &str) -> Result<(), DiscoveryError>;

    /// Children of `path` plus a signal that fires on the next change.
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchSignal), DiscoveryError>;

    /// Data of `path` plus a signal that fires on the next change.
    async fn watch_node(&self, path: &str) -> Result<(Vec<u8>, WatchSignal), DiscoveryError>;

    /// Create the endpoint node, replacing any previous one. The node lives
    /// as long as the registry session.
    async fn register_endpoint(&self, endpoint: &ServiceEndpoint) -> Result<(), DiscoveryError>;

    /// Delete an endpoint node. Deleting a missing node succeeds.
    async fn delete_endpoint(&self, service: &str, id: &str) -> Result<(), DiscoveryError>;

    /// Read an endpoint record.
    async fn get_endpoint(&self, service: &str, id: &str) -> Result<ServiceEndpoint, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ServiceEndpoint, Topology, service_identity};

    #[rstest]
    #[case("127.0.0.1:5555", "127_0_0_1_5555")]
    #[case("10.100.200.123:45678", "10_100_200_123_45678")]
    #[case("/tmp/user.sock", "tmpuser_sock")]
    #[case("/usr/local/var/run/relayframe/user_service.sock", "ameuser_service_sock")]
    fn identity_from_address(#[case] frontend: &str, #[case] expected: &str) {
        assert_eq!(service_identity(frontend), expected);
    }

    #[test]
    fn topology_paths() {
        let topo = Topology::new("online");
        assert_eq!(topo.services_path(), "/zk/product/online/services");
        assert_eq!(topo.service_path("user"), "/zk/product/online/services/user");
        assert_eq!(
            topo.endpoint_path("user", "a_1"),
            "/zk/product/online/services/user/a_1"
        );
        assert_eq!(topo.full_path("/rpc_proxy"), "/zk/product/online/rpc_proxy");
        assert_eq!(
            topo.full_path("/zk/product/online/services"),
            "/zk/product/online/services"
        );
    }

    #[rstest]
    #[case("online", "10.0.0.1:9000", true)]
    #[case("online", "/tmp/user.sock", false)]
    #[case("test", "/tmp/user.sock", true)]
    fn frontend_acceptance(#[case] product: &str, #[case] frontend: &str, #[case] accepted: bool) {
        assert_eq!(Topology::new(product).accepts_frontend(frontend), accepted);
    }

    #[test]
    fn endpoint_json_uses_registry_field_names() {
        let endpoint = ServiceEndpoint::new("user", "id1", "10.0.0.1:9000", "/srv/user", "v1");
        let json: serde_json::Value = serde_json::from_slice(&endpoint.to_json().unwrap()).unwrap();
        for key in [
            "service",
            "service_id",
            "frontend",
            "deploy_path",
            "code_url_version",
            "hostname",
            "start_time",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        let back = ServiceEndpoint::from_json("/x", &endpoint.to_json().unwrap()).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn malformed_endpoint_data_is_rejected() {
        assert!(ServiceEndpoint::from_json("/x", b"not json").is_err());
    }
}
