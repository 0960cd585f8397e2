//! In-process registry tree.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::oneshot;

use super::{
    Discovery,
    DiscoveryError,
    ServiceEndpoint,
    Topology,
    WatchEvent,
    WatchSignal,
    service_identity,
};

type Watches = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

struct Node {
    data: Vec<u8>,
    ephemeral: bool,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: Watches,
    node_watches: Watches,
}

fn parent(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

fn fire(watches: &mut Watches, path: &str, event: WatchEvent) {
    for tx in watches.remove(path).unwrap_or_default() {
        let _ = tx.send(event);
    }
}

impl Tree {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn ensure_parents(&mut self, path: &str) {
        let Some(parent) = parent(path) else { return };
        if self.nodes.contains_key(parent) {
            return;
        }
        self.ensure_parents(parent);
        self.insert_new(parent.to_owned(), Vec::new(), false);
    }

    fn insert_new(&mut self, path: String, data: Vec<u8>, ephemeral: bool) {
        if let Some(parent) = parent(&path) {
            fire(&mut self.child_watches, parent, WatchEvent::ChildrenChanged);
        }
        self.nodes.insert(path, Node { data, ephemeral });
    }

    fn remove(&mut self, path: &str) -> bool {
        if !self.nodes.contains_key(path) {
            return false;
        }
        let prefix = format!("{path}/");
        let doomed: Vec<String> = std::iter::once(path.to_owned())
            .chain(
                self.nodes
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, _)| key.clone()),
            )
            .collect();
        for key in &doomed {
            self.nodes.remove(key);
            fire(&mut self.node_watches, key, WatchEvent::DataChanged);
            fire(&mut self.child_watches, key, WatchEvent::ChildrenChanged);
        }
        if let Some(parent) = parent(path) {
            fire(&mut self.child_watches, parent, WatchEvent::ChildrenChanged);
        }
        true
    }
}

/// Registry kept in memory.
///
/// Behaves like a coordination service tree: nodes have data, watches are
/// one-shot, ephemeral nodes disappear when the session expires. Static
/// endpoints can be seeded from configuration.
pub struct MemoryDiscovery {
    topology: Topology,
    tree: Mutex<Tree>,
}

impl MemoryDiscovery {
    /// Empty registry for `topology`.
    #[must_use]
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            tree: Mutex::new(Tree::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> { self.tree.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Create or overwrite the node at `path`, creating missing parents.
    pub fn create(&self, path: &str, data: Vec<u8>, ephemeral: bool) {
        let mut tree = self.lock();
        tree.ensure_parents(path);
        if let Some(node) = tree.nodes.get_mut(path) {
            node.data = data;
            node.ephemeral = ephemeral;
            fire(&mut tree.node_watches, path, WatchEvent::DataChanged);
        } else {
            tree.insert_new(path.to_owned(), data, ephemeral);
        }
    }

    /// Delete `path` and everything below it. Returns whether anything was
    /// deleted.
    pub fn delete(&self, path: &str) -> bool { self.lock().remove(path) }

    /// Whether a node exists at `path`.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool { self.lock().nodes.contains_key(path) }

    /// Children of `path`, if it exists.
    #[must_use]
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        let tree = self.lock();
        tree.nodes.contains_key(path).then(|| tree.children(path))
    }

    /// Simulate the loss of the registry session: ephemeral nodes vanish
    /// and every outstanding watch fires [`WatchEvent::SessionExpired`].
    pub fn expire_session(&self) {
        let watches: Vec<_> = {
            let mut guard = self.lock();
            let tree = &mut *guard;
            tree.nodes.retain(|_, node| !node.ephemeral);
            tree.child_watches
                .drain()
                .chain(tree.node_watches.drain())
                .flat_map(|(_, txs)| txs)
                .collect()
        };
        warn!("discovery session expired: product={}", self.topology.product());
        for tx in watches {
            let _ = tx.send(WatchEvent::SessionExpired);
        }
    }

    /// Register static endpoints for each service. They survive session
    /// expiry.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Encode`] if an endpoint record cannot be
    /// encoded.
    pub fn seed(&self, endpoints: &BTreeMap<String, Vec<String>>) -> Result<(), DiscoveryError> {
        for (service, addrs) in endpoints {
            self.create(&self.topology.service_path(service), Vec::new(), false);
            for addr in addrs {
                let id = service_identity(addr);
                let endpoint = ServiceEndpoint::new(service.as_str(), id.as_str(), addr.as_str(), "", "");
                self.create(
                    &self.topology.endpoint_path(service, &id),
                    endpoint.to_json()?,
                    false,
                );
                info!("static endpoint seeded: service={service}, addr={addr}");
            }
        }
        Ok(())
    }

    /// Run `read` on the node at `path` and leave a one-shot watch in
    /// `watches` of the tree.
    fn watch<R>(
        &self,
        path: &str,
        read: impl FnOnce(&Tree, &Node) -> R,
        watches: impl FnOnce(&mut Tree) -> &mut Watches,
    ) -> Result<(R, WatchSignal), DiscoveryError> {
        let mut tree = self.lock();
        let value = match tree.nodes.get(path) {
            Some(node) => read(&tree, node),
            None => return Err(DiscoveryError::NoNode(path.to_owned())),
        };
        let (tx, signal) = WatchSignal::channel();
        watches(&mut tree).entry(path.to_owned()).or_default().push(tx);
        debug!("watch set: path={path}");
        Ok((value, signal))
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    fn topology(&self) -> &Topology { &self.topology }

    async fn create_path(&self, path: &str) -> Result<(), DiscoveryError> {
        let mut tree = self.lock();
        if !tree.nodes.contains_key(path) {
            tree.ensure_parents(path);
            tree.insert_new(path.to_owned(), Vec::new(), false);
        }
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchSignal), DiscoveryError> {
        self.watch(path, |tree, _| tree.children(path), |tree| &mut tree.child_watches)
    }

    async fn watch_node(&self, path: &str) -> Result<(Vec<u8>, WatchSignal), DiscoveryError> {
        self.watch(path, |_, node| node.data.clone(), |tree| &mut tree.node_watches)
    }

    async fn register_endpoint(&self, endpoint: &ServiceEndpoint) -> Result<(), DiscoveryError> {
        let path = self
            .topology
            .endpoint_path(&endpoint.service, &endpoint.service_id);
        let data = endpoint.to_json()?;
        self.delete(&path);
        self.create(&path, data, true);
        info!("endpoint registered: path={path}, frontend={}", endpoint.frontend);
        Ok(())
    }

    async fn delete_endpoint(&self, service: &str, id: &str) -> Result<(), DiscoveryError> {
        let path = self.topology.endpoint_path(service, id);
        if self.delete(&path) {
            info!("endpoint deleted: path={path}");
        }
        Ok(())
    }

    async fn get_endpoint(&self, service: &str, id: &str) -> Result<ServiceEndpoint, DiscoveryError> {
        let path = self.topology.endpoint_path(service, id);
        let data = self
            .lock()
            .nodes
            .get(&path)
            .map(|node| node.data.clone())
            .ok_or_else(|| DiscoveryError::NoNode(path.clone()))?;
        ServiceEndpoint::from_json(&path, &data)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::{fixture, rstest};
    use tokio::time::{Duration, timeout};

    use super::MemoryDiscovery;
    use crate::discovery::{
        Discovery,
        DiscoveryError,
        ServiceEndpoint,
        Topology,
        WatchEvent,
        service_identity,
    };

    #[fixture]
    fn registry() -> MemoryDiscovery { MemoryDiscovery::new(Topology::new("online")) }

    fn endpoint(frontend: &str) -> ServiceEndpoint {
        ServiceEndpoint::new("user", service_identity(frontend), frontend, "/srv", "v1")
    }

    #[rstest]
    #[tokio::test]
    async fn registering_fires_children_watch(registry: MemoryDiscovery) {
        let services = registry.topology().service_path("user");
        registry.create(&services, Vec::new(), false);
        let (ids, signal) = registry.watch_children(&services).await.unwrap();
        assert!(ids.is_empty());

        registry.register_endpoint(&endpoint("10.0.0.1:9000")).await.unwrap();
        let event = timeout(Duration::from_secs(1), signal).await.unwrap();
        assert_eq!(event, WatchEvent::ChildrenChanged);

        let (ids, _) = registry.watch_children(&services).await.unwrap();
        assert_eq!(ids, vec![service_identity("10.0.0.1:9000")]);
    }

    #[rstest]
    #[tokio::test]
    async fn endpoint_round_trips_through_registry(registry: MemoryDiscovery) {
        let ep = endpoint("10.0.0.1:9000");
        registry.register_endpoint(&ep).await.unwrap();
        let read = registry.get_endpoint("user", &ep.service_id).await.unwrap();
        assert_eq!(read, ep);

        registry.delete_endpoint("user", &ep.service_id).await.unwrap();
        assert!(matches!(
            registry.get_endpoint("user", &ep.service_id).await,
            Err(DiscoveryError::NoNode(_))
        ));
        registry.delete_endpoint("user", &ep.service_id).await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn session_expiry_drops_ephemeral_nodes_only(registry: MemoryDiscovery) {
        let mut statics = BTreeMap::new();
        statics.insert("order".to_owned(), vec!["10.0.0.9:9000".to_owned()]);
        registry.seed(&statics).unwrap();
        registry.register_endpoint(&endpoint("10.0.0.1:9000")).await.unwrap();

        let services = registry.topology().services_path();
        let (_, signal) = registry.watch_children(&services).await.unwrap();
        registry.expire_session();
        assert_eq!(signal.await, WatchEvent::SessionExpired);

        let user = registry.topology().service_path("user");
        let order = registry.topology().service_path("order");
        assert_eq!(registry.children(&user).unwrap(), Vec::<String>::new());
        assert_eq!(registry.children(&order).unwrap().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn watching_a_missing_path_fails(registry: MemoryDiscovery) {
        let res = registry.watch_children("/zk/product/online/services").await;
        assert!(matches!(res, Err(DiscoveryError::NoNode(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn deleting_a_service_fires_node_and_parent_watches(registry: MemoryDiscovery) {
        registry.register_endpoint(&endpoint("10.0.0.1:9000")).await.unwrap();
        let topo = registry.topology().clone();
        let (_, node_signal) = registry.watch_node(&topo.service_path("user")).await.unwrap();
        let (_, parent_signal) = registry.watch_children(&topo.services_path()).await.unwrap();

        assert!(registry.delete(&topo.service_path("user")));
        assert_eq!(node_signal.await, WatchEvent::DataChanged);
        assert_eq!(parent_signal.await, WatchEvent::ChildrenChanged);
    }
}
