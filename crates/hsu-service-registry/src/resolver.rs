//! Route-based service resolution.
//!
//! Resolution always reads the shared store, never the local registry, so
//! it sees every live instance in the mesh. Discovery is only as fresh as
//! the heartbeat: an instance that died within the last TTL can still be
//! returned, and a caller will simply see its request time out.

use crate::keys::KeySpace;
use crate::store::KvStore;
use crate::types::Service;
use hsu_common::{Error, Result, ServiceId, ServiceName};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Source of randomness for picking among matching instances.
pub type SharedRng = Mutex<Box<dyn RngCore + Send>>;

pub struct RouteResolver {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    rng: SharedRng,
}

impl RouteResolver {
    /// Creates a resolver seeded from the OS.
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self::with_rng(store, keys, Box::new(StdRng::from_entropy()))
    }

    /// Creates a resolver whose selections are reproducible for `seed`.
    pub fn with_seed(store: Arc<dyn KvStore>, keys: KeySpace, seed: u64) -> Self {
        Self::with_rng(store, keys, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(store: Arc<dyn KvStore>, keys: KeySpace, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            store,
            keys,
            rng: Mutex::new(rng),
        }
    }

    /// Reads one health record. `Ok(None)` if it has expired.
    pub async fn fetch_service(&self, name: &ServiceName, id: &ServiceId) -> Result<Option<Service>> {
        let key = self.keys.health_key(name, id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(Service::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Lists every live instance in the store, sorted by id then name.
    ///
    /// A failing scan yields an empty list; an unreadable record is
    /// skipped. Both are logged.
    pub async fn list_services(&self) -> Vec<Service> {
        let pattern = self.keys.presence_pattern();
        let keys = match self.store.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(pattern = %pattern, error = %e, "Failed to list services");
                return Vec::new();
            }
        };

        let mut services = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(name) = self.keys.parse_presence_key(&key) else {
                warn!(key = %key, "Ignoring malformed presence key");
                continue;
            };
            let id = match self.store.get(&key).await {
                Ok(Some(id)) => ServiceId::from(id),
                // Expired between the scan and the read.
                Ok(None) => continue,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to read presence");
                    continue;
                }
            };
            match self.fetch_service(&name, &id).await {
                Ok(Some(service)) => services.push(service),
                Ok(None) => debug!(service = %name, id = %id, "Presence without health record"),
                Err(e) => error!(service = %name, id = %id, error = %e, "Failed to fetch service"),
            }
        }

        services.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));
        services
    }

    /// Every live instance with a route prefix matching `path`.
    pub async fn candidates(&self, path: &str) -> Vec<Service> {
        self.list_services()
            .await
            .into_iter()
            .filter(|service| service.matches(path))
            .collect()
    }

    /// Picks one instance serving `path`, uniformly at random across all
    /// matching instances.
    pub async fn resolve(&self, path: &str) -> Result<Service> {
        let mut candidates = self.candidates(path).await;
        let index = self
            .pick_index(candidates.len())
            .ok_or_else(|| Error::service_not_found(path))?;
        let service = candidates.swap_remove(index);
        debug!(path = %path, service = %service.name, id = %service.id, "Resolved service");
        Ok(service)
    }

    /// Uniform index in `0..len`, or `None` when there is nothing to pick.
    pub fn pick_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.rng.lock().gen_range(0..len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresencePublisher;
    use crate::store::MemoryStore;
    use crate::types::ServiceRoute;
    use std::time::Duration;

    async fn publish(store: &Arc<dyn KvStore>, name: &str, id: &str, routes: &[&str]) -> Service {
        let service = Service::new(
            ServiceId::from(id),
            ServiceName::from(name),
            "127.0.0.1",
            8000,
            routes.iter().map(|r| ServiceRoute::new(*r)).collect(),
        );
        PresencePublisher::new(Arc::clone(store), KeySpace::default(), Duration::from_secs(5))
            .publish(&service)
            .await
            .unwrap();
        service
    }

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_list_services_sorted_by_id() {
        let store = store();
        publish(&store, "b", "2", &["/b"]).await;
        publish(&store, "a", "1", &["/a"]).await;
        publish(&store, "c", "3", &["/c"]).await;

        let resolver = RouteResolver::new(store, KeySpace::default());
        let ids: Vec<String> = resolver
            .list_services()
            .await
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_resolve_filters_by_prefix() {
        let store = store();
        publish(&store, "users", "u1", &["/api/users"]).await;
        publish(&store, "orders", "o1", &["/api/orders"]).await;

        let resolver = RouteResolver::with_seed(store, KeySpace::default(), 7);
        for _ in 0..20 {
            let svc = resolver.resolve("/api/users/42").await.unwrap();
            assert_eq!(svc.name.as_str(), "users");
        }
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let store = store();
        publish(&store, "users", "u1", &["/api/users"]).await;

        let resolver = RouteResolver::new(store, KeySpace::default());
        let err = resolver.resolve("/static/logo.png").await.unwrap_err();
        match err {
            Error::ServiceNotFound { path } => assert_eq!(path, "/static/logo.png"),
            other => panic!("Expected ServiceNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_seeded_resolution_is_reproducible() {
        let store = store();
        for id in ["a", "b", "c", "d"] {
            publish(&store, "work", id, &["/job"]).await;
        }

        let first = RouteResolver::with_seed(Arc::clone(&store), KeySpace::default(), 42);
        let second = RouteResolver::with_seed(store, KeySpace::default(), 42);

        for _ in 0..50 {
            let a = first.resolve("/job").await.unwrap();
            let b = second.resolve("/job").await.unwrap();
            assert_eq!(a.id, b.id);
        }
    }

    #[tokio::test]
    async fn test_skips_presence_without_health() {
        let store = store();
        store
            .set("service:ghost:g1:presence", "g1", Duration::from_secs(5))
            .await
            .unwrap();
        publish(&store, "real", "r1", &["/"]).await;

        let resolver = RouteResolver::new(store, KeySpace::default());
        let services = resolver.list_services().await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name.as_str(), "real");
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = store();
        publish(&store, "work", "1", &["/job"]).await;

        let resolver = RouteResolver::new(store, KeySpace::new(Some("other".to_string())));
        assert!(resolver.list_services().await.is_empty());
    }

    #[test]
    fn test_pick_index_empty() {
        let resolver = RouteResolver::new(store(), KeySpace::default());
        assert_eq!(resolver.pick_index(0), None);
        assert_eq!(resolver.pick_index(1), Some(0));
    }
}
