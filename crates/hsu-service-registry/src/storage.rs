//! Local bookkeeping for the services this process owns.
//!
//! This is not what other processes discover; discovery reads the shared
//! store. The local registry exists so the owner can reject duplicate
//! registrations and find every service to stop on shutdown.
//!
//! The map is a `DashMap` keyed by name, holding the instances of that name
//! by id. Registration and shutdown may run on different tasks; every
//! mutation goes through a shard lock, so no caller has to lock explicitly.

use crate::types::Service;
use dashmap::DashMap;
use hsu_common::{Error, Result, ServiceId, ServiceName};
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe map of name -> id -> service.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<DashMap<ServiceName, HashMap<ServiceId, Service>>>,
}

impl ServiceRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a service, creating the per-name map if needed.
    ///
    /// Fails with `DuplicateService` if the (name, id) pair is taken. The
    /// check and the insert happen under the same shard lock.
    pub fn add(&self, service: Service) -> Result<()> {
        let mut instances = self.services.entry(service.name.clone()).or_default();
        if instances.contains_key(&service.id) {
            return Err(Error::duplicate_service(
                service.name.clone(),
                service.id.clone(),
            ));
        }
        tracing::debug!(service = %service.name, id = %service.id, "Added local service");
        instances.insert(service.id.clone(), service);
        Ok(())
    }

    /// Cancels the service's liveness token, then removes it.
    ///
    /// Cancelling is idempotent, so racing removals are harmless; only the
    /// first one gets the service back.
    pub fn remove(&self, name: &ServiceName, id: &ServiceId) -> Option<Service> {
        let removed = {
            let mut instances = self.services.get_mut(name)?;
            if let Some(service) = instances.get(id) {
                service.liveness().cancel();
            }
            instances.remove(id)
        };
        self.services.remove_if(name, |_, instances| instances.is_empty());

        if let Some(ref service) = removed {
            tracing::debug!(service = %service.name, id = %service.id, "Removed local service");
        }
        removed
    }

    /// Returns true if (name, id) is registered.
    pub fn exists(&self, name: &ServiceName, id: &ServiceId) -> bool {
        self.services
            .get(name)
            .map(|instances| instances.contains_key(id))
            .unwrap_or(false)
    }

    /// Looks up one service.
    pub fn get(&self, name: &ServiceName, id: &ServiceId) -> Option<Service> {
        self.services.get(name)?.get(id).cloned()
    }

    /// Lists every local service.
    pub fn list_all(&self) -> Vec<Service> {
        self.services
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Returns the number of local services across all names.
    pub fn count(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns the number of distinct names.
    pub fn name_count(&self) -> usize {
        self.services.len()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.name_count())
            .field("services", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceRoute;

    fn service(name: &str, id: &str) -> Service {
        Service::new(
            ServiceId::from(id),
            ServiceName::from(name),
            "127.0.0.1",
            8080,
            vec![ServiceRoute::new("/")],
        )
    }

    #[test]
    fn test_registry_add_and_exists() {
        let registry = ServiceRegistry::new();
        registry.add(service("echo", "a")).unwrap();

        assert!(registry.exists(&ServiceName::from("echo"), &ServiceId::from("a")));
        assert!(!registry.exists(&ServiceName::from("echo"), &ServiceId::from("b")));
        assert!(!registry.exists(&ServiceName::from("other"), &ServiceId::from("a")));
    }

    #[test]
    fn test_registry_rejects_duplicate() {
        let registry = ServiceRegistry::new();
        registry.add(service("echo", "a")).unwrap();

        let result = registry.add(service("echo", "a"));
        match result {
            Err(Error::DuplicateService { name, id }) => {
                assert_eq!(name.as_str(), "echo");
                assert_eq!(id.as_str(), "a");
            }
            _ => panic!("Expected DuplicateService error"),
        }
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_registry_replicas_share_name() {
        let registry = ServiceRegistry::new();
        registry.add(service("work", "1")).unwrap();
        registry.add(service("work", "2")).unwrap();
        registry.add(service("echo", "1")).unwrap();

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.name_count(), 2);
        assert_eq!(registry.list_all().len(), 3);
    }

    #[test]
    fn test_registry_remove_cancels_liveness() {
        let registry = ServiceRegistry::new();
        let svc = service("echo", "a");
        let token = svc.liveness().clone();
        registry.add(svc).unwrap();

        let removed = registry.remove(&ServiceName::from("echo"), &ServiceId::from("a"));
        assert!(removed.is_some());
        assert!(token.is_cancelled());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.name_count(), 0);
    }

    #[test]
    fn test_registry_remove_is_idempotent() {
        let registry = ServiceRegistry::new();
        registry.add(service("echo", "a")).unwrap();

        let name = ServiceName::from("echo");
        let id = ServiceId::from("a");
        assert!(registry.remove(&name, &id).is_some());
        assert!(registry.remove(&name, &id).is_none());
    }

    #[tokio::test]
    async fn test_registry_concurrent_access() {
        use tokio::task;

        let registry = ServiceRegistry::new();
        let mut handles = vec![];

        for i in 0..10 {
            let registry = registry.clone();
            handles.push(task::spawn(async move {
                registry.add(service("work", &format!("id-{}", i))).unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.count(), 10);
        assert_eq!(registry.name_count(), 1);
    }
}
