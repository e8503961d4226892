//! Presence and health publishing.
//!
//! Each refresh writes three keys with the same TTL: the presence marker,
//! the JSON health record and the route set. Only the presence key decides
//! liveness. A process that stops refreshing drops out of discovery once
//! the TTL runs out, with no explicit goodbye needed.

use crate::keys::KeySpace;
use crate::store::KvStore;
use crate::types::Service;
use hsu_common::{Result, ResultExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Clone)]
pub struct PresencePublisher {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl PresencePublisher {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Refreshes presence, health and routes.
    ///
    /// The writes are independent: all three are attempted even if one
    /// fails, and the first failure is returned.
    pub async fn publish(&self, service: &Service) -> Result<()> {
        let presence = self.update_presence(service).await;
        let health = self.update_health(service).await;
        let routes = self.update_routes(service).await;
        trace!(service = %service.name, id = %service.id, "Presence refreshed");
        presence.and(health).and(routes)
    }

    pub async fn update_presence(&self, service: &Service) -> Result<()> {
        let key = self.keys.presence_key(&service.name, &service.id);
        self.store
            .set(&key, service.id.as_str(), self.ttl)
            .await
            .context(format!("Failed to write {}", key))
    }

    pub async fn update_health(&self, service: &Service) -> Result<()> {
        let key = self.keys.health_key(&service.name, &service.id);
        let record = service.to_json()?;
        self.store
            .set(&key, &record, self.ttl)
            .await
            .context(format!("Failed to write {}", key))
    }

    pub async fn update_routes(&self, service: &Service) -> Result<()> {
        let key = self.keys.routes_key(&service.name, &service.id);
        self.store
            .set_add(&key, &service.route_prefixes(), self.ttl)
            .await
            .context(format!("Failed to write {}", key))
    }

    /// Deletes all three keys so discovery stops returning the service
    /// right away.
    pub async fn withdraw(&self, service: &Service) -> Result<()> {
        let keys = self.keys.service_keys(service);
        self.store.delete(&keys).await.map_err(|e| {
            warn!(service = %service.name, id = %service.id, error = %e, "Failed to withdraw presence");
            e
        })
    }
}
