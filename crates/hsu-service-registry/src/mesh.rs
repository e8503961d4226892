//! The service mesh facade.
//!
//! [`ServiceMesh`] ties the pieces together: it registers local services
//! (presence, heartbeat, inbound dispatch), resolves paths to live
//! instances anywhere in the mesh, and sends requests and replies.
//! Clones are cheap and share everything.
//!
//! ```rust,no_run
//! use hsu_service_registry::{handler_fn, MemoryStore, MeshConfig, ServiceMesh, ServiceRoute};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> hsu_common::Result<()> {
//! let mesh = ServiceMesh::connect(Arc::new(MemoryStore::new()), MeshConfig::default())?;
//!
//! let echo = mesh
//!     .register_service(
//!         "echo",
//!         8080,
//!         vec![ServiceRoute::new("/echo")],
//!         Some(handler_fn(|mesh, msg| async move {
//!             let payload = msg.payload.clone();
//!             mesh.respond(&msg, payload).await
//!         })),
//!     )
//!     .await?;
//!
//! let target = mesh.resolve_service("/echo").await?;
//! let reply = mesh.rpc("client", &target, "/echo", json!("hello")).await?.recv().await;
//! assert_eq!(reply.map(|m| m.payload), Some(json!("hello")));
//! # mesh.deregister_service(&echo).await;
//! # Ok(())
//! # }
//! ```

use crate::address;
use crate::config::MeshConfig;
use crate::dispatch::{self, MessageHandler};
use crate::keys::KeySpace;
use crate::messaging::{Messenger, PendingReply};
use crate::presence::PresencePublisher;
use crate::resolver::RouteResolver;
use crate::scheduler::TaskScheduler;
use crate::storage::ServiceRegistry;
use crate::store::KvStore;
use crate::types::{random_id, Message, Service, ServiceRoute};
use hsu_common::{Error, Result, ServiceId, ServiceName};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct MeshInner {
    config: MeshConfig,
    keys: KeySpace,
    store: Arc<dyn KvStore>,
    registry: ServiceRegistry,
    scheduler: TaskScheduler,
    presence: PresencePublisher,
    resolver: RouteResolver,
    messenger: Messenger,
}

/// Handle to the mesh. See the module docs.
#[derive(Clone)]
pub struct ServiceMesh {
    inner: Arc<MeshInner>,
}

impl std::fmt::Debug for ServiceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMesh")
            .field("namespace", &self.inner.keys.namespace())
            .field("local_services", &self.inner.registry.count())
            .finish()
    }
}

/// Builder for [`ServiceMesh`] when the defaults are not enough.
pub struct ServiceMeshBuilder {
    store: Arc<dyn KvStore>,
    config: MeshConfig,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl ServiceMeshBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Makes instance selection reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        use rand::SeedableRng;
        self.rng = Some(Box::new(rand::rngs::StdRng::seed_from_u64(seed)));
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn build(self) -> Result<ServiceMesh> {
        self.config.validate()?;

        let keys = KeySpace::new(self.config.namespace.clone());
        let resolver = match self.rng {
            Some(rng) => RouteResolver::with_rng(Arc::clone(&self.store), keys.clone(), rng),
            None => RouteResolver::new(Arc::clone(&self.store), keys.clone()),
        };
        let presence = PresencePublisher::new(
            Arc::clone(&self.store),
            keys.clone(),
            self.config.presence_ttl,
        );

        Ok(ServiceMesh {
            inner: Arc::new(MeshInner {
                messenger: Messenger::new(Arc::clone(&self.store)),
                registry: ServiceRegistry::new(),
                scheduler: TaskScheduler::new(),
                presence,
                resolver,
                keys,
                store: self.store,
                config: self.config,
            }),
        })
    }
}

impl ServiceMesh {
    /// Creates a mesh over `store` with the given configuration.
    pub fn connect(store: Arc<dyn KvStore>, config: MeshConfig) -> Result<Self> {
        Self::builder(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn KvStore>) -> ServiceMeshBuilder {
        ServiceMeshBuilder {
            store,
            config: MeshConfig::default(),
            rng: None,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.inner.keys
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    /// Registers a service owned by this process and makes it discoverable.
    ///
    /// The service gets a fresh id and the advertised address, its
    /// presence is published right away and then refreshed every
    /// heartbeat interval. If `handler` is set, or any route carries its
    /// own handler, a dispatch loop starts listening on the service's
    /// topics. A failed first publish is logged; the next heartbeat
    /// retries it.
    pub async fn register_service(
        &self,
        name: impl Into<ServiceName>,
        port: u16,
        routes: Vec<ServiceRoute>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Service> {
        let name = name.into();
        if !name.is_valid() {
            return Err(Error::validation(format!(
                "Service name must be non-empty and must not contain ':': {:?}",
                name.as_str()
            )));
        }

        let id = ServiceId::from(random_id());
        if self.inner.registry.exists(&name, &id) {
            return Err(Error::duplicate_service(name, id));
        }

        let ip_address = match &self.inner.config.advertise_address {
            Some(address) => address.clone(),
            None => address::outbound_ip().await.to_string(),
        };

        let service = Service::new(id, name, ip_address, port, routes);
        self.inner.registry.add(service.clone())?;

        if let Err(e) = self.inner.presence.publish(&service).await {
            warn!(service = %service.name, id = %service.id, error = %e, "Initial presence publish failed");
        }

        if handler.is_some() || service.has_route_handlers() {
            if let Err(e) = dispatch::start(self.clone(), service.clone(), handler).await {
                error!(service = %service.name, id = %service.id, error = %e, "Failed to start dispatch, rolling back registration");
                self.inner.registry.remove(&service.name, &service.id);
                let _ = self.inner.presence.withdraw(&service).await;
                return Err(e);
            }
        }

        if let Err(e) = self.schedule_heartbeat(&service) {
            self.deregister_service(&service).await;
            return Err(e);
        }

        info!(
            service = %service.name,
            id = %service.id,
            address = %service.ip_address,
            port = service.port,
            routes = ?service.route_prefixes(),
            "Registered service"
        );
        Ok(service)
    }

    fn schedule_heartbeat(&self, service: &Service) -> Result<()> {
        let presence = self.inner.presence.clone();
        let target = service.clone();
        self.inner.scheduler.add_with_id(
            service.id.as_str(),
            self.inner.config.heartbeat_interval,
            service.liveness(),
            move || {
                let presence = presence.clone();
                let target = target.clone();
                async move { presence.publish(&target).await }
            },
        )
    }

    /// Stops a local service: dispatch and heartbeat end, and with
    /// `purge_on_deregister` its keys are deleted so discovery drops it
    /// immediately. Returns false if the service is not owned here.
    pub async fn deregister_service(&self, service: &Service) -> bool {
        service.liveness().cancel();
        // Wait out a refresh in progress so it cannot rewrite purged keys.
        self.inner.scheduler.stop(service.id.as_str()).await;

        let Some(removed) = self.inner.registry.remove(&service.name, &service.id) else {
            debug!(service = %service.name, id = %service.id, "Service not registered locally");
            return false;
        };

        if self.inner.config.purge_on_deregister {
            // Already logged; the keys expire on their own anyway.
            let _ = self.inner.presence.withdraw(&removed).await;
        }
        info!(service = %removed.name, id = %removed.id, "Deregistered service");
        true
    }

    /// Deregisters every service this process owns.
    pub async fn shutdown(&self) {
        let services = self.inner.registry.list_all();
        info!(count = services.len(), "Shutting down service mesh");
        for service in &services {
            self.deregister_service(service).await;
        }
        self.inner.scheduler.cancel_all();
    }

    /// Picks a live instance, anywhere in the mesh, with a route prefix
    /// matching `path`. Fails with `ServiceNotFound` if there is none.
    pub async fn resolve_service(&self, path: &str) -> Result<Service> {
        self.inner.resolver.resolve(path).await
    }

    /// Every live service visible in the store, sorted by id.
    pub async fn list_services(&self) -> Vec<Service> {
        self.inner.resolver.list_services().await
    }

    pub async fn fetch_service(&self, name: &ServiceName, id: &ServiceId) -> Result<Option<Service>> {
        self.inner.resolver.fetch_service(name, id).await
    }

    pub fn local_service_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn local_services(&self) -> Vec<Service> {
        self.inner.registry.list_all()
    }

    /// Sends a request to `service` and returns the slot its reply lands
    /// in. Waits for the reply without a time limit.
    pub async fn rpc(
        &self,
        from: &str,
        service: &Service,
        route: &str,
        payload: serde_json::Value,
    ) -> Result<PendingReply> {
        self.rpc_inner(from, service, route, payload, None).await
    }

    /// Like [`rpc`](Self::rpc), but the slot yields `None` once `timeout`
    /// elapses without a reply. Only the first outcome is ever seen.
    pub async fn rpc_with_timeout(
        &self,
        from: &str,
        service: &Service,
        route: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<PendingReply> {
        self.rpc_inner(from, service, route, payload, Some(timeout))
            .await
    }

    async fn rpc_inner(
        &self,
        from: &str,
        service: &Service,
        route: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<PendingReply> {
        let channel = self.inner.keys.instance_topic(service);
        self.request(&channel, from, &service.key(), route, payload, timeout)
            .await
    }

    /// Publishes a request on an arbitrary channel, e.g. a service name
    /// topic to reach whichever instance answers first.
    pub async fn request(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        route: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<PendingReply> {
        self.inner
            .messenger
            .request(channel, from, to, route, payload, timeout)
            .await
    }

    /// Publishes a one-way message.
    pub async fn send(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        route: &str,
        payload: serde_json::Value,
    ) -> Result<Message> {
        self.inner
            .messenger
            .send(channel, from, to, route, payload)
            .await
    }

    /// Replies to `original`.
    pub async fn respond(&self, original: &Message, payload: serde_json::Value) -> Result<()> {
        self.inner.messenger.respond(original, payload).await
    }

    /// Wipes the whole store, including other processes' keys.
    pub async fn flush(&self) -> Result<()> {
        warn!("Flushing the shared store");
        self.inner.store.flush().await
    }
}
