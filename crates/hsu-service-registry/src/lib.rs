//! # HSU Service Registry
//!
//! Service discovery and RPC messaging over a shared key/value pub/sub
//! store.
//!
//! This crate provides:
//! - A [`KvStore`] adapter with in-memory and redis backends
//! - Presence publishing with TTL-based liveness and a recurring heartbeat
//! - Route-prefix resolution across every live instance in the mesh
//! - Request/response messaging with optional timeouts
//! - A per-service dispatch loop feeding inbound messages to handlers
//!
//! Everything is reached through [`ServiceMesh`].

pub mod address;
pub mod config;
pub mod dispatch;
pub mod keys;
pub mod mesh;
pub mod messaging;
pub mod presence;
pub mod resolver;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::{MeshConfig, StoreConfig};
pub use dispatch::{handler_fn, MessageHandler};
pub use keys::KeySpace;
pub use mesh::{ServiceMesh, ServiceMeshBuilder};
pub use messaging::PendingReply;
pub use presence::PresencePublisher;
pub use resolver::RouteResolver;
pub use scheduler::TaskScheduler;
pub use storage::ServiceRegistry;
pub use store::{KvStore, MemoryStore, RedisStore, Subscription};
pub use types::{Message, Service, ServiceRoute};
