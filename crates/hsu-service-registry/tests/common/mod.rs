// Shared helpers for mesh integration tests.
#![allow(dead_code)]

use hsu_common::Error;
use hsu_service_registry::{
    handler_fn, MemoryStore, Message, MeshConfig, MessageHandler, PendingReply, ServiceMesh,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default config with a fixed address so tests never probe the network.
pub fn test_config() -> MeshConfig {
    MeshConfig {
        advertise_address: Some("127.0.0.1".to_string()),
        ..Default::default()
    }
}

pub fn mesh_over(store: &MemoryStore) -> ServiceMesh {
    ServiceMesh::connect(Arc::new(store.clone()), test_config()).unwrap()
}

pub fn mesh() -> ServiceMesh {
    mesh_over(&MemoryStore::new())
}

/// Replies with the payload it received.
pub fn echo_handler() -> Arc<dyn MessageHandler> {
    handler_fn(|mesh: ServiceMesh, msg: Message| async move {
        let payload = msg.payload.clone();
        mesh.respond(&msg, payload).await
    })
}

/// Replies with a fixed tag, to tell handlers apart.
pub fn tagged_handler(tag: &'static str) -> Arc<dyn MessageHandler> {
    handler_fn(move |mesh: ServiceMesh, msg: Message| async move {
        mesh.respond(&msg, serde_json::json!(tag)).await
    })
}

/// Counts deliveries and never replies.
pub fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    handler_fn(move |_mesh: ServiceMesh, _msg: Message| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        }
    })
}

pub async fn recv_within(pending: PendingReply, limit: Duration) -> Option<Message> {
    tokio::time::timeout(limit, pending.recv())
        .await
        .expect("reply did not arrive in time")
}

/// Polls `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
