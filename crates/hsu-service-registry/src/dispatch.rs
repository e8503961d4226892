//! Inbound dispatch.
//!
//! Every service registered with a handler gets one listener task
//! subscribed to its own topic (`service:<name>:<id>`) and to the topic
//! shared by its name (`service:<name>`). Messages are handled one at a
//! time per service; different services run independently.
//!
//! A message goes to the handler of the longest matching route that has
//! one, even when a longer matching route has none. Everything else goes
//! to the service-wide handler.

use crate::mesh::ServiceMesh;
use crate::store::Subscription;
use crate::types::{Message, Service};
use async_trait::async_trait;
use hsu_common::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reacts to inbound messages for a service.
///
/// Errors are logged by the dispatch loop; they never stop it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, mesh: &ServiceMesh, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ServiceMesh, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, mesh: &ServiceMesh, message: Message) -> Result<()> {
        (self.0)(mesh.clone(), message).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// ```rust,no_run
/// use hsu_service_registry::handler_fn;
///
/// let echo = handler_fn(|mesh, msg| async move {
///     let payload = msg.payload.clone();
///     mesh.respond(&msg, payload).await
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ServiceMesh, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Subscribes to the service's topics and spawns its listener.
///
/// Returns once the subscription is active. The listener stops when the
/// service's liveness token is cancelled.
pub(crate) async fn start(
    mesh: ServiceMesh,
    service: Service,
    fallback: Option<Arc<dyn MessageHandler>>,
) -> Result<JoinHandle<()>> {
    let topics = vec![
        mesh.keys().instance_topic(&service),
        mesh.keys().name_topic(&service.name),
    ];
    let subscription = mesh.store().subscribe(&topics).await?;
    debug!(service = %service.name, id = %service.id, topics = ?topics, "Dispatch subscribed");

    Ok(tokio::spawn(run(mesh, service, fallback, subscription)))
}

async fn run(
    mesh: ServiceMesh,
    service: Service,
    fallback: Option<Arc<dyn MessageHandler>>,
    mut subscription: Subscription,
) {
    let liveness = service.liveness().clone();

    loop {
        tokio::select! {
            biased;

            _ = liveness.cancelled() => {
                info!(service = %service.name, id = %service.id, "Service liveness ended, dispatch stopped");
                break;
            }
            raw = subscription.next() => {
                let Some(raw) = raw else {
                    warn!(service = %service.name, id = %service.id, "Dispatch subscription closed");
                    break;
                };
                dispatch_one(&mesh, &service, fallback.as_ref(), &raw).await;
            }
        }
    }
}

async fn dispatch_one(
    mesh: &ServiceMesh,
    service: &Service,
    fallback: Option<&Arc<dyn MessageHandler>>,
    raw: &str,
) {
    let message = match Message::from_json(raw) {
        Ok(message) => message,
        Err(e) => {
            error!(service = %service.name, id = %service.id, error = %e, "Failed to decode inbound message");
            return;
        }
    };

    let handler = service.route_handler(&message.route).or(fallback);

    let Some(handler) = handler else {
        debug!(service = %service.name, route = %message.route, "No handler for route, message dropped");
        return;
    };

    let msg_id = message.msg_id.clone();
    if let Err(e) = handler.handle(mesh, message).await {
        warn!(service = %service.name, msg_id = %msg_id, error = %e, "Message handler failed");
    }
}
