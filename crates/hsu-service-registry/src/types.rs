//! Data types for the service registry.
//!
//! [`Service`] is what a process advertises (and what the health record
//! stores as JSON); [`Message`] is the unit every publication carries.

use crate::dispatch::MessageHandler;
use hsu_common::{Result, ServiceId, ServiceName};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Length of generated service and message ids.
const ID_LEN: usize = 16;

/// Generates a random lowercase alphanumeric id.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// A path prefix a service claims, with an optional handler for it.
///
/// Only the prefix is part of the health record; the handler stays local
/// to the owning process.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ServiceRoute {
    pub route: String,

    #[serde(skip)]
    pub handler: Option<Arc<dyn MessageHandler>>,
}

impl ServiceRoute {
    /// Creates a route without a dedicated handler.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            handler: None,
        }
    }

    /// Creates a route whose messages go to `handler` instead of the
    /// service-wide handler.
    pub fn with_handler(route: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            route: route.into(),
            handler: Some(handler),
        }
    }

    /// Returns true if `path` starts with this route's prefix.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.route)
    }
}

impl fmt::Debug for ServiceRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRoute")
            .field("route", &self.route)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl PartialEq for ServiceRoute {
    fn eq(&self, other: &Self) -> bool {
        self.route == other.route
    }
}

/// Orders routes longest prefix first. The sort is stable, so prefixes of
/// equal length keep their registration order.
pub fn sort_routes(routes: &mut [ServiceRoute]) {
    routes.sort_by(|a, b| b.route.len().cmp(&a.route.len()));
}

/// A named, addressable service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub id: ServiceId,

    pub name: ServiceName,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    #[serde(skip_serializing_if = "is_zero_port")]
    pub port: u16,

    /// Longest prefix first once registered.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ServiceRoute>,

    /// Cancelled when the service is deregistered; stops its dispatch loop
    /// and heartbeat. Clones share the same token.
    #[serde(skip)]
    liveness: CancellationToken,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

impl Service {
    /// Creates a new service record with a fresh liveness token.
    pub fn new(
        id: ServiceId,
        name: ServiceName,
        ip_address: impl Into<String>,
        port: u16,
        mut routes: Vec<ServiceRoute>,
    ) -> Self {
        sort_routes(&mut routes);
        Self {
            id,
            name,
            ip_address: ip_address.into(),
            port,
            routes,
            liveness: CancellationToken::new(),
        }
    }

    /// Logical endpoint identifier, `service:<name>:<id>`.
    pub fn key(&self) -> String {
        format!("service:{}:{}", self.name, self.id)
    }

    /// Identifier shared by every instance of this name, `service:<name>`.
    pub fn base_key(&self) -> String {
        format!("service:{}", self.name)
    }

    /// Returns true if any route prefix matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.routes.iter().any(|r| r.matches(path))
    }

    /// Returns the longest route prefix matching `path`.
    pub fn matching_route(&self, path: &str) -> Option<&ServiceRoute> {
        self.routes
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.route.len())
    }

    /// Handler of the longest matching route that has one.
    pub fn route_handler(&self, path: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.routes
            .iter()
            .filter(|r| r.handler.is_some() && r.matches(path))
            .max_by_key(|r| r.route.len())
            .and_then(|r| r.handler.as_ref())
    }

    /// Returns true if any route carries its own handler.
    pub fn has_route_handlers(&self) -> bool {
        self.routes.iter().any(|r| r.handler.is_some())
    }

    pub fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    pub fn is_alive(&self) -> bool {
        !self.liveness.is_cancelled()
    }

    /// Route prefixes only, in match order.
    pub fn route_prefixes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.route.clone()).collect()
    }

    /// Encodes the health record.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a health record. Routes are re-sorted in case the writer
    /// kept a different order.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut service: Service = serde_json::from_str(raw)?;
        sort_routes(&mut service.routes);
        Ok(service)
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.ip_address == other.ip_address
            && self.port == other.port
            && self.routes == other.routes
    }
}

/// The unit of communication. Empty fields are left out of the JSON.
///
/// A message with a `response_channel` expects at most one reply; a reply
/// has none and is published on the original message's response channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "is_zero_timestamp")]
    pub timestamp: i64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg_id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_channel: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub route: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub from: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub to: String,

    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

fn is_zero_timestamp(ts: &i64) -> bool {
    *ts == 0
}

impl Message {
    /// Creates a message stamped with the current time and a fresh id.
    pub fn new(
        channel: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        route: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            msg_id: random_id(),
            response_channel: String::new(),
            channel: channel.into(),
            route: route.into(),
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    /// Returns true if the sender is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        !self.response_channel.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_with_routes(routes: &[&str]) -> Service {
        Service::new(
            ServiceId::from("id1"),
            ServiceName::from("web"),
            "10.0.0.5",
            8080,
            routes.iter().map(|r| ServiceRoute::new(*r)).collect(),
        )
    }

    #[test]
    fn test_random_id_shape() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_service_keys() {
        let svc = service_with_routes(&["/"]);
        assert_eq!(svc.key(), "service:web:id1");
        assert_eq!(svc.base_key(), "service:web");
    }

    #[test]
    fn test_routes_sorted_longest_first() {
        let svc = service_with_routes(&["/", "/api/v1", "/api"]);
        assert_eq!(svc.route_prefixes(), vec!["/api/v1", "/api", "/"]);
    }

    #[test]
    fn test_matching_route_prefers_longest_prefix() {
        let svc = service_with_routes(&["/api", "/api/users"]);

        assert!(svc.matches("/api/users/42"));
        assert_eq!(svc.matching_route("/api/users/42").unwrap().route, "/api/users");
        assert_eq!(svc.matching_route("/api/orders").unwrap().route, "/api");
        assert!(!svc.matches("/static/app.js"));
        assert!(svc.matching_route("/static/app.js").is_none());
    }

    #[test]
    fn test_route_handler_skips_routes_without_handler() {
        let handler = crate::dispatch::handler_fn(|_mesh, _msg| async {
            Ok::<(), hsu_common::Error>(())
        });
        let svc = Service::new(
            ServiceId::from("id1"),
            ServiceName::from("web"),
            "10.0.0.5",
            8080,
            vec![
                ServiceRoute::with_handler("/api", Arc::clone(&handler)),
                ServiceRoute::new("/api/admin"),
            ],
        );

        assert_eq!(svc.matching_route("/api/admin/x").unwrap().route, "/api/admin");
        let found = svc.route_handler("/api/admin/x").unwrap();
        assert!(Arc::ptr_eq(found, &handler));
        assert!(svc.route_handler("/other").is_none());
    }

    #[test]
    fn test_health_record_round_trip() {
        let svc = service_with_routes(&["/echo"]);
        let json = svc.to_json().unwrap();

        assert!(!json.contains("handler"));
        assert!(!json.contains("liveness"));

        let decoded = Service::from_json(&json).unwrap();
        assert_eq!(decoded, svc);
    }

    #[test]
    fn test_clones_share_liveness() {
        let svc = service_with_routes(&["/"]);
        let copy = svc.clone();
        assert!(copy.is_alive());

        svc.liveness().cancel();
        assert!(!copy.is_alive());
    }

    #[test]
    fn test_message_omits_empty_fields() {
        let msg = Message {
            route: "/echo".to_string(),
            ..Default::default()
        };
        assert_eq!(msg.to_json().unwrap(), r#"{"route":"/echo"}"#);
    }

    #[test]
    fn test_message_round_trip_keeps_set_fields() {
        let mut msg = Message::new("service:echo:a", "client", "service:echo:a", "/echo", json!({"text": "hi"}));
        msg.response_channel = format!("service:echo:a:response:{}", msg.msg_id);

        let decoded = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.expects_reply());
    }

    #[test]
    fn test_reply_does_not_expect_reply() {
        let msg = Message::new("chan", "a", "b", "/x", json!("pong"));
        assert!(!msg.expects_reply());
        assert!(!msg.to_json().unwrap().contains("response_channel"));
    }
}
