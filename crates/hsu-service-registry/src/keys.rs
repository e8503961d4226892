//! Store key and topic layout.
//!
//! | Key / topic | Purpose |
//! |---|---|
//! | `service:<name>:<id>:presence` | existence marker, value is the id |
//! | `service:<name>:<id>:health` | JSON service record |
//! | `service:<name>:<id>:routes` | set of route prefixes |
//! | `service:<name>:<id>` | topic for one instance |
//! | `service:<name>` | topic shared by every instance of a name |
//! | `<channel>:response:<msg_id>` | one-shot reply topic |
//!
//! An optional namespace is prepended (`<ns>:service:...`) so several meshes
//! can share one store.

use crate::types::Service;
use hsu_common::{ServiceId, ServiceName};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    namespace: Option<String>,
}

impl KeySpace {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn qualify(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    fn instance_key(name: &ServiceName, id: &ServiceId) -> String {
        format!("service:{}:{}", name, id)
    }

    pub fn presence_key(&self, name: &ServiceName, id: &ServiceId) -> String {
        self.qualify(&format!("{}:presence", Self::instance_key(name, id)))
    }

    pub fn health_key(&self, name: &ServiceName, id: &ServiceId) -> String {
        self.qualify(&format!("{}:health", Self::instance_key(name, id)))
    }

    pub fn routes_key(&self, name: &ServiceName, id: &ServiceId) -> String {
        self.qualify(&format!("{}:routes", Self::instance_key(name, id)))
    }

    /// The three keys refreshed on every heartbeat.
    pub fn service_keys(&self, service: &Service) -> [String; 3] {
        [
            self.presence_key(&service.name, &service.id),
            self.health_key(&service.name, &service.id),
            self.routes_key(&service.name, &service.id),
        ]
    }

    /// Glob matching every presence key.
    pub fn presence_pattern(&self) -> String {
        self.qualify("service:*:*:presence")
    }

    /// Topic addressing a single instance.
    pub fn instance_topic(&self, service: &Service) -> String {
        self.qualify(&service.key())
    }

    /// Topic addressing every instance sharing `name`.
    pub fn name_topic(&self, name: &ServiceName) -> String {
        self.qualify(&format!("service:{}", name))
    }

    /// One-shot reply topic for a request published on `channel`.
    pub fn response_topic(channel: &str, msg_id: &str) -> String {
        format!("{}:response:{}", channel, msg_id)
    }

    /// Extracts the service name from a presence key.
    pub fn parse_presence_key(&self, key: &str) -> Option<ServiceName> {
        let local = match &self.namespace {
            Some(ns) => key.strip_prefix(ns.as_str())?.strip_prefix(':')?,
            None => key,
        };
        let parts: Vec<&str> = local.split(':').collect();
        match parts.as_slice() {
            ["service", name, _id, "presence"] if !name.is_empty() => {
                Some(ServiceName::from(*name))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_and_id() -> (ServiceName, ServiceId) {
        (ServiceName::from("echo"), ServiceId::from("abc123"))
    }

    #[test]
    fn test_default_layout() {
        let keys = KeySpace::default();
        let (name, id) = name_and_id();

        assert_eq!(keys.presence_key(&name, &id), "service:echo:abc123:presence");
        assert_eq!(keys.health_key(&name, &id), "service:echo:abc123:health");
        assert_eq!(keys.routes_key(&name, &id), "service:echo:abc123:routes");
        assert_eq!(keys.presence_pattern(), "service:*:*:presence");
        assert_eq!(keys.name_topic(&name), "service:echo");
        assert_eq!(
            KeySpace::response_topic("service:echo:abc123", "m1"),
            "service:echo:abc123:response:m1"
        );
    }

    #[test]
    fn test_namespaced_layout() {
        let keys = KeySpace::new(Some("staging".to_string()));
        let (name, id) = name_and_id();

        assert_eq!(keys.presence_key(&name, &id), "staging:service:echo:abc123:presence");
        assert_eq!(keys.presence_pattern(), "staging:service:*:*:presence");
        assert_eq!(keys.name_topic(&name), "staging:service:echo");
    }

    #[test]
    fn test_empty_namespace_is_ignored() {
        assert_eq!(KeySpace::new(Some(String::new())), KeySpace::default());
    }

    #[test]
    fn test_parse_presence_key() {
        let keys = KeySpace::default();
        assert_eq!(
            keys.parse_presence_key("service:echo:abc123:presence"),
            Some(ServiceName::from("echo"))
        );
        assert_eq!(keys.parse_presence_key("service:echo:abc123:health"), None);
        assert_eq!(keys.parse_presence_key("other:echo:abc123:presence"), None);

        let namespaced = KeySpace::new(Some("ns".to_string()));
        assert_eq!(
            namespaced.parse_presence_key("ns:service:work:x:presence"),
            Some(ServiceName::from("work"))
        );
        assert_eq!(namespaced.parse_presence_key("service:work:x:presence"), None);
    }
}
