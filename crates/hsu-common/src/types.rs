//! Identifier types shared across the mesh.
//!
//! Names and ids end up embedded in store keys and pub/sub topics
//! (`service:<name>:<id>`), so both are kept as distinct newtypes to avoid
//! mixing them up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical service name. Several instances (replicas) may share one name.
///
/// # Example
/// ```
/// use hsu_common::ServiceName;
///
/// let name = ServiceName::from("echo");
/// assert_eq!(name.as_str(), "echo");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    /// Creates a new ServiceName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name can be embedded in a store key.
    ///
    /// Keys are split on `:`, so a name must be non-empty and colon free.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(':')
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque instance identifier, unique within a service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates a new ServiceId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name() {
        let name = ServiceName::from("echo");
        assert_eq!(name.as_str(), "echo");
        assert_eq!(name.to_string(), "echo");
        assert!(name.is_valid());
    }

    #[test]
    fn test_service_name_validity() {
        assert!(!ServiceName::from("").is_valid());
        assert!(!ServiceName::from("a:b").is_valid());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = ServiceId::from("k3j9x");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"k3j9x\"");

        let name: ServiceName = serde_json::from_str("\"work\"").unwrap();
        assert_eq!(name, ServiceName::from("work"));
    }
}
