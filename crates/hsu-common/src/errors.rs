//! Error types for the HSU service mesh.
//!
//! Every fallible operation in the mesh returns [`Result<T>`]. Registration
//! and resolution failures reach the caller; background work (heartbeats,
//! inbound dispatch) logs these errors and carries on with the next cycle.
//!
//! ```rust
//! use hsu_common::{Error, Result};
//!
//! fn resolve(path: &str) -> Result<()> {
//!     Err(Error::service_not_found(path))
//! }
//!
//! assert!(resolve("/missing").is_err());
//! ```

use crate::types::{ServiceId, ServiceName};
use thiserror::Error;

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mesh operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A service with the same name and id is already registered locally.
    #[error("Service already exists: name={name}, id={id}")]
    DuplicateService {
        name: ServiceName,
        id: ServiceId,
    },

    /// No live service claims a route that prefixes the requested path.
    #[error("Service not found for path: {path}")]
    ServiceNotFound {
        path: String,
    },

    /// A message or health record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The key/value store rejected or failed an operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid input or configuration.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
    },

    /// The recurring task scheduler refused a task.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a DuplicateService error.
    pub fn duplicate_service(name: ServiceName, id: ServiceId) -> Self {
        Self::DuplicateService { name, id }
    }

    /// Creates a ServiceNotFound error.
    pub fn service_not_found(path: impl Into<String>) -> Self {
        Self::ServiceNotFound { path: path.into() }
    }

    /// Creates a StoreUnavailable error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Creates a Serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Creates a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true for failures that are worth retrying on the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::Io(_) => true,
            Self::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Adds context to an error.
    ///
    /// # Example
    /// ```
    /// use hsu_common::{Error, Result};
    ///
    /// fn inner() -> Result<()> {
    ///     Err(Error::store("connection refused"))
    /// }
    ///
    /// fn outer() -> Result<()> {
    ///     inner().map_err(|e| e.context("Failed to refresh presence"))
    /// }
    /// ```
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::WithContext {
            message: message.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// Convenience methods for Result types
pub trait ResultExt<T> {
    /// Adds context to an error result.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::service_not_found("/echo");
        assert!(matches!(err, Error::ServiceNotFound { .. }));
        assert_eq!(err.to_string(), "Service not found for path: /echo");
    }

    #[test]
    fn test_error_context() {
        let err = Error::store("connection refused").context("Heartbeat failed");

        let error_message = err.to_string();
        assert!(error_message.contains("Heartbeat failed"));
        assert!(error_message.contains("connection refused"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = Error::duplicate_service(ServiceName::from("echo"), ServiceId::from("abc"));

        match err {
            Error::DuplicateService { name, id } => {
                assert_eq!(name.as_str(), "echo");
                assert_eq!(id.as_str(), "abc");
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_transient());
    }
}
