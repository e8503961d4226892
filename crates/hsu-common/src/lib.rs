//! # HSU Common
//!
//! Common types shared across the HSU service mesh crates: the error type
//! every operation returns and the identifier newtypes used to build store
//! keys and pub/sub topics.

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{Error, Result, ResultExt};
pub use types::{ServiceId, ServiceName};
