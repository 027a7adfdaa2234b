//! Remote control-plane client.
//!
//! The engine talks to the control plane only through [`RemoteClient`]:
//! - [`MemoryRemote`]: in-process control plane for tests and dry runs
//! - [`HttpRemote`]: ARM-style REST over HTTPS

pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;
use crate::id::ResourceId;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

/// Opaque handle for a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHandle(pub String);

/// Outcome of submitting a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    /// The mutation finished within the initial call.
    Completed,
    /// The mutation continues remotely and must be polled.
    Pending(PollHandle),
}

/// Status of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress { retry_after: Option<Duration> },
    Succeeded,
    Failed { message: String },
    Canceled,
}

/// Get / CreateOrUpdate / Delete against the control plane.
///
/// Bodies are JSON-shaped models; typed decoding happens in the reconcilers.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch an object. `Ok(None)` means it does not exist.
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, RemoteError>;

    /// Create or fully replace an object.
    async fn create_or_update(&self, id: &ResourceId, body: Value)
    -> Result<Submitted, RemoteError>;

    /// Delete an object. A missing object is reported as a 404 status error.
    async fn delete(&self, id: &ResourceId) -> Result<Submitted, RemoteError>;

    /// Query a long-running operation.
    async fn poll(&self, handle: &PollHandle) -> Result<PollStatus, RemoteError>;
}
