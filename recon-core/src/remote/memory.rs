//! In-process control plane.
//!
//! Objects are keyed by their case-folded identifier. Mutations are applied
//! when they are accepted; long-running operations only delay the
//! acknowledgement, so a caller that gives up polling still observes the
//! mutation on its next `get`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{PollHandle, PollStatus, RemoteClient, Submitted};
use crate::error::{ParseError, RemoteError};
use crate::id::ResourceId;

/// Number of calls seen per method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u32,
    pub puts: u32,
    pub deletes: u32,
    pub polls: u32,
}

struct PendingOperation {
    remaining_polls: u32,
    failure: Option<String>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Value>,
    operations: HashMap<String, PendingOperation>,
    lro_polls: u32,
    fail_next: Option<RemoteError>,
    fail_next_operation: Option<String>,
    provisioning_reads: u32,
    // Objects still provisioning, with the number of reads left before they settle.
    settling: HashMap<String, u32>,
    calls: CallCounts,
}

/// In-memory [`RemoteClient`].
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call so concurrent callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Build a control plane pre-populated with `objects` (id → body).
    pub fn from_seed(objects: HashMap<String, Value>) -> Result<Self, ParseError> {
        let mut inner = Inner::default();
        for (raw, mut body) in objects {
            let id = ResourceId::parse(&raw)?;
            stamp_server_fields(&mut body, &id.to_string(), SUCCEEDED);
            inner.objects.insert(id.lowercase(), body);
        }
        Ok(Self {
            inner: Mutex::new(inner),
            latency: None,
        })
    }

    /// Mutations report completion only after `polls` poll calls.
    pub async fn set_lro_polls(&self, polls: u32) {
        self.inner.lock().await.lro_polls = polls;
    }

    /// Written objects report `Creating` or `Updating` for `reads` gets
    /// before they settle to `Succeeded`.
    pub async fn set_provisioning_reads(&self, reads: u32) {
        self.inner.lock().await.provisioning_reads = reads;
    }

    /// The next create/update or delete call fails with `err`.
    pub async fn fail_next(&self, err: RemoteError) {
        self.inner.lock().await.fail_next = Some(err);
    }

    /// The next long-running operation ends in the `Failed` state.
    pub async fn fail_next_operation(&self, message: impl Into<String>) {
        self.inner.lock().await.fail_next_operation = Some(message.into());
    }

    /// Store an object directly, bypassing the client surface.
    pub async fn insert(&self, id: &ResourceId, mut body: Value) {
        stamp_server_fields(&mut body, &id.to_string(), SUCCEEDED);
        let mut inner = self.inner.lock().await;
        inner.settling.remove(&id.lowercase());
        inner.objects.insert(id.lowercase(), body);
    }

    /// Remove an object directly, as an out-of-band deletion would.
    pub async fn remove(&self, id: &ResourceId) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        inner.settling.remove(&id.lowercase());
        inner.objects.remove(&id.lowercase())
    }

    /// Current body of an object without counting a call.
    pub async fn object(&self, id: &ResourceId) -> Option<Value> {
        self.inner.lock().await.objects.get(&id.lowercase()).cloned()
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    async fn pause(&self) {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn submit(inner: &mut Inner) -> Submitted {
        let failure = inner.fail_next_operation.take();
        if inner.lro_polls == 0 && failure.is_none() {
            return Submitted::Completed;
        }
        let handle = uuid::Uuid::new_v4().to_string();
        inner.operations.insert(
            handle.clone(),
            PendingOperation {
                remaining_polls: inner.lro_polls,
                failure,
            },
        );
        Submitted::Pending(PollHandle(handle))
    }
}

const SUCCEEDED: &str = "Succeeded";

fn stamp_server_fields(body: &mut Value, id: &str, provisioning_state: &str) {
    if let Value::Object(map) = body {
        map.insert("id".into(), Value::String(id.to_string()));
        if let Some(Value::Object(props)) = map.get_mut("properties") {
            props.insert(
                "provisioningState".into(),
                Value::String(provisioning_state.into()),
            );
        }
    }
}

fn stamp_provisioning_state(body: &mut Value, state: &str) {
    if let Some(Value::Object(props)) = body.get_mut("properties") {
        props.insert("provisioningState".into(), Value::String(state.into()));
    }
}

fn not_found(id: &ResourceId) -> RemoteError {
    RemoteError::Status {
        status: 404,
        code: Some("ResourceNotFound".into()),
        message: format!("resource {} was not found", id),
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, RemoteError> {
        let body = {
            let mut inner = self.inner.lock().await;
            inner.calls.gets += 1;
            let key = id.lowercase();
            match inner.settling.get(&key).copied() {
                Some(0) => {
                    inner.settling.remove(&key);
                    if let Some(body) = inner.objects.get_mut(&key) {
                        stamp_provisioning_state(body, SUCCEEDED);
                    }
                }
                Some(left) => {
                    inner.settling.insert(key.clone(), left - 1);
                }
                None => {}
            }
            inner.objects.get(&key).cloned()
        };
        self.pause().await;
        Ok(body)
    }

    async fn create_or_update(
        &self,
        id: &ResourceId,
        mut body: Value,
    ) -> Result<Submitted, RemoteError> {
        self.pause().await;
        let mut inner = self.inner.lock().await;
        inner.calls.puts += 1;
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        if !body.is_object() {
            return Err(RemoteError::Status {
                status: 400,
                code: Some("InvalidRequestContent".into()),
                message: "request body must be a JSON object".into(),
            });
        }

        let key = id.lowercase();
        let existing = inner.objects.get(&key);
        // The first writer's casing of the identifier sticks.
        let stored_id = existing
            .and_then(|existing| existing.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string());
        let provisioning_state = match (inner.provisioning_reads, existing) {
            (0, _) => SUCCEEDED,
            (_, Some(_)) => "Updating",
            (_, None) => "Creating",
        };
        stamp_server_fields(&mut body, &stored_id, provisioning_state);
        debug!("memory remote: put {} ({})", stored_id, provisioning_state);
        if inner.provisioning_reads > 0 {
            let reads = inner.provisioning_reads;
            inner.settling.insert(key.clone(), reads);
        }
        inner.objects.insert(key, body);
        Ok(Self::submit(&mut inner))
    }

    async fn delete(&self, id: &ResourceId) -> Result<Submitted, RemoteError> {
        self.pause().await;
        let mut inner = self.inner.lock().await;
        inner.calls.deletes += 1;
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        inner.settling.remove(&id.lowercase());
        if inner.objects.remove(&id.lowercase()).is_none() {
            return Err(not_found(id));
        }
        debug!("memory remote: deleted {}", id);
        Ok(Self::submit(&mut inner))
    }

    async fn poll(&self, handle: &PollHandle) -> Result<PollStatus, RemoteError> {
        let mut inner = self.inner.lock().await;
        inner.calls.polls += 1;
        let Some(op) = inner.operations.get_mut(&handle.0) else {
            return Err(RemoteError::Status {
                status: 404,
                code: Some("OperationNotFound".into()),
                message: format!("operation {} is unknown", handle.0),
            });
        };

        if op.remaining_polls > 0 {
            op.remaining_polls -= 1;
            return Ok(PollStatus::InProgress { retry_after: None });
        }

        let status = match op.failure.take() {
            Some(message) => PollStatus::Failed { message },
            None => PollStatus::Succeeded,
        };
        inner.operations.remove(&handle.0);
        Ok(status)
    }
}
