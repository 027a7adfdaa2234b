//! Resource lifecycle: the reconciler seam, persisted state and the state machine.
//!
//! Each resource kind implements [`Reconciler`]; [`Engine`] drives it through
//! create / read / update / delete / import with drift detection, cross-field
//! validation and state migration.

pub mod diff;
pub mod engine;
pub mod migrate;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, ParseError, Result};
use crate::poll::Deadline;

pub use diff::{ChangeSet, DiffPlan, Tier, is_downgrade, validate_tier};
pub use engine::{Action, ApplyOutcome, Engine};
pub use migrate::{StateUpgrader, migrate};

/// Where a resource instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    NotCreated,
    Creating,
    Present,
    Updating,
    Deleting,
    Gone,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotCreated, Creating)
                | (Creating, Present)
                | (Creating, NotCreated)
                | (Present, Updating)
                | (Present, Deleting)
                | (Present, Gone)
                | (Updating, Present)
                | (Deleting, Gone)
                | (Deleting, Present)
                | (Gone, Creating)
        )
    }
}

/// Transition log for one resource during one pass.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    id: String,
    history: Vec<LifecycleState>,
}

impl Lifecycle {
    pub fn new(id: impl Into<String>, initial: LifecycleState) -> Self {
        Self {
            id: id.into(),
            history: vec![initial],
        }
    }

    pub fn state(&self) -> LifecycleState {
        // history always holds the initial state
        self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Record the identifier once it is known (after create).
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn advance(&mut self, next: LifecycleState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(Error::Lifecycle {
                id: self.id.clone(),
                from,
                to: next,
            });
        }
        debug!("{}: {:?} -> {:?}", self.id, from, next);
        self.history.push(next);
        Ok(())
    }
}

/// Persisted state of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub schema_version: u32,
    pub id: String,
    /// Last flattened attribute values.
    pub attributes: Value,
}

impl ResourceState {
    pub fn encode(&self) -> std::result::Result<Vec<u8>, ParseError> {
        serde_json::to_vec(self).map_err(|e| ParseError::MalformedState {
            resource_type: String::new(),
            reason: e.to_string(),
        })
    }

    pub fn decode(resource_type: &str, bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        serde_json::from_slice(bytes).map_err(|e| ParseError::MalformedState {
            resource_type: resource_type.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One resource kind's lifecycle operations.
///
/// Implementations talk to the control plane; [`Engine`] decides which
/// operation to run and when.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Typed configuration, decoded once at the boundary.
    type Config: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync;

    const RESOURCE_TYPE: &'static str;
    /// Current shape of persisted attributes.
    const SCHEMA_VERSION: u32 = 0;
    /// Attributes whose change forces delete-then-create.
    const FORCE_NEW_FIELDS: &'static [&'static str] = &[];
    /// Attributes compared case-insensitively when diffing.
    const CASE_INSENSITIVE_FIELDS: &'static [&'static str] = &[];

    /// Validate an identifier supplied for import and return its canonical form.
    fn parse_id(&self, raw: &str) -> std::result::Result<String, ParseError>;

    /// Identifier the configuration addresses.
    fn id_for(&self, config: &Self::Config) -> Result<String>;

    /// Cross-field checks the schema cannot express. Runs before any mutation.
    fn customize_diff(&self, _old: Option<&Self::Config>, _new: &Self::Config) -> Result<DiffPlan> {
        Ok(DiffPlan::default())
    }

    /// Upgraders for older persisted shapes, one per source version.
    fn upgraders(&self) -> Vec<Box<dyn StateUpgrader>> {
        Vec::new()
    }

    async fn exists(&self, id: &str, deadline: &Deadline) -> Result<bool> {
        Ok(self.read(id, deadline).await?.is_some())
    }

    /// Create the resource and return its identifier.
    async fn create(&self, config: &Self::Config, deadline: &Deadline) -> Result<String>;

    /// Flatten the remote object. `None` when it no longer exists.
    async fn read(&self, id: &str, deadline: &Deadline) -> Result<Option<Self::Config>>;

    /// Apply `changes` on top of the current remote object.
    async fn update(
        &self,
        id: &str,
        config: &Self::Config,
        changes: &ChangeSet,
        deadline: &Deadline,
    ) -> Result<()>;

    /// Delete the resource. Not-found counts as success.
    async fn delete(&self, id: &str, deadline: &Deadline) -> Result<()>;
}
