//! Drives a [`Reconciler`] from prior state and desired configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::error::{Error, ParseError, Result};
use crate::lifecycle::{ChangeSet, Lifecycle, LifecycleState, Reconciler, ResourceState, migrate};
use crate::poll::{Clock, Deadline};

/// What `apply` did to the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub state: ResourceState,
    pub action: Action,
    /// Fields that differed from the refreshed state.
    pub changes: ChangeSet,
    /// States visited during the pass, in order.
    pub lifecycle: Vec<LifecycleState>,
}

pub struct Engine<R: Reconciler> {
    reconciler: Arc<R>,
    clock: Arc<dyn Clock>,
    timeouts: Timeouts,
}

impl<R: Reconciler> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            clock: Arc::clone(&self.clock),
            timeouts: self.timeouts.clone(),
        }
    }
}

impl<R: Reconciler> Engine<R> {
    pub fn new(reconciler: Arc<R>, clock: Arc<dyn Clock>, timeouts: Timeouts) -> Self {
        Self {
            reconciler,
            clock,
            timeouts,
        }
    }

    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    fn deadline(&self, budget: Duration) -> Deadline {
        Deadline::after(self.clock.as_ref(), budget)
    }

    /// Upgrade persisted state to the current schema version.
    pub fn migrate(&self, state: ResourceState) -> Result<ResourceState> {
        let upgraders = self.reconciler.upgraders();
        Ok(migrate(R::RESOURCE_TYPE, state, &upgraders, R::SCHEMA_VERSION)?)
    }

    fn to_attributes(config: &R::Config) -> Result<Value> {
        serde_json::to_value(config).map_err(|e| malformed(R::RESOURCE_TYPE, e).into())
    }

    fn to_state(&self, id: String, config: &R::Config) -> Result<ResourceState> {
        Ok(ResourceState {
            schema_version: R::SCHEMA_VERSION,
            id,
            attributes: Self::to_attributes(config)?,
        })
    }

    /// Decode the typed configuration out of persisted attributes.
    pub fn config_of(&self, state: &ResourceState) -> Result<R::Config> {
        serde_json::from_value(state.attributes.clone()).map_err(|e| malformed(R::RESOURCE_TYPE, e).into())
    }

    /// Re-read the remote object behind `state`.
    ///
    /// Returns `None` when it has disappeared; the caller drops it from state.
    pub async fn refresh(&self, state: ResourceState) -> Result<Option<ResourceState>> {
        let state = self.migrate(state)?;
        let deadline = self.deadline(self.timeouts.read);
        match self.reconciler.read(&state.id, &deadline).await? {
            Some(config) => Ok(Some(self.to_state(state.id, &config)?)),
            None => {
                info!(
                    "{} {} no longer exists, removing from state",
                    R::RESOURCE_TYPE,
                    state.id
                );
                Ok(None)
            }
        }
    }

    /// Bring the remote object in line with `desired`.
    pub async fn apply(
        &self,
        prior: Option<ResourceState>,
        desired: &R::Config,
    ) -> Result<ApplyOutcome> {
        let had_prior = prior.is_some();
        let prior = prior.map(|state| self.migrate(state)).transpose()?;

        // Invariant violations surface before anything reaches the remote.
        let recorded = prior.as_ref().map(|state| self.config_of(state)).transpose()?;
        self.reconciler.customize_diff(recorded.as_ref(), desired)?;

        let current = match prior {
            Some(state) => self.refresh(state).await?,
            None => None,
        };

        let Some(current) = current else {
            let mut lifecycle = if had_prior {
                let mut lifecycle = Lifecycle::new(self.reconciler.id_for(desired)?, LifecycleState::Present);
                lifecycle.advance(LifecycleState::Gone)?;
                lifecycle
            } else {
                Lifecycle::new(self.reconciler.id_for(desired)?, LifecycleState::NotCreated)
            };
            self.reconciler.customize_diff(None, desired)?;
            let state = self.create(&mut lifecycle, desired).await?;
            return Ok(ApplyOutcome {
                state,
                action: Action::Created,
                changes: ChangeSet::default(),
                lifecycle: lifecycle.history().to_vec(),
            });
        };

        let desired_attributes = Self::to_attributes(desired)?;
        let changes = ChangeSet::between(
            &current.attributes,
            &desired_attributes,
            R::CASE_INSENSITIVE_FIELDS,
        );
        let mut lifecycle = Lifecycle::new(current.id.clone(), LifecycleState::Present);

        if changes.is_empty() {
            debug!("{} {} is up to date", R::RESOURCE_TYPE, current.id);
            return Ok(ApplyOutcome {
                state: current,
                action: Action::Unchanged,
                changes,
                lifecycle: lifecycle.history().to_vec(),
            });
        }

        let old = self.config_of(&current)?;
        let plan = self.reconciler.customize_diff(Some(&old), desired)?;
        let force_new = changes.touches_any(R::FORCE_NEW_FIELDS);

        if plan.requires_replace || force_new {
            info!(
                "Replacing {} {} (changed: {}{}{})",
                R::RESOURCE_TYPE,
                current.id,
                changes,
                if plan.reasons.is_empty() { "" } else { "; " },
                plan.reasons.join("; ")
            );
            lifecycle.advance(LifecycleState::Deleting)?;
            let deadline = self.deadline(self.timeouts.delete);
            self.reconciler.delete(&current.id, &deadline).await?;
            lifecycle.advance(LifecycleState::Gone)?;

            let state = self.create(&mut lifecycle, desired).await?;
            return Ok(ApplyOutcome {
                state,
                action: Action::Replaced,
                changes,
                lifecycle: lifecycle.history().to_vec(),
            });
        }

        info!(
            "Updating {} {} (changed: {})",
            R::RESOURCE_TYPE,
            current.id,
            changes
        );
        lifecycle.advance(LifecycleState::Updating)?;
        let deadline = self.deadline(self.timeouts.update);
        self.reconciler
            .update(&current.id, desired, &changes, &deadline)
            .await?;
        let state = self.read_back(current.id, desired).await?;
        lifecycle.advance(LifecycleState::Present)?;

        Ok(ApplyOutcome {
            state,
            action: Action::Updated,
            changes,
            lifecycle: lifecycle.history().to_vec(),
        })
    }

    async fn create(&self, lifecycle: &mut Lifecycle, desired: &R::Config) -> Result<ResourceState> {
        lifecycle.advance(LifecycleState::Creating)?;
        let deadline = self.deadline(self.timeouts.create);
        let id = self.reconciler.create(desired, &deadline).await?;
        lifecycle.set_id(id.clone());
        info!("Created {} {}", R::RESOURCE_TYPE, id);

        let state = self.read_back(id, desired).await?;
        lifecycle.advance(LifecycleState::Present)?;
        Ok(state)
    }

    /// Refresh after a mutation so state reflects what the server stored.
    async fn read_back(&self, id: String, desired: &R::Config) -> Result<ResourceState> {
        let deadline = self.deadline(self.timeouts.read);
        match self.reconciler.read(&id, &deadline).await? {
            Some(config) => self.to_state(id, &config),
            None => {
                warn!(
                    "{} {} not visible after write, recording desired configuration",
                    R::RESOURCE_TYPE,
                    id
                );
                self.to_state(id, desired)
            }
        }
    }

    /// Delete the remote object behind `state`.
    pub async fn destroy(&self, state: ResourceState) -> Result<()> {
        let state = self.migrate(state)?;
        let mut lifecycle = Lifecycle::new(state.id.clone(), LifecycleState::Present);
        lifecycle.advance(LifecycleState::Deleting)?;
        let deadline = self.deadline(self.timeouts.delete);
        self.reconciler.delete(&state.id, &deadline).await?;
        lifecycle.advance(LifecycleState::Gone)?;
        info!("Deleted {} {}", R::RESOURCE_TYPE, state.id);
        Ok(())
    }

    /// Adopt an existing remote object by identifier.
    pub async fn import(&self, raw_id: &str) -> Result<ResourceState> {
        let id = self.reconciler.parse_id(raw_id)?;
        let deadline = self.deadline(self.timeouts.read);
        match self.reconciler.read(&id, &deadline).await? {
            Some(config) => {
                info!("Imported {} {}", R::RESOURCE_TYPE, id);
                self.to_state(id, &config)
            }
            None => Err(Error::ImportNotFound {
                resource_type: R::RESOURCE_TYPE,
                id,
            }),
        }
    }

    pub async fn exists(&self, state: &ResourceState) -> Result<bool> {
        let state = self.migrate(state.clone())?;
        let deadline = self.deadline(self.timeouts.read);
        self.reconciler.exists(&state.id, &deadline).await
    }
}

fn malformed(resource_type: &str, e: serde_json::Error) -> ParseError {
    ParseError::MalformedState {
        resource_type: resource_type.to_string(),
        reason: e.to_string(),
    }
}
