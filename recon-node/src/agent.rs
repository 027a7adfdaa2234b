//! Applies manifests against the control plane and keeps the state file in step.

use std::collections::HashSet;
use std::sync::Arc;

use recon_core::resources::{CacheReconciler, NicSecurityGroupAssociationReconciler};
use recon_core::{
    Action, AssociationProtocol, Clock, Engine, EngineConfig, InMemoryLockRegistry, LockRegistry,
    Poller, RemoteClient, ResourceState, TokioClock,
};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::manifest::{Desired, Kind, Manifest, StateEntry, StateFile};

/// Per-resource failures from one pass.
#[derive(Debug, Default)]
pub struct Report {
    pub failed: Vec<(String, String)>,
}

impl Report {
    fn fail(&mut self, name: &str, err: impl std::fmt::Display) {
        self.failed.push((name.to_string(), err.to_string()));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Applied(ResourceState, Action),
    Failed(recon_core::Error),
}

#[derive(Clone)]
pub struct Agent {
    caches: Engine<CacheReconciler>,
    associations: Engine<NicSecurityGroupAssociationReconciler>,
}

impl Agent {
    pub fn new(remote: Arc<dyn RemoteClient>, subscription_id: &str, config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let poller = Poller::new(Arc::clone(&remote), Arc::clone(&clock), config.poll.clone());
        // One registry for every kind, so kinds touching the same network objects serialize.
        let locks: Arc<dyn LockRegistry> = Arc::new(InMemoryLockRegistry::new());
        let protocol = AssociationProtocol::new(Arc::clone(&remote), Arc::clone(&locks), poller.clone());

        Self {
            caches: Engine::new(
                Arc::new(CacheReconciler::new(subscription_id, remote, locks, poller)),
                Arc::clone(&clock),
                config.timeouts.clone(),
            ),
            associations: Engine::new(
                Arc::new(NicSecurityGroupAssociationReconciler::new(protocol)),
                clock,
                config.timeouts,
            ),
        }
    }

    async fn apply_one(&self, desired: &Desired, prior: Option<ResourceState>) -> Outcome {
        let result = match desired {
            Desired::RedisCache(config) => self.caches.apply(prior, config).await,
            Desired::NicSecurityGroupAssociation(config) => {
                self.associations.apply(prior, config).await
            }
        };
        match result {
            Ok(outcome) => Outcome::Applied(outcome.state, outcome.action),
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn refresh_one(&self, kind: Kind, state: ResourceState) -> recon_core::Result<Option<ResourceState>> {
        match kind {
            Kind::RedisCache => self.caches.refresh(state).await,
            Kind::NicSecurityGroupAssociation => self.associations.refresh(state).await,
        }
    }

    async fn destroy_one(&self, kind: Kind, state: ResourceState) -> recon_core::Result<()> {
        match kind {
            Kind::RedisCache => self.caches.destroy(state).await,
            Kind::NicSecurityGroupAssociation => self.associations.destroy(state).await,
        }
    }

    /// Reconcile every manifest entry, then prune state entries the manifest dropped.
    pub async fn apply(&self, manifest: &Manifest, state: &mut StateFile) -> Report {
        info!("Applying manifest ({} resources)", manifest.resources.len());
        let mut report = Report::default();

        // A kind change is a different resource: remove the old one first.
        for resource in &manifest.resources {
            let changed = state
                .resources
                .get(&resource.name)
                .is_some_and(|entry| entry.kind != resource.desired.kind());
            if changed {
                if let Some(entry) = state.resources.remove(&resource.name) {
                    info!("Pruning {} (kind changed)", resource.name);
                    if let Err(e) = self.destroy_one(entry.kind, entry.state.clone()).await {
                        error!("Failed to prune {}: {}", resource.name, e);
                        report.fail(&resource.name, &e);
                        state.resources.insert(resource.name.clone(), entry);
                    }
                }
            }
        }

        let mut tasks = JoinSet::new();
        for resource in &manifest.resources {
            let prior = match state.resources.get(&resource.name) {
                Some(entry) if entry.kind == resource.desired.kind() => Some(entry.state.clone()),
                Some(_) => continue,
                None => None,
            };
            let agent = self.clone();
            let name = resource.name.clone();
            let desired = resource.desired.clone();
            tasks.spawn(async move {
                let outcome = agent.apply_one(&desired, prior).await;
                (name, desired.kind(), outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, kind, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Reconcile task panicked: {}", e);
                    report.fail("<task>", e);
                    continue;
                }
            };
            match outcome {
                Outcome::Applied(new_state, action) => {
                    info!("{}: {:?} {}", name, action, new_state.id);
                    state.resources.insert(name, StateEntry { kind, state: new_state });
                }
                Outcome::Failed(e) => {
                    error!("Reconciliation failed for {}: {}", name, e);
                    report.fail(&name, e);
                }
            }
        }

        let desired: HashSet<&str> = manifest.resources.iter().map(|r| r.name.as_str()).collect();
        let stale: Vec<String> = state
            .resources
            .keys()
            .filter(|name| !desired.contains(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            let Some(entry) = state.resources.get(&name) else {
                continue;
            };
            info!("Pruning {} {}", name, entry.state.id);
            match self.destroy_one(entry.kind, entry.state.clone()).await {
                Ok(()) => {
                    state.resources.remove(&name);
                }
                Err(e) => {
                    error!("Failed to prune {}: {}", name, e);
                    report.fail(&name, e);
                }
            }
        }

        report
    }

    /// Re-read every state entry, dropping those that no longer exist.
    pub async fn refresh(&self, state: &mut StateFile) -> Report {
        let mut report = Report::default();
        let names: Vec<String> = state.resources.keys().cloned().collect();
        for name in names {
            let Some(entry) = state.resources.get(&name) else {
                continue;
            };
            let kind = entry.kind;
            match self.refresh_one(kind, entry.state.clone()).await {
                Ok(Some(fresh)) => {
                    state.resources.insert(name, StateEntry { kind, state: fresh });
                }
                Ok(None) => {
                    info!("{} is gone, dropping it from state", name);
                    state.resources.remove(&name);
                }
                Err(e) => {
                    error!("Refresh failed for {}: {}", name, e);
                    report.fail(&name, e);
                }
            }
        }
        report
    }

    /// Delete everything recorded in state.
    pub async fn destroy(&self, state: &mut StateFile) -> Report {
        let mut report = Report::default();
        let mut tasks = JoinSet::new();
        for (name, entry) in &state.resources {
            let agent = self.clone();
            let name = name.clone();
            let entry = entry.clone();
            tasks.spawn(async move {
                let result = agent.destroy_one(entry.kind, entry.state).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    info!("Destroyed {}", name);
                    state.resources.remove(&name);
                }
                Ok((name, Err(e))) => {
                    error!("Destroy failed for {}: {}", name, e);
                    report.fail(&name, e);
                }
                Err(e) => {
                    error!("Destroy task panicked: {}", e);
                    report.fail("<task>", e);
                }
            }
        }
        report
    }

    /// Adopt an existing remote object under `name`.
    pub async fn import(
        &self,
        state: &mut StateFile,
        name: &str,
        kind: Kind,
        id: &str,
    ) -> recon_core::Result<()> {
        let imported = match kind {
            Kind::RedisCache => self.caches.import(id).await?,
            Kind::NicSecurityGroupAssociation => self.associations.import(id).await?,
        };
        info!("Imported {} as {}", imported.id, name);
        state.resources.insert(
            name.to_string(),
            StateEntry {
                kind,
                state: imported,
            },
        );
        Ok(())
    }
}
