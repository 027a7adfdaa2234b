#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use recon_core::resources::{
    CacheConfig, CacheReconciler, CacheSku, NicSecurityGroupAssociationConfig,
    NicSecurityGroupAssociationReconciler,
};
use recon_core::{
    AssociationProtocol, Clock, Engine, InMemoryLockRegistry, MemoryRemote,
    PollConfig, Poller, ResourceId, Timeouts, TokioClock,
};
use serde_json::{Value, json};

pub const SUBSCRIPTION: &str = "sub1";

pub struct Harness {
    pub remote: Arc<MemoryRemote>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<InMemoryLockRegistry>,
    pub timeouts: Timeouts,
}

impl Harness {
    /// Tokio time. Tests using it run with time paused so polling and
    /// deadlines cost nothing.
    pub fn new() -> Self {
        Self::build(MemoryRemote::new(), Arc::new(TokioClock))
    }

    /// Real time with per-call latency so concurrent tasks interleave.
    pub fn concurrent(latency: Duration) -> Self {
        Self::build(MemoryRemote::new().with_latency(latency), Arc::new(TokioClock))
    }

    fn build(remote: MemoryRemote, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote: Arc::new(remote),
            clock,
            locks: Arc::new(InMemoryLockRegistry::new()),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn poller(&self) -> Poller {
        Poller::new(
            self.remote.clone(),
            Arc::clone(&self.clock),
            PollConfig {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(100),
                multiplier: 2.0,
            },
        )
    }

    pub fn cache_engine(&self) -> Engine<CacheReconciler> {
        let reconciler = CacheReconciler::new(
            SUBSCRIPTION,
            self.remote.clone(),
            self.locks.clone(),
            self.poller(),
        );
        Engine::new(
            Arc::new(reconciler),
            Arc::clone(&self.clock),
            self.timeouts.clone(),
        )
    }

    pub fn association_engine(&self) -> Engine<NicSecurityGroupAssociationReconciler> {
        let protocol = AssociationProtocol::new(self.remote.clone(), self.locks.clone(), self.poller());
        Engine::new(
            Arc::new(NicSecurityGroupAssociationReconciler::new(protocol)),
            Arc::clone(&self.clock),
            self.timeouts.clone(),
        )
    }

    /// Put a NIC with one primary ip configuration holding `groups`.
    pub async fn seed_nic(&self, name: &str, groups: &[String]) -> ResourceId {
        let id = ResourceId::parse(&nic_id(name)).unwrap();
        let groups: Vec<Value> = groups.iter().map(|g| json!({ "id": g })).collect();
        self.remote
            .insert(
                &id,
                json!({
                    "location": "westeurope",
                    "properties": {
                        "enableAcceleratedNetworking": true,
                        "ipConfigurations": [{
                            "name": "internal",
                            "properties": {
                                "primary": true,
                                "privateIPAddress": "10.0.0.4",
                                "applicationSecurityGroups": groups
                            }
                        }]
                    }
                }),
            )
            .await;
        id
    }

    /// Group ids currently attached to the NIC's primary ip configuration.
    pub async fn nic_groups(&self, nic: &ResourceId) -> Vec<String> {
        let body = self.remote.object(nic).await.unwrap();
        body["properties"]["ipConfigurations"][0]["properties"]["applicationSecurityGroups"]
            .as_array()
            .map(|groups| {
                groups
                    .iter()
                    .map(|g| g["id"].as_str().unwrap().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn nic_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/rg1/providers/Microsoft.Network/networkInterfaces/{}",
        SUBSCRIPTION, name
    )
}

pub fn asg_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/rg1/providers/Microsoft.Network/applicationSecurityGroups/{}",
        SUBSCRIPTION, name
    )
}

pub fn cache_resource_id(name: &str) -> ResourceId {
    ResourceId::parse(&format!(
        "/subscriptions/{}/resourceGroups/rg1/providers/Microsoft.Cache/redis/{}",
        SUBSCRIPTION, name
    ))
    .unwrap()
}

pub fn subnet_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/rg1/providers/Microsoft.Network/virtualNetworks/vnet1/subnets/{}",
        SUBSCRIPTION, name
    )
}

pub fn association(nic: &str, asg: &str) -> NicSecurityGroupAssociationConfig {
    NicSecurityGroupAssociationConfig {
        network_interface_id: nic_id(nic),
        application_security_group_id: asg_id(asg),
    }
}

pub fn cache(name: &str, sku: CacheSku, capacity: u8) -> CacheConfig {
    CacheConfig {
        name: name.to_string(),
        resource_group_name: "rg1".to_string(),
        location: "westeurope".to_string(),
        sku,
        capacity,
        shard_count: None,
        replicas_per_primary: None,
        non_ssl_port_enabled: false,
        subnet_id: None,
        tags: BTreeMap::new(),
    }
}
