//! Managed Redis cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Operation, ParseError, RemoteError, Result};
use crate::id::{IdPattern, ResourceId, Segment, take_values};
use crate::lifecycle::{
    ChangeSet, DiffPlan, Reconciler, ResourceState, StateUpgrader, Tier, is_downgrade, validate_tier,
};
use crate::locks::{LockGuard, LockRegistry};
use crate::poll::{Deadline, Poller};
use crate::remote::RemoteClient;
use crate::resources::network_interface::SubnetId;

pub const RESOURCE_TYPE: &str = "azurerm_redis_cache";

/// States a cache passes through before an accepted change has landed.
const SETTLING_STATES: &[&str] = &["Scaling", "Updating", "Creating", "UpgradingRedisServerVersion"];
const SETTLED_STATE: &str = "Succeeded";

const PATTERN: IdPattern = IdPattern::new(
    "redis cache",
    &[
        Segment::Named {
            key: "subscriptions",
            name: "subscription_id",
        },
        Segment::Named {
            key: "resourceGroups",
            name: "resource_group",
        },
        Segment::Static {
            key: "providers",
            value: "Microsoft.Cache",
        },
        Segment::Named {
            key: "redis",
            name: "name",
        },
    ],
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheId {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl CacheId {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }

    pub fn parse(input: &str) -> std::result::Result<Self, ParseError> {
        let (_, values) = PATTERN.parse(input)?;
        let [subscription_id, resource_group, name] = take_values(&PATTERN, input, values)?;
        Ok(Self {
            subscription_id,
            resource_group,
            name,
        })
    }

    pub fn resource_id(&self) -> std::result::Result<ResourceId, ParseError> {
        PATTERN.format(&[&self.subscription_id, &self.resource_group, &self.name])
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Cache/redis/{}",
            self.subscription_id, self.resource_group, self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSku {
    Basic,
    Standard,
    Premium,
}

impl CacheSku {
    fn family(self) -> &'static str {
        match self {
            CacheSku::Basic | CacheSku::Standard => "C",
            CacheSku::Premium => "P",
        }
    }

    fn capacity_range(self) -> (u8, u8) {
        match self {
            CacheSku::Basic | CacheSku::Standard => (0, 6),
            CacheSku::Premium => (1, 5),
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [CacheSku::Basic, CacheSku::Standard, CacheSku::Premium]
            .into_iter()
            .find(|sku| sku.to_string().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for CacheSku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheSku::Basic => "Basic",
            CacheSku::Standard => "Standard",
            CacheSku::Premium => "Premium",
        };
        f.write_str(name)
    }
}

impl Tier for CacheSku {
    fn rank(self) -> u8 {
        match self {
            CacheSku::Basic => 1,
            CacheSku::Standard => 2,
            CacheSku::Premium => 3,
        }
    }
}

/// Desired configuration of a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub name: String,
    pub resource_group_name: String,
    pub location: String,
    pub sku: CacheSku,
    pub capacity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_per_primary: Option<u32>,
    #[serde(default)]
    pub non_ssl_port_enabled: bool,
    /// Subnet the cache is injected into. Premium only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

// ============================================================================
// Remote model
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    properties: CacheProperties,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sku: Option<SkuModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enable_non_ssl_port: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shard_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replicas_per_primary: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subnet_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkuModel {
    name: String,
    family: String,
    capacity: u8,
}

impl SkuModel {
    fn new(sku: CacheSku, capacity: u8) -> Self {
        Self {
            name: sku.to_string(),
            family: sku.family().to_string(),
            capacity,
        }
    }
}

fn expand(config: &CacheConfig) -> CacheModel {
    CacheModel {
        location: Some(config.location.clone()),
        tags: Some(config.tags.clone()),
        properties: CacheProperties {
            sku: Some(SkuModel::new(config.sku, config.capacity)),
            enable_non_ssl_port: Some(config.non_ssl_port_enabled),
            shard_count: config.shard_count,
            replicas_per_primary: config.replicas_per_primary,
            subnet_id: config.subnet_id.clone(),
            extra: Map::new(),
        },
        extra: Map::new(),
    }
}

fn flatten(id: &CacheId, model: CacheModel) -> std::result::Result<CacheConfig, RemoteError> {
    let sku = model
        .properties
        .sku
        .ok_or_else(|| RemoteError::Decode("properties.sku is missing".into()))?;
    let tier = CacheSku::from_name(&sku.name)
        .ok_or_else(|| RemoteError::Decode(format!("unknown sku name {:?}", sku.name)))?;

    Ok(CacheConfig {
        name: id.name.clone(),
        resource_group_name: id.resource_group.clone(),
        location: model.location.unwrap_or_default(),
        sku: tier,
        capacity: sku.capacity,
        shard_count: model.properties.shard_count,
        replicas_per_primary: model.properties.replicas_per_primary,
        non_ssl_port_enabled: model.properties.enable_non_ssl_port.unwrap_or(false),
        subnet_id: model.properties.subnet_id,
        tags: model.tags.unwrap_or_default(),
    })
}

/// Overwrite only the fields in `changes` on a freshly fetched model.
fn patch(model: &mut CacheModel, config: &CacheConfig, changes: &ChangeSet) {
    if changes.contains("sku") || changes.contains("capacity") {
        model.properties.sku = Some(SkuModel::new(config.sku, config.capacity));
    }
    if changes.contains("shard_count") {
        model.properties.shard_count = config.shard_count;
    }
    if changes.contains("replicas_per_primary") {
        model.properties.replicas_per_primary = config.replicas_per_primary;
    }
    if changes.contains("non_ssl_port_enabled") {
        model.properties.enable_non_ssl_port = Some(config.non_ssl_port_enabled);
    }
    if changes.contains("tags") {
        model.tags = Some(config.tags.clone());
    }
}

// ============================================================================
// Reconciler
// ============================================================================

fn provisioning_state(body: &Value) -> Option<&str> {
    body.pointer("/properties/provisioningState")?.as_str()
}

pub struct CacheReconciler {
    subscription_id: String,
    remote: Arc<dyn RemoteClient>,
    locks: Arc<dyn LockRegistry>,
    poller: Poller,
}

impl CacheReconciler {
    pub fn new(
        subscription_id: impl Into<String>,
        remote: Arc<dyn RemoteClient>,
        locks: Arc<dyn LockRegistry>,
        poller: Poller,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            remote,
            locks,
            poller,
        }
    }

    /// Lock the virtual network and subnet a cache is injected into.
    async fn lock_subnet(&self, subnet_id: Option<&str>, deadline: &Deadline) -> Result<Vec<LockGuard>> {
        let Some(raw) = subnet_id else {
            return Ok(Vec::new());
        };
        let subnet = SubnetId::parse(raw)?;
        self.locks
            .acquire_many(&subnet.lock_keys(), deadline, self.poller.clock())
            .await
    }

    fn cache_id(&self, config: &CacheConfig) -> CacheId {
        CacheId::new(
            &self.subscription_id,
            &config.resource_group_name,
            &config.name,
        )
    }

    async fn fetch(&self, id: &ResourceId) -> Result<Option<CacheModel>> {
        let Some(body) = self
            .remote
            .get(id)
            .await
            .map_err(|e| Error::remote(Operation::Get, id, e))?
        else {
            return Ok(None);
        };
        serde_json::from_value(body)
            .map(Some)
            .map_err(|e| Error::remote(Operation::Get, id, RemoteError::Decode(e.to_string())))
    }

    async fn put(&self, id: &ResourceId, model: &CacheModel, deadline: &Deadline) -> Result<()> {
        let body = serde_json::to_value(model).map_err(|e| {
            Error::remote(
                Operation::CreateOrUpdate,
                id,
                RemoteError::Decode(e.to_string()),
            )
        })?;
        let submitted = self
            .remote
            .create_or_update(id, body)
            .await
            .map_err(|e| Error::remote(Operation::CreateOrUpdate, id, e))?;
        self.poller
            .wait(submitted, deadline, Operation::CreateOrUpdate, id)
            .await?;

        debug!("Waiting for {} to become available", id);
        self.poller
            .wait_for_state(
                id,
                deadline,
                Operation::CreateOrUpdate,
                SETTLING_STATES,
                SETTLED_STATE,
                provisioning_state,
            )
            .await
    }

    fn validate(&self, config: &CacheConfig) -> Result<()> {
        let id = self.cache_id(config);
        let violation = |message: String| Error::invariant(RESOURCE_TYPE, &id, message);

        if config.replicas_per_primary.is_some() {
            validate_tier("replicas_per_primary", CacheSku::Standard, config.sku)
                .map_err(violation)?;
        }
        if config.shard_count.is_some() {
            validate_tier("shard_count", CacheSku::Premium, config.sku).map_err(violation)?;
        }
        if config.subnet_id.is_some() {
            validate_tier("subnet_id", CacheSku::Premium, config.sku).map_err(violation)?;
        }
        let (min, max) = config.sku.capacity_range();
        if config.capacity < min || config.capacity > max {
            return Err(violation(format!(
                "capacity {} is out of range {}..={} for sku {}",
                config.capacity, min, max, config.sku
            )));
        }
        Ok(())
    }
}

fn parse_resource_id(raw: &str) -> Result<(CacheId, ResourceId)> {
    let id = CacheId::parse(raw)?;
    let resource_id = id.resource_id()?;
    Ok((id, resource_id))
}

#[async_trait]
impl Reconciler for CacheReconciler {
    type Config = CacheConfig;

    const RESOURCE_TYPE: &'static str = RESOURCE_TYPE;
    const SCHEMA_VERSION: u32 = 2;
    const FORCE_NEW_FIELDS: &'static [&'static str] =
        &["name", "resource_group_name", "location", "subnet_id"];
    const CASE_INSENSITIVE_FIELDS: &'static [&'static str] = &["location", "subnet_id"];

    fn parse_id(&self, raw: &str) -> std::result::Result<String, ParseError> {
        CacheId::parse(raw).map(|id| id.to_string())
    }

    fn id_for(&self, config: &CacheConfig) -> Result<String> {
        Ok(self.cache_id(config).to_string())
    }

    fn customize_diff(&self, old: Option<&CacheConfig>, new: &CacheConfig) -> Result<DiffPlan> {
        self.validate(new)?;
        match old {
            Some(old) if is_downgrade(old.sku, new.sku) => Ok(DiffPlan::replace(format!(
                "sku downgrade from {} to {}",
                old.sku, new.sku
            ))),
            _ => Ok(DiffPlan::default()),
        }
    }

    fn upgraders(&self) -> Vec<Box<dyn StateUpgrader>> {
        vec![Box::new(CanonicalIdV0ToV1), Box::new(SkuBlockV1ToV2)]
    }

    async fn create(&self, config: &CacheConfig, deadline: &Deadline) -> Result<String> {
        let id = self.cache_id(config);
        let resource_id = id.resource_id()?;

        if self.fetch(&resource_id).await?.is_some() {
            return Err(Error::RequiresImport {
                resource_type: RESOURCE_TYPE,
                id: id.to_string(),
            });
        }

        let _subnet = self.lock_subnet(config.subnet_id.as_deref(), deadline).await?;
        self.put(&resource_id, &expand(config), deadline).await?;
        Ok(id.to_string())
    }

    async fn read(&self, id: &str, _deadline: &Deadline) -> Result<Option<CacheConfig>> {
        let (cache_id, resource_id) = parse_resource_id(id)?;
        let Some(model) = self.fetch(&resource_id).await? else {
            return Ok(None);
        };
        flatten(&cache_id, model)
            .map(Some)
            .map_err(|e| Error::remote(Operation::Get, id, e))
    }

    async fn update(
        &self,
        id: &str,
        config: &CacheConfig,
        changes: &ChangeSet,
        deadline: &Deadline,
    ) -> Result<()> {
        let (_, resource_id) = parse_resource_id(id)?;
        let Some(mut model) = self.fetch(&resource_id).await? else {
            return Err(Error::remote(
                Operation::Get,
                id,
                RemoteError::Status {
                    status: 404,
                    code: Some("ResourceNotFound".into()),
                    message: "cache disappeared before it could be updated".into(),
                },
            ));
        };
        patch(&mut model, config, changes);
        self.put(&resource_id, &model, deadline).await
    }

    async fn delete(&self, id: &str, deadline: &Deadline) -> Result<()> {
        let (_, resource_id) = parse_resource_id(id)?;
        let Some(model) = self.fetch(&resource_id).await? else {
            debug!("{} already deleted", id);
            return Ok(());
        };
        let _subnet = self
            .lock_subnet(model.properties.subnet_id.as_deref(), deadline)
            .await?;

        match self.remote.delete(&resource_id).await {
            Ok(submitted) => {
                self.poller
                    .wait(submitted, deadline, Operation::Delete, &resource_id)
                    .await
            }
            Err(e) if e.is_not_found() => {
                debug!("{} already deleted", id);
                Ok(())
            }
            Err(e) => Err(Error::remote(Operation::Delete, id, e)),
        }
    }
}

// ============================================================================
// State upgraders
// ============================================================================

/// Version 0 stored identifiers with whatever casing the server returned.
struct CanonicalIdV0ToV1;

impl StateUpgrader for CanonicalIdV0ToV1 {
    fn from_version(&self) -> u32 {
        0
    }

    fn upgrade(&self, mut state: ResourceState) -> std::result::Result<ResourceState, ParseError> {
        let (canonical, _) = PATTERN.parse(&state.id)?;
        state.id = canonical.to_string();
        Ok(state)
    }
}

/// Version 1 kept the sku as flat `sku_name` and `family` attributes.
struct SkuBlockV1ToV2;

impl StateUpgrader for SkuBlockV1ToV2 {
    fn from_version(&self) -> u32 {
        1
    }

    fn upgrade(&self, mut state: ResourceState) -> std::result::Result<ResourceState, ParseError> {
        let malformed = |reason: &str| ParseError::MalformedState {
            resource_type: RESOURCE_TYPE.to_string(),
            reason: reason.to_string(),
        };
        let attributes = state
            .attributes
            .as_object_mut()
            .ok_or_else(|| malformed("attributes are not an object"))?;

        let sku_name = attributes
            .remove("sku_name")
            .ok_or_else(|| malformed("sku_name is missing"))?;
        attributes.remove("family");
        let sku = sku_name
            .as_str()
            .and_then(CacheSku::from_name)
            .ok_or_else(|| malformed("sku_name is not a known sku"))?;
        attributes.insert("sku".into(), Value::String(sku.to_string()));
        Ok(state)
    }
}
