//! Manifest and state files.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use recon_core::ResourceState;
use recon_core::resources::{CacheConfig, NicSecurityGroupAssociationConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Kind {
    RedisCache,
    NicSecurityGroupAssociation,
}

/// Desired configuration, typed per kind.
#[derive(Debug, Clone)]
pub enum Desired {
    RedisCache(CacheConfig),
    NicSecurityGroupAssociation(NicSecurityGroupAssociationConfig),
}

impl Desired {
    pub fn kind(&self) -> Kind {
        match self {
            Desired::RedisCache(_) => Kind::RedisCache,
            Desired::NicSecurityGroupAssociation(_) => Kind::NicSecurityGroupAssociation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub desired: Desired,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Deserialize)]
struct RawResource {
    name: String,
    kind: Kind,
    config: Value,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(data)?;

        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(raw.resources.len());
        for entry in raw.resources {
            if !seen.insert(entry.name.clone()) {
                bail!("resource name {:?} is declared twice", entry.name);
            }
            let desired = match entry.kind {
                Kind::RedisCache => Desired::RedisCache(
                    serde_json::from_value(entry.config)
                        .with_context(|| format!("config of {}", entry.name))?,
                ),
                Kind::NicSecurityGroupAssociation => Desired::NicSecurityGroupAssociation(
                    serde_json::from_value(entry.config)
                        .with_context(|| format!("config of {}", entry.name))?,
                ),
            };
            resources.push(Resource {
                name: entry.name,
                desired,
            });
        }

        Ok(Self { resources })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub kind: Kind,
    pub state: ResourceState,
}

/// Persisted state of every managed resource, keyed by manifest name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, StateEntry>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

impl StateFile {
    /// Load state, starting empty when the file does not exist yet.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state {}", path.display()));
            }
        };
        let state: StateFile = serde_json::from_slice(&data)
            .with_context(|| format!("Invalid state file {}", path.display()))?;
        if state.version != STATE_VERSION {
            bail!(
                "state file {} has version {}, expected {}",
                path.display(),
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Write via a temporary file so a crash never leaves half a state file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
