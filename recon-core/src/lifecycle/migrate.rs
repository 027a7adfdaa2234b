//! Versioned state migration.

use tracing::debug;

use crate::error::ParseError;
use crate::lifecycle::ResourceState;

/// Rewrites state persisted at `from_version()` into the next version's shape.
pub trait StateUpgrader: Send + Sync {
    fn from_version(&self) -> u32;

    /// Transform the state. The caller bumps `schema_version`.
    fn upgrade(&self, state: ResourceState) -> Result<ResourceState, ParseError>;
}

/// Bring `state` up to `current` by applying upgraders in version order.
///
/// State newer than `current` is refused rather than guessed at.
pub fn migrate(
    resource_type: &str,
    mut state: ResourceState,
    upgraders: &[Box<dyn StateUpgrader>],
    current: u32,
) -> Result<ResourceState, ParseError> {
    if state.schema_version > current {
        return Err(ParseError::UnsupportedVersion {
            resource_type: resource_type.to_string(),
            found: state.schema_version,
            supported: current,
        });
    }

    while state.schema_version < current {
        let version = state.schema_version;
        let upgrader = upgraders
            .iter()
            .find(|u| u.from_version() == version)
            .ok_or_else(|| ParseError::MissingUpgrader {
                resource_type: resource_type.to_string(),
                version,
            })?;
        state = upgrader.upgrade(state)?;
        state.schema_version = version + 1;
        debug!(
            "Upgraded {} state {} from v{} to v{}",
            resource_type,
            state.id,
            version,
            version + 1
        );
    }

    Ok(state)
}
