//! Association of an application security group with a network interface.
//!
//! The association has no remote object of its own: it is one entry in the
//! NIC's primary ip configuration, edited through [`AssociationProtocol`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::association::{AssociationProtocol, Removal, SharedCollection, composite_id};
use crate::error::{Error, ParseError, Result};
use crate::lifecycle::{ChangeSet, Reconciler};
use crate::poll::Deadline;
use crate::resources::network_interface::{
    ApplicationSecurityGroupId, NetworkInterfaceId, NicApplicationSecurityGroups, SubResource,
};

pub const RESOURCE_TYPE: &str = NicApplicationSecurityGroups::RESOURCE_TYPE;

/// `<network interface id>|<application security group id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSecurityGroupAssociationId {
    pub network_interface: NetworkInterfaceId,
    pub application_security_group: ApplicationSecurityGroupId,
}

impl NicSecurityGroupAssociationId {
    pub fn parse(input: &str) -> std::result::Result<Self, ParseError> {
        let mut parts = input.split('|');
        let (Some(nic), Some(asg), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::MalformedId {
                input: input.to_string(),
                reason: "expected {networkInterfaceId}|{applicationSecurityGroupId}".into(),
            });
        };
        Ok(Self {
            network_interface: NetworkInterfaceId::parse(nic)?,
            application_security_group: ApplicationSecurityGroupId::parse(asg)?,
        })
    }
}

impl fmt::Display for NicSecurityGroupAssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&composite_id(
            &self.network_interface,
            &self.application_security_group,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicSecurityGroupAssociationConfig {
    pub network_interface_id: String,
    pub application_security_group_id: String,
}

pub struct NicSecurityGroupAssociationReconciler {
    protocol: AssociationProtocol,
}

impl NicSecurityGroupAssociationReconciler {
    pub fn new(protocol: AssociationProtocol) -> Self {
        Self { protocol }
    }

    fn association_id(config: &NicSecurityGroupAssociationConfig) -> Result<NicSecurityGroupAssociationId> {
        Ok(NicSecurityGroupAssociationId {
            network_interface: NetworkInterfaceId::parse(&config.network_interface_id)?,
            application_security_group: ApplicationSecurityGroupId::parse(
                &config.application_security_group_id,
            )?,
        })
    }
}

#[async_trait]
impl Reconciler for NicSecurityGroupAssociationReconciler {
    type Config = NicSecurityGroupAssociationConfig;

    const RESOURCE_TYPE: &'static str = RESOURCE_TYPE;
    const FORCE_NEW_FIELDS: &'static [&'static str] =
        &["network_interface_id", "application_security_group_id"];
    const CASE_INSENSITIVE_FIELDS: &'static [&'static str] =
        &["network_interface_id", "application_security_group_id"];

    fn parse_id(&self, raw: &str) -> std::result::Result<String, ParseError> {
        NicSecurityGroupAssociationId::parse(raw).map(|id| id.to_string())
    }

    fn id_for(&self, config: &Self::Config) -> Result<String> {
        Ok(Self::association_id(config)?.to_string())
    }

    async fn create(&self, config: &Self::Config, deadline: &Deadline) -> Result<String> {
        let id = Self::association_id(config)?;
        let parent = id.network_interface.resource_id()?;
        let element = SubResource::new(id.application_security_group.to_string());

        self.protocol
            .insert(&NicApplicationSecurityGroups, &parent, element, deadline)
            .await?;
        Ok(id.to_string())
    }

    async fn read(&self, id: &str, deadline: &Deadline) -> Result<Option<Self::Config>> {
        let id = NicSecurityGroupAssociationId::parse(id)?;
        let parent = id.network_interface.resource_id()?;
        let found = self
            .protocol
            .find(
                &NicApplicationSecurityGroups,
                &parent,
                &id.application_security_group.to_string(),
                deadline,
            )
            .await?;

        Ok(found.map(|element| NicSecurityGroupAssociationConfig {
            network_interface_id: id.network_interface.to_string(),
            application_security_group_id: element.id,
        }))
    }

    async fn update(
        &self,
        id: &str,
        _config: &Self::Config,
        changes: &ChangeSet,
        _deadline: &Deadline,
    ) -> Result<()> {
        // Every attribute forces replacement, so the engine never gets here.
        Err(Error::invariant(
            RESOURCE_TYPE,
            id,
            format!("cannot update {} in place", changes),
        ))
    }

    async fn delete(&self, id: &str, deadline: &Deadline) -> Result<()> {
        let id = NicSecurityGroupAssociationId::parse(id)?;
        let parent = id.network_interface.resource_id()?;
        let removal = self
            .protocol
            .remove(
                &NicApplicationSecurityGroups,
                &parent,
                &id.application_security_group.to_string(),
                deadline,
            )
            .await?;
        if removal == Removal::AlreadyAbsent {
            debug!("{} was already removed", id);
        }
        Ok(())
    }
}
