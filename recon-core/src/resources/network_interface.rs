//! Network interface model and its application security group list.
//!
//! Only the fields the association needs are typed; everything else the
//! server returns rides along in `extra` and is written back untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::association::SharedCollection;
use crate::error::ParseError;
use crate::id::{IdPattern, ResourceId, Segment, take_values};
use crate::locks::LockKey;

const NIC_PATTERN: IdPattern = IdPattern::new(
    "network interface",
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
            value: "Microsoft.Network",
        },
        Segment::Named {
            key: "networkInterfaces",
            name: "name",
        },
    ],
);

const ASG_PATTERN: IdPattern = IdPattern::new(
    "application security group",
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
            value: "Microsoft.Network",
        },
        Segment::Named {
            key: "applicationSecurityGroups",
            name: "name",
        },
    ],
);

const SUBNET_PATTERN: IdPattern = IdPattern::new(
    "subnet",
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
            value: "Microsoft.Network",
        },
        Segment::Named {
            key: "virtualNetworks",
            name: "virtual_network",
        },
        Segment::Named {
            key: "subnets",
            name: "name",
        },
    ],
);

/// Lock kind shared by everything that edits a virtual network.
pub const VIRTUAL_NETWORK_LOCK: &str = "azurerm_virtual_network";
/// Lock kind shared by everything that edits a subnet.
pub const SUBNET_LOCK: &str = "azurerm_subnet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceId {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl NetworkInterfaceId {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let (_, values) = NIC_PATTERN.parse(input)?;
        let [subscription_id, resource_group, name] = take_values(&NIC_PATTERN, input, values)?;
        Ok(Self {
            subscription_id,
            resource_group,
            name,
        })
    }

    pub fn resource_id(&self) -> Result<ResourceId, ParseError> {
        NIC_PATTERN.format(&[&self.subscription_id, &self.resource_group, &self.name])
    }
}

impl fmt::Display for NetworkInterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}",
            self.subscription_id, self.resource_group, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationSecurityGroupId {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl ApplicationSecurityGroupId {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let (_, values) = ASG_PATTERN.parse(input)?;
        let [subscription_id, resource_group, name] = take_values(&ASG_PATTERN, input, values)?;
        Ok(Self {
            subscription_id,
            resource_group,
            name,
        })
    }
}

impl fmt::Display for ApplicationSecurityGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/applicationSecurityGroups/{}",
            self.subscription_id, self.resource_group, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetId {
    pub subscription_id: String,
    pub resource_group: String,
    pub virtual_network: String,
    pub name: String,
}

impl SubnetId {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let (_, values) = SUBNET_PATTERN.parse(input)?;
        let [subscription_id, resource_group, virtual_network, name] =
            take_values(&SUBNET_PATTERN, input, values)?;
        Ok(Self {
            subscription_id,
            resource_group,
            virtual_network,
            name,
        })
    }

    /// Locks taken by anything placing a resource into this subnet.
    pub fn lock_keys(&self) -> [LockKey; 2] {
        [
            LockKey::named(VIRTUAL_NETWORK_LOCK, &self.virtual_network),
            LockKey::named(SUBNET_LOCK, &self.name),
        ]
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            self.subscription_id, self.resource_group, self.virtual_network, self.name
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<NetworkInterfaceProperties>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_configurations: Option<Vec<IpConfiguration>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<IpConfigurationProperties>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigurationProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_security_groups: Option<Vec<SubResource>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to another resource by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResource {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

impl NetworkInterface {
    fn ip_configurations(&self) -> Option<&[IpConfiguration]> {
        self.properties.as_ref()?.ip_configurations.as_deref()
    }

    /// Index of the ip configuration flagged primary, else the first one.
    fn primary_index(configs: &[IpConfiguration]) -> Option<usize> {
        if configs.is_empty() {
            return None;
        }
        let flagged = configs.iter().position(|c| {
            c.properties
                .as_ref()
                .and_then(|p| p.primary)
                .unwrap_or(false)
        });
        Some(flagged.unwrap_or(0))
    }
}

/// The application security groups attached to a NIC's primary ip configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NicApplicationSecurityGroups;

impl SharedCollection for NicApplicationSecurityGroups {
    type Parent = NetworkInterface;
    type Element = SubResource;

    const RESOURCE_TYPE: &'static str =
        "azurerm_network_interface_application_security_group_association";

    fn collection<'a>(&self, parent: &'a NetworkInterface) -> Option<&'a [SubResource]> {
        let configs = parent.ip_configurations()?;
        let primary = NetworkInterface::primary_index(configs)?;
        configs[primary]
            .properties
            .as_ref()?
            .application_security_groups
            .as_deref()
    }

    fn collection_mut<'a>(
        &self,
        parent: &'a mut NetworkInterface,
    ) -> Result<&'a mut Vec<SubResource>, String> {
        let configs = parent
            .properties
            .as_mut()
            .and_then(|p| p.ip_configurations.as_mut())
            .ok_or_else(|| "network interface has no ip configurations".to_string())?;
        let primary = NetworkInterface::primary_index(configs)
            .ok_or_else(|| "network interface has no ip configurations".to_string())?;

        Ok(configs[primary]
            .properties
            .get_or_insert_with(Default::default)
            .application_security_groups
            .get_or_insert_with(Vec::new))
    }

    fn element_id<'a>(&self, element: &'a SubResource) -> &'a str {
        &element.id
    }
}
