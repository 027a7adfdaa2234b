//! Concrete resource kinds.

pub mod cache;
pub mod network_interface;
pub mod nic_asg_association;

pub use cache::{CacheConfig, CacheId, CacheReconciler, CacheSku};
pub use network_interface::{
    ApplicationSecurityGroupId, NetworkInterface, NetworkInterfaceId, NicApplicationSecurityGroups,
    SubResource, SubnetId,
};
pub use nic_asg_association::{
    NicSecurityGroupAssociationConfig, NicSecurityGroupAssociationId,
    NicSecurityGroupAssociationReconciler,
};
