//! Shared-collection association protocol.
//!
//! Several independently declared resources can each own one element of a
//! list that physically lives on a single remote parent. The control plane
//! has no element-level operations, so every mutation reads the whole parent,
//! edits a copy of the list and writes the whole parent back. The cycle runs
//! under a lock keyed by the parent identity; every participant editing the
//! same parent must come through here or updates are lost.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Error, Operation, RemoteError, Result};
use crate::id::ResourceId;
use crate::locks::{LockGuard, LockKey, LockRegistry};
use crate::poll::{Deadline, Poller};
use crate::remote::RemoteClient;

/// Describes where a shared list lives inside a parent model.
pub trait SharedCollection: Send + Sync {
    /// Typed model of the parent object.
    type Parent: Serialize + DeserializeOwned + Send + Sync;
    /// One element of the list.
    type Element: Clone + fmt::Debug + Send + Sync;

    /// Resource type reported in errors.
    const RESOURCE_TYPE: &'static str;

    /// The list, or `None` when the parent carries none.
    fn collection<'a>(&self, parent: &'a Self::Parent) -> Option<&'a [Self::Element]>;

    /// Mutable access, creating an empty list when absent.
    ///
    /// Returns a message when the parent cannot hold the list at all.
    fn collection_mut<'a>(
        &self,
        parent: &'a mut Self::Parent,
    ) -> std::result::Result<&'a mut Vec<Self::Element>, String>;

    /// Identifier embedded in an element.
    fn element_id<'a>(&self, element: &'a Self::Element) -> &'a str;
}

/// Result of [`AssociationProtocol::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    AlreadyAbsent,
}

/// Identifier of an association: `<parent id>|<element id>`.
pub fn composite_id(parent_id: impl fmt::Display, element_id: impl fmt::Display) -> String {
    format!("{}|{}", parent_id, element_id)
}

/// Read-modify-write of one element of a parent's shared list.
#[derive(Clone)]
pub struct AssociationProtocol {
    remote: Arc<dyn RemoteClient>,
    locks: Arc<dyn LockRegistry>,
    poller: Poller,
}

impl AssociationProtocol {
    pub fn new(remote: Arc<dyn RemoteClient>, locks: Arc<dyn LockRegistry>, poller: Poller) -> Self {
        Self {
            remote,
            locks,
            poller,
        }
    }

    async fn lock(&self, parent_id: &ResourceId, deadline: &Deadline) -> Result<LockGuard> {
        self.locks
            .acquire_until(&LockKey::for_resource(parent_id), deadline, self.poller.clock())
            .await
    }

    async fn fetch<C: SharedCollection>(&self, parent_id: &ResourceId) -> Result<Option<C::Parent>> {
        let Some(body) = self
            .remote
            .get(parent_id)
            .await
            .map_err(|e| Error::remote(Operation::Get, parent_id, e))?
        else {
            return Ok(None);
        };
        serde_json::from_value(body)
            .map(Some)
            .map_err(|e| Error::remote(Operation::Get, parent_id, RemoteError::Decode(e.to_string())))
    }

    async fn store<C: SharedCollection>(
        &self,
        parent_id: &ResourceId,
        parent: &C::Parent,
        deadline: &Deadline,
    ) -> Result<()> {
        let body = serde_json::to_value(parent).map_err(|e| {
            Error::remote(
                Operation::CreateOrUpdate,
                parent_id,
                RemoteError::Decode(e.to_string()),
            )
        })?;
        let submitted = self
            .remote
            .create_or_update(parent_id, body)
            .await
            .map_err(|e| Error::remote(Operation::CreateOrUpdate, parent_id, e))?;
        self.poller
            .wait(submitted, deadline, Operation::CreateOrUpdate, parent_id)
            .await
    }

    /// Position of the element matching `element_id`, case-insensitively.
    ///
    /// Resource identifiers are compared segment by segment; anything that
    /// does not parse as one is compared as a plain string. More than one
    /// match breaks the collection's uniqueness invariant and is reported as
    /// requiring import rather than silently deduplicated.
    fn locate<C: SharedCollection>(
        coll: &C,
        elements: &[C::Element],
        parent_id: &ResourceId,
        element_id: &str,
    ) -> Result<Option<usize>> {
        let target = ResourceId::parse(element_id).ok();
        let matches_target = |candidate: &str| match (&target, ResourceId::parse(candidate)) {
            (Some(target), Ok(candidate)) => target.same_resource(&candidate),
            _ => candidate.eq_ignore_ascii_case(element_id),
        };
        let mut matches = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| matches_target(coll.element_id(e)))
            .map(|(i, _)| i);
        let first = matches.next();
        if first.is_some() && matches.next().is_some() {
            return Err(Error::RequiresImport {
                resource_type: C::RESOURCE_TYPE,
                id: composite_id(parent_id, element_id),
            });
        }
        Ok(first)
    }

    /// Append `element` to the parent's list.
    ///
    /// Fails with `ParentNotFound` when the parent is missing and with
    /// `RequiresImport` when the element is already present.
    pub async fn insert<C: SharedCollection>(
        &self,
        coll: &C,
        parent_id: &ResourceId,
        element: C::Element,
        deadline: &Deadline,
    ) -> Result<()> {
        let _guard = self.lock(parent_id, deadline).await?;
        let element_id = coll.element_id(&element).to_string();

        let Some(mut parent) = self.fetch::<C>(parent_id).await? else {
            return Err(Error::ParentNotFound {
                resource_type: C::RESOURCE_TYPE,
                parent_id: parent_id.to_string(),
            });
        };

        if let Some(existing) = coll.collection(&parent) {
            if Self::locate(coll, existing, parent_id, &element_id)?.is_some() {
                return Err(Error::RequiresImport {
                    resource_type: C::RESOURCE_TYPE,
                    id: composite_id(parent_id, &element_id),
                });
            }
        }

        coll.collection_mut(&mut parent)
            .map_err(|message| Error::invariant(C::RESOURCE_TYPE, parent_id, message))?
            .push(element);

        info!("Adding {} to {} ({})", element_id, parent_id, C::RESOURCE_TYPE);
        self.store::<C>(parent_id, &parent, deadline).await
    }

    /// Remove the element matching `element_id` from the parent's list.
    ///
    /// A missing parent, list or element means it is already gone.
    pub async fn remove<C: SharedCollection>(
        &self,
        coll: &C,
        parent_id: &ResourceId,
        element_id: &str,
        deadline: &Deadline,
    ) -> Result<Removal> {
        let _guard = self.lock(parent_id, deadline).await?;

        let Some(mut parent) = self.fetch::<C>(parent_id).await? else {
            debug!("Parent {} already gone, nothing to remove", parent_id);
            return Ok(Removal::AlreadyAbsent);
        };
        let position = match coll.collection(&parent) {
            Some(existing) => Self::locate(coll, existing, parent_id, element_id)?,
            None => None,
        };
        let Some(position) = position else {
            debug!("{} not present on {}, nothing to remove", element_id, parent_id);
            return Ok(Removal::AlreadyAbsent);
        };

        coll.collection_mut(&mut parent)
            .map_err(|message| Error::invariant(C::RESOURCE_TYPE, parent_id, message))?
            .remove(position);

        info!("Removing {} from {} ({})", element_id, parent_id, C::RESOURCE_TYPE);
        self.store::<C>(parent_id, &parent, deadline).await?;
        Ok(Removal::Removed)
    }

    /// Look up the element matching `element_id`.
    ///
    /// `None` when the parent, its list, or the element is missing.
    pub async fn find<C: SharedCollection>(
        &self,
        coll: &C,
        parent_id: &ResourceId,
        element_id: &str,
        deadline: &Deadline,
    ) -> Result<Option<C::Element>> {
        let _guard = self.lock(parent_id, deadline).await?;

        let Some(parent) = self.fetch::<C>(parent_id).await? else {
            return Ok(None);
        };
        let Some(existing) = coll.collection(&parent) else {
            return Ok(None);
        };
        Ok(Self::locate(coll, existing, parent_id, element_id)?.map(|i| existing[i].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::{Map, Value, json};

    use crate::locks::InMemoryLockRegistry;
    use crate::poll::{ManualClock, PollConfig};
    use crate::remote::MemoryRemote;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Member {
        id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pool {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        members: Option<Vec<Member>>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    }

    struct PoolMembers;

    impl SharedCollection for PoolMembers {
        type Parent = Pool;
        type Element = Member;
        const RESOURCE_TYPE: &'static str = "test_pool_member";

        fn collection<'a>(&self, parent: &'a Pool) -> Option<&'a [Member]> {
            parent.members.as_deref()
        }

        fn collection_mut<'a>(
            &self,
            parent: &'a mut Pool,
        ) -> std::result::Result<&'a mut Vec<Member>, String> {
            Ok(parent.members.get_or_insert_with(Vec::new))
        }

        fn element_id<'a>(&self, element: &'a Member) -> &'a str {
            &element.id
        }
    }

    fn pool_id() -> ResourceId {
        ResourceId::parse("/subscriptions/s/resourceGroups/g/providers/Test.Pools/pools/p1").unwrap()
    }

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            extra: Map::new(),
        }
    }

    fn setup() -> (Arc<MemoryRemote>, AssociationProtocol, Deadline) {
        let remote = Arc::new(MemoryRemote::new());
        let clock = Arc::new(ManualClock::new());
        let poller = Poller::new(remote.clone(), clock.clone(), PollConfig::default());
        let protocol =
            AssociationProtocol::new(remote.clone(), Arc::new(InMemoryLockRegistry::new()), poller);
        let deadline = Deadline::after(clock.as_ref(), Duration::from_secs(60));
        (remote, protocol, deadline)
    }

    fn member_ids(body: &Value) -> Vec<String> {
        body["members"]
            .as_array()
            .map(|a| a.iter().map(|m| m["id"].as_str().unwrap().to_string()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_insert_preserves_existing_elements_verbatim() {
        let (remote, protocol, deadline) = setup();
        remote
            .insert(
                &pool_id(),
                json!({
                    "location": "westeurope",
                    "members": [{"id": "a", "weight": 3, "tags": {"x": "y"}}]
                }),
            )
            .await;

        protocol
            .insert(&PoolMembers, &pool_id(), member("b"), &deadline)
            .await
            .unwrap();

        let body = remote.object(&pool_id()).await.unwrap();
        assert_eq!(member_ids(&body), vec!["a", "b"]);
        assert_eq!(body["members"][0], json!({"id": "a", "weight": 3, "tags": {"x": "y"}}));
        assert_eq!(body["location"], json!("westeurope"));
    }

    #[tokio::test]
    async fn test_insert_creates_missing_collection() {
        let (remote, protocol, deadline) = setup();
        remote.insert(&pool_id(), json!({})).await;

        protocol
            .insert(&PoolMembers, &pool_id(), member("a"), &deadline)
            .await
            .unwrap();
        assert_eq!(member_ids(&remote.object(&pool_id()).await.unwrap()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_insert_existing_requires_import() {
        let (remote, protocol, deadline) = setup();
        remote.insert(&pool_id(), json!({"members": [{"id": "A"}]})).await;

        let err = protocol
            .insert(&PoolMembers, &pool_id(), member("a"), &deadline)
            .await
            .unwrap_err();
        assert!(err.is_requires_import());
        assert_eq!(remote.calls().await.puts, 0);
    }

    #[tokio::test]
    async fn test_insert_without_parent_fails() {
        let (remote, protocol, deadline) = setup();
        let err = protocol
            .insert(&PoolMembers, &pool_id(), member("a"), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParentNotFound { .. }));
        assert_eq!(remote.calls().await.puts, 0);
    }

    #[tokio::test]
    async fn test_remove_filters_only_the_match() {
        let (remote, protocol, deadline) = setup();
        remote
            .insert(
                &pool_id(),
                json!({"members": [{"id": "a"}, {"id": "B", "weight": 1}, {"id": "c"}]}),
            )
            .await;

        let removal = protocol
            .remove(&PoolMembers, &pool_id(), "b", &deadline)
            .await
            .unwrap();
        assert_eq!(removal, Removal::Removed);
        assert_eq!(member_ids(&remote.object(&pool_id()).await.unwrap()), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (remote, protocol, deadline) = setup();

        // Parent missing.
        let removal = protocol
            .remove(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap();
        assert_eq!(removal, Removal::AlreadyAbsent);

        // Parent present, element missing.
        remote.insert(&pool_id(), json!({"members": [{"id": "b"}]})).await;
        let removal = protocol
            .remove(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap();
        assert_eq!(removal, Removal::AlreadyAbsent);
        assert_eq!(remote.calls().await.puts, 0);
    }

    #[tokio::test]
    async fn test_find() {
        let (remote, protocol, deadline) = setup();
        assert!(protocol
            .find(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap()
            .is_none());

        remote.insert(&pool_id(), json!({})).await;
        assert!(protocol
            .find(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap()
            .is_none());

        remote.insert(&pool_id(), json!({"members": [{"id": "A", "weight": 2}]})).await;
        let found = protocol
            .find(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "A");
        assert_eq!(found.extra["weight"], json!(2));
    }

    #[tokio::test]
    async fn test_identifiers_match_segment_by_segment() {
        let (remote, protocol, deadline) = setup();
        let group = "/subscriptions/s/resourceGroups/g/providers/Microsoft.Network/applicationSecurityGroups/web";
        remote
            .insert(
                &pool_id(),
                json!({"members": [{"id": format!("{}/", group.to_uppercase())}]}),
            )
            .await;

        let err = protocol
            .insert(&PoolMembers, &pool_id(), member(group), &deadline)
            .await
            .unwrap_err();
        assert!(err.is_requires_import());

        let removal = protocol
            .remove(&PoolMembers, &pool_id(), group, &deadline)
            .await
            .unwrap();
        assert_eq!(removal, Removal::Removed);
        assert!(member_ids(&remote.object(&pool_id()).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_are_never_deduplicated() {
        let (remote, protocol, deadline) = setup();
        remote
            .insert(&pool_id(), json!({"members": [{"id": "a"}, {"id": "A"}]}))
            .await;

        let err = protocol
            .remove(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap_err();
        assert!(err.is_requires_import());

        let err = protocol
            .find(&PoolMembers, &pool_id(), "a", &deadline)
            .await
            .unwrap_err();
        assert!(err.is_requires_import());

        let body = remote.object(&pool_id()).await.unwrap();
        assert_eq!(member_ids(&body), vec!["a", "A"]);
    }

    #[tokio::test]
    async fn test_failed_write_releases_lock() {
        let (remote, protocol, deadline) = setup();
        remote.insert(&pool_id(), json!({})).await;
        remote
            .fail_next(RemoteError::Status {
                status: 429,
                code: None,
                message: "throttled".into(),
            })
            .await;

        let err = protocol
            .insert(&PoolMembers, &pool_id(), member("a"), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));

        protocol
            .insert(&PoolMembers, &pool_id(), member("a"), &deadline)
            .await
            .unwrap();
    }
}
