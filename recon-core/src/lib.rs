//! Reconciles declared resources with a remote control plane.
//!
//! The pieces, bottom up:
//! - [`id`]: hierarchical resource identifiers
//! - [`remote`]: the control-plane client seam
//! - [`poll`]: long-running operations and deadlines
//! - [`locks`]: named locks around shared remote objects
//! - [`association`]: read-modify-write of shared collections
//! - [`lifecycle`]: the per-resource state machine and engine
//! - [`resources`]: concrete resource kinds

pub mod association;
pub mod config;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod locks;
pub mod poll;
pub mod remote;
pub mod resources;

pub use association::{AssociationProtocol, Removal, SharedCollection};
pub use config::{EngineConfig, Timeouts};
pub use error::{Error, Operation, ParseError, RemoteError, Result};
pub use id::{IdPattern, ResourceId, Segment};
pub use lifecycle::{
    Action, ApplyOutcome, ChangeSet, DiffPlan, Engine, LifecycleState, Reconciler, ResourceState,
    StateUpgrader, Tier, is_downgrade, validate_tier,
};
pub use locks::{InMemoryLockRegistry, LockGuard, LockKey, LockRegistry};
pub use poll::{Clock, Deadline, ManualClock, PollConfig, Poller, TokioClock};
pub use remote::{HttpRemote, MemoryRemote, PollHandle, PollStatus, RemoteClient, Submitted};
