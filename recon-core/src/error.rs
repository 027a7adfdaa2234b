//! Error types for the reconciliation engine.
//!
//! Not-found is deliberately absent from [`Error`]: a missing object on Read
//! or Delete is a normal outcome and never reaches the caller as a failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// The step an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    CreateOrUpdate,
    Delete,
    Poll,
    LockWait,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Get => "get",
            Operation::CreateOrUpdate => "create/update",
            Operation::Delete => "delete",
            Operation::Poll => "poll",
            Operation::LockWait => "lock wait",
        };
        f.write_str(s)
    }
}

/// Errors parsing identifiers or persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The string is not a well-formed hierarchical identifier.
    #[error("malformed resource id {input:?}: {reason}")]
    MalformedId { input: String, reason: String },

    /// Well-formed, but not the kind of identifier that was expected.
    #[error("resource id {input:?} is not a valid {expected} id: {reason}")]
    UnexpectedSegment {
        input: String,
        expected: &'static str,
        reason: String,
    },

    /// Persisted state could not be decoded.
    #[error("malformed state for {resource_type}: {reason}")]
    MalformedState {
        resource_type: String,
        reason: String,
    },

    /// State was written by a newer schema than this build knows.
    #[error("state for {resource_type} has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        resource_type: String,
        found: u32,
        supported: u32,
    },

    /// A migration step is missing; versions are never skipped.
    #[error("no state upgrader for {resource_type} from schema version {version}")]
    MissingUpgrader { resource_type: String, version: u32 },
}

/// Errors reported by a [`RemoteClient`](crate::remote::RemoteClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The control plane answered with a non-success status.
    #[error("remote returned status {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// A long-running operation reached a terminal, unsuccessful state.
    #[error("long-running operation {state}: {message}")]
    OperationFailed { state: String, message: String },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be understood.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Returns true when the remote reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404, .. })
    }
}

/// Errors surfaced by the engine. None of these are retried or recovered here.
#[derive(Debug, Error)]
pub enum Error {
    /// Create would adopt or duplicate something that already exists remotely.
    #[error(
        "a resource with the ID {id:?} already exists - to be managed it needs to be imported into the state ({resource_type})"
    )]
    RequiresImport {
        resource_type: &'static str,
        id: String,
    },

    /// The parent object holding a shared collection does not exist.
    #[error("{resource_type}: parent {parent_id:?} was not found")]
    ParentNotFound {
        resource_type: &'static str,
        parent_id: String,
    },

    /// A cross-field invariant rejected the configuration before any remote call.
    #[error("{resource_type} {id:?}: {message}")]
    Invariant {
        resource_type: &'static str,
        id: String,
        message: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Any other failure from the remote client, unmodified.
    #[error("{operation} {id:?}: {source}")]
    Remote {
        operation: Operation,
        id: String,
        #[source]
        source: RemoteError,
    },

    /// A deadline expired. The remote side's final state is unknown.
    #[error("timed out after {waited:?} during {operation} of {id:?}; remote state is unknown")]
    Timeout {
        operation: Operation,
        id: String,
        waited: Duration,
    },

    /// Import targeted an object that does not exist.
    #[error("cannot import {resource_type} {id:?}: it does not exist")]
    ImportNotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Programmer error: the engine attempted an impossible state change.
    #[error("illegal lifecycle transition for {id:?}: {from:?} -> {to:?}")]
    Lifecycle {
        id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl Error {
    pub fn remote(operation: Operation, id: impl fmt::Display, source: RemoteError) -> Self {
        Error::Remote {
            operation,
            id: id.to_string(),
            source,
        }
    }

    pub fn invariant(
        resource_type: &'static str,
        id: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Error::Invariant {
            resource_type,
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub fn is_requires_import(&self) -> bool {
        matches!(self, Error::RequiresImport { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = RemoteError::Status {
            status: 404,
            code: Some("ResourceNotFound".into()),
            message: "gone".into(),
        };
        assert!(err.is_not_found());

        let err = RemoteError::Status {
            status: 409,
            code: None,
            message: "conflict".into(),
        };
        assert!(!err.is_not_found());
        assert!(!RemoteError::Transport("reset".into()).is_not_found());
    }

    #[test]
    fn test_remote_error_keeps_context() {
        let err = Error::remote(
            Operation::CreateOrUpdate,
            "/subscriptions/s1",
            RemoteError::Status {
                status: 429,
                code: None,
                message: "throttled".into(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("create/update"));
        assert!(msg.contains("/subscriptions/s1"));
        assert!(msg.contains("throttled"));
    }
}
