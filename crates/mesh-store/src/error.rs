use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use mesh_types::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier, TypeError};

use crate::access::Operation;
use crate::transaction::{Transaction, TransactionId, TransactionState};

/// Coarse classification of a [`MeshError`].
///
/// Lets callers tell "retry later" apart from "the request is invalid" and
/// from "you may not do this" without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Not in a transaction, wrong thread, slot taken, asap timeout.
    Transaction,
    /// The request contradicts the current graph state.
    Consistency,
    /// Denied by policy, or the update lock could not be obtained.
    Permission,
    /// Objects or types could not be found.
    Lookup,
    /// Anything else.
    Unexpected,
}

/// A remote peer did not answer within the allotted time.
#[derive(Clone, Debug, thiserror::Error)]
#[error("remote query to {partner} timed out after {timeout:?}")]
pub struct RemoteQueryTimeout {
    pub partner: MeshBaseIdentifier,
    pub timeout: Duration,
}

/// Errors from MeshBase and MeshObject operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    // -- transaction boundaries ---------------------------------------------
    /// A mutation was attempted with no active transaction.
    #[error("not within transaction boundaries")]
    NotWithinTransactionBoundaries,

    /// The active transaction belongs to a different thread.
    #[error("transaction {} belongs to thread {owner:?}, not {caller:?}", .transaction.id())]
    IllegalTransactionThread {
        transaction: Arc<Transaction>,
        owner: ThreadId,
        caller: ThreadId,
    },

    /// Another transaction is already active on this store.
    #[error("transaction {} is active already", .blocking.id())]
    TransactionActiveAlready { blocking: Arc<Transaction> },

    /// `create_transaction_asap` gave up.
    #[error("no transaction after {attempts} attempts; blocked by {}", .blocking.id())]
    TransactionAsapTimeout {
        blocking: Arc<Transaction>,
        attempts: u32,
    },

    /// The transaction was committed or rolled back already.
    #[error("transaction {id} is {state}")]
    TransactionNotActive {
        id: TransactionId,
        state: TransactionState,
    },

    /// The store has been shut down.
    #[error("store {0} is dead")]
    MeshBaseDead(MeshBaseIdentifier),

    // -- graph consistency ---------------------------------------------------
    #[error("{object} and {neighbor} are related already")]
    RelatedAlready {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("{object} and {neighbor} are not related")]
    NotRelated {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("{0} cannot be related to itself")]
    CannotRelateToItself(MeshObjectIdentifier),

    /// Both ends of a two-object operation must live in the same store.
    #[error("{object} and {other} live in different stores")]
    DifferentMeshBase {
        object: MeshObjectIdentifier,
        other: MeshObjectIdentifier,
    },

    #[error("{object} and {other} are equivalent already")]
    EquivalentAlready {
        object: MeshObjectIdentifier,
        other: MeshObjectIdentifier,
    },

    #[error("{object} and {other} are not equivalent")]
    NotEquivalent {
        object: MeshObjectIdentifier,
        other: MeshObjectIdentifier,
    },

    #[error("{object} plays role {role} towards {neighbor} already")]
    RoleTypeBlessedAlready {
        object: MeshObjectIdentifier,
        role: MeshTypeIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("{object} does not play role {role} towards {neighbor}")]
    RoleTypeNotBlessed {
        object: MeshObjectIdentifier,
        role: MeshTypeIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("type {0} is abstract")]
    IsAbstract(MeshTypeIdentifier),

    #[error("{object} is blessed with {entity_type} already")]
    EntityBlessedAlready {
        object: MeshObjectIdentifier,
        entity_type: MeshTypeIdentifier,
    },

    #[error("{object} is not blessed with {entity_type}")]
    EntityNotBlessed {
        object: MeshObjectIdentifier,
        entity_type: MeshTypeIdentifier,
    },

    #[error("{object} still plays role {role}, which requires {entity_type}")]
    RoleTypeRequiresEntityType {
        object: MeshObjectIdentifier,
        entity_type: MeshTypeIdentifier,
        role: MeshTypeIdentifier,
    },

    #[error("{object} does not carry property {property_type}")]
    IllegalPropertyType {
        object: MeshObjectIdentifier,
        property_type: MeshTypeIdentifier,
    },

    #[error("illegal value for property {property_type} of {object}: {reason}")]
    IllegalPropertyValue {
        object: MeshObjectIdentifier,
        property_type: MeshTypeIdentifier,
        reason: String,
    },

    #[error("identifier {0} is in use already")]
    IdentifierNotUnique(MeshObjectIdentifier),

    /// The object has been deleted and only answers identity queries.
    #[error("{0} has been deleted")]
    ObjectDead(MeshObjectIdentifier),

    #[error("home object {0} cannot be deleted")]
    HomeObjectUndeletable(MeshObjectIdentifier),

    // -- permission ------------------------------------------------------------
    #[error("{operation} on {object} not permitted")]
    NotPermitted {
        object: MeshObjectIdentifier,
        operation: Operation,
    },

    /// The update lock for a replica could not be obtained.
    #[error("cannot obtain update lock for {object}")]
    CannotObtainLock {
        object: MeshObjectIdentifier,
        #[source]
        cause: Option<RemoteQueryTimeout>,
    },

    // -- lookup ------------------------------------------------------------------
    #[error("objects not found: {missing:?}")]
    ObjectsNotFound { missing: Vec<MeshObjectIdentifier> },

    #[error("unknown type {0}")]
    UnknownType(MeshTypeIdentifier),

    /// A peer store could not be reached.
    #[error(transparent)]
    Remote(#[from] RemoteQueryTimeout),

    // -- unexpected --------------------------------------------------------------
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotWithinTransactionBoundaries
            | Self::IllegalTransactionThread { .. }
            | Self::TransactionActiveAlready { .. }
            | Self::TransactionAsapTimeout { .. }
            | Self::TransactionNotActive { .. }
            | Self::MeshBaseDead(_) => ErrorKind::Transaction,

            Self::RelatedAlready { .. }
            | Self::NotRelated { .. }
            | Self::CannotRelateToItself(_)
            | Self::DifferentMeshBase { .. }
            | Self::EquivalentAlready { .. }
            | Self::NotEquivalent { .. }
            | Self::RoleTypeBlessedAlready { .. }
            | Self::RoleTypeNotBlessed { .. }
            | Self::IsAbstract(_)
            | Self::EntityBlessedAlready { .. }
            | Self::EntityNotBlessed { .. }
            | Self::RoleTypeRequiresEntityType { .. }
            | Self::IllegalPropertyType { .. }
            | Self::IllegalPropertyValue { .. }
            | Self::IdentifierNotUnique(_)
            | Self::ObjectDead(_)
            | Self::HomeObjectUndeletable(_) => ErrorKind::Consistency,

            Self::NotPermitted { .. } | Self::CannotObtainLock { .. } => ErrorKind::Permission,

            Self::ObjectsNotFound { .. } | Self::UnknownType(_) | Self::Remote(_) => {
                ErrorKind::Lookup
            }

            Self::Type(_) | Self::Serialization(_) | Self::Config(_) | Self::Internal(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Returns `true` for timing and contention failures that may succeed if
    /// simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionActiveAlready { .. }
                | Self::TransactionAsapTimeout { .. }
                | Self::CannotObtainLock { .. }
                | Self::Remote(_)
        )
    }
}

/// Result alias for MeshBase operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Some of the objects asked for in a batch lookup do not exist locally.
///
/// `found` is parallel to the identifiers asked for and keeps whatever could
/// be resolved.
pub struct ObjectsNotFound<T> {
    pub found: Vec<Option<T>>,
    pub missing: Vec<MeshObjectIdentifier>,
}

impl<T> fmt::Debug for ObjectsNotFound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectsNotFound")
            .field("found", &self.found.iter().filter(|o| o.is_some()).count())
            .field("missing", &self.missing)
            .finish()
    }
}

impl<T> fmt::Display for ObjectsNotFound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "objects not found: {:?}", self.missing)
    }
}

impl<T> std::error::Error for ObjectsNotFound<T> {}

impl<T> From<ObjectsNotFound<T>> for MeshError {
    fn from(e: ObjectsNotFound<T>) -> Self {
        MeshError::ObjectsNotFound { missing: e.missing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MeshObjectIdentifier {
        MeshObjectIdentifier::new(s).unwrap()
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            MeshError::NotWithinTransactionBoundaries.kind(),
            ErrorKind::Transaction
        );
        assert_eq!(
            MeshError::RelatedAlready {
                object: id("a"),
                neighbor: id("b")
            }
            .kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            MeshError::NotPermitted {
                object: id("a"),
                operation: Operation::Delete
            }
            .kind(),
            ErrorKind::Permission
        );
        assert_eq!(
            MeshError::ObjectsNotFound { missing: vec![] }.kind(),
            ErrorKind::Lookup
        );
        assert_eq!(
            MeshError::Internal("x".into()).kind(),
            ErrorKind::Unexpected
        );
    }

    #[test]
    fn lock_failures_are_retryable_policy_denials_are_not() {
        let lock = MeshError::CannotObtainLock {
            object: id("a"),
            cause: None,
        };
        let denied = MeshError::NotPermitted {
            object: id("a"),
            operation: Operation::SetProperty,
        };
        assert!(lock.is_retryable());
        assert!(!denied.is_retryable());
        assert_eq!(lock.kind(), denied.kind());
    }

    #[test]
    fn cannot_obtain_lock_carries_timeout_cause() {
        use std::error::Error;
        let err = MeshError::CannotObtainLock {
            object: id("a"),
            cause: Some(RemoteQueryTimeout {
                partner: MeshBaseIdentifier::parse("peer").unwrap(),
                timeout: Duration::from_millis(50),
            }),
        };
        let source = err.source().expect("timeout should be the source");
        assert!(source.to_string().contains("peer"));
    }

    #[test]
    fn objects_not_found_converts() {
        let e: ObjectsNotFound<u8> = ObjectsNotFound {
            found: vec![Some(1), None],
            missing: vec![id("b")],
        };
        assert!(e.to_string().contains("b"));
        let mesh: MeshError = e.into();
        assert!(matches!(mesh, MeshError::ObjectsNotFound { missing } if missing.len() == 1));
    }
}
