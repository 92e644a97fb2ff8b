//! Ripple operations: applying changes already confirmed by a peer.
//!
//! A ripple never checks permissions and never asks for a lock, so replaying
//! a change cannot trigger another round of propagation. It is forgiving:
//! finding the target state in place yields [`Outcome::AlreadyInState`], and
//! a peer that is not replicated here yields [`Outcome::NotFound`] after a
//! log line rather than an error. Applying the same ripple twice leaves the
//! same graph as applying it once.

use std::sync::Arc;

use mesh_store::{ApplyMode, Change, EquivalencePointers, MeshResult, Outcome};
use mesh_types::{
    EntityType, MeshBaseIdentifier, MeshObjectIdentifier, PropertyType, PropertyValue, RoleType,
};
use tracing::{debug, warn};

use crate::replica::ReplicaBookkeeping;
use crate::{NetMeshBase, NetMeshObject};

pub trait RippleOperations {
    fn ripple_bless(&self, object: &MeshObjectIdentifier, types: &[EntityType]) -> MeshResult<Outcome>;

    fn ripple_unbless(&self, object: &MeshObjectIdentifier, types: &[EntityType]) -> MeshResult<Outcome>;

    fn ripple_relate(
        &self,
        object: &MeshObjectIdentifier,
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_unrelate(
        &self,
        object: &MeshObjectIdentifier,
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_bless_relationship(
        &self,
        object: &MeshObjectIdentifier,
        roles: &[RoleType],
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_unbless_relationship(
        &self,
        object: &MeshObjectIdentifier,
        roles: &[RoleType],
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_add_as_equivalent(
        &self,
        object: &MeshObjectIdentifier,
        other: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_remove_as_equivalent(
        &self,
        object: &MeshObjectIdentifier,
        representative: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome>;

    fn ripple_set_property_values(
        &self,
        object: &MeshObjectIdentifier,
        values: &[(PropertyType, Option<PropertyValue>)],
    ) -> MeshResult<Outcome>;

    fn ripple_delete(&self, object: &MeshObjectIdentifier) -> MeshResult<Outcome>;
}

impl RippleOperations for NetMeshBase {
    fn ripple_bless(&self, object: &MeshObjectIdentifier, types: &[EntityType]) -> MeshResult<Outcome> {
        with_object(self, object, |o| o.bless_with(types, ApplyMode::Ripple))
    }

    fn ripple_unbless(&self, object: &MeshObjectIdentifier, types: &[EntityType]) -> MeshResult<Outcome> {
        with_object(self, object, |o| o.unbless_with(types, ApplyMode::Ripple))
    }

    fn ripple_relate(
        &self,
        object: &MeshObjectIdentifier,
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        with_pair(self, object, neighbor, |a, b| a.relate_with(b, ApplyMode::Ripple))
    }

    fn ripple_unrelate(
        &self,
        object: &MeshObjectIdentifier,
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        with_pair(self, object, neighbor, |a, b| a.unrelate_with(b, ApplyMode::Ripple))
    }

    fn ripple_bless_relationship(
        &self,
        object: &MeshObjectIdentifier,
        roles: &[RoleType],
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        with_pair(self, object, neighbor, |a, b| {
            a.bless_relationship_with(roles, b, ApplyMode::Ripple)
        })
    }

    fn ripple_unbless_relationship(
        &self,
        object: &MeshObjectIdentifier,
        roles: &[RoleType],
        neighbor: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        with_pair(self, object, neighbor, |a, b| {
            a.unbless_relationship_with(roles, b, ApplyMode::Ripple)
        })
    }

    fn ripple_add_as_equivalent(
        &self,
        object: &MeshObjectIdentifier,
        other: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        if object == other {
            return Ok(Outcome::AlreadyInState);
        }
        with_pair(self, object, other, |a, b| {
            a.add_as_equivalent_with(b, ApplyMode::Ripple)
        })
    }

    fn ripple_remove_as_equivalent(
        &self,
        object: &MeshObjectIdentifier,
        representative: &MeshObjectIdentifier,
    ) -> MeshResult<Outcome> {
        with_object(self, object, |o| {
            o.remove_as_equivalent_with(representative, ApplyMode::Ripple)
        })
    }

    fn ripple_set_property_values(
        &self,
        object: &MeshObjectIdentifier,
        values: &[(PropertyType, Option<PropertyValue>)],
    ) -> MeshResult<Outcome> {
        with_object(self, object, |o| {
            o.set_property_values_with(values, ApplyMode::Ripple)
        })
    }

    fn ripple_delete(&self, object: &MeshObjectIdentifier) -> MeshResult<Outcome> {
        match self.find_by_identifier(object) {
            Some(o) => o.delete_with(ApplyMode::Ripple),
            None => {
                debug!(%object, "already deleted");
                Ok(Outcome::AlreadyInState)
            }
        }
    }
}

fn with_object(
    base: &NetMeshBase,
    identifier: &MeshObjectIdentifier,
    apply: impl FnOnce(&NetMeshObject) -> MeshResult<Outcome>,
) -> MeshResult<Outcome> {
    match base.find_by_identifier(identifier) {
        Some(object) => apply(object.as_ref()),
        None => {
            warn!(store = %base.identifier(), object = %identifier, "ripple target not replicated here");
            Ok(Outcome::NotFound)
        }
    }
}

fn with_pair(
    base: &NetMeshBase,
    first: &MeshObjectIdentifier,
    second: &MeshObjectIdentifier,
    apply: impl FnOnce(&NetMeshObject, &NetMeshObject) -> MeshResult<Outcome>,
) -> MeshResult<Outcome> {
    match base.find_by_identifiers(&[first.clone(), second.clone()]).as_slice() {
        [Some(a), Some(b)] => apply(a.as_ref(), b.as_ref()),
        _ => {
            warn!(store = %base.identifier(), %first, %second, "ripple peer not replicated here");
            Ok(Outcome::NotFound)
        }
    }
}

/// Replay `changes`, confirmed by the peer `from`, into the local replicas.
///
/// Runs in the calling thread's transaction on `base` if there is one,
/// otherwise in a transaction of its own. Returns one outcome per change.
/// Objects created at the peer become replicas whose home and lock lie
/// towards `from`. Lock events are the peer's own business and are reported
/// as already in state.
pub fn ripple_changes(
    base: &Arc<NetMeshBase>,
    from: &MeshBaseIdentifier,
    changes: &[Change],
) -> MeshResult<Vec<Outcome>> {
    let created = base.create_transaction_asap_if_needed()?;
    let outcomes = changes
        .iter()
        .enumerate()
        .map(|(i, change)| {
            if is_replaced_by_bless(change, changes.get(i + 1)) {
                return Ok(Outcome::AlreadyInState);
            }
            ripple_change(base, from, change)
        })
        .collect::<MeshResult<Vec<_>>>();

    match (created, outcomes) {
        (Some(tx), Ok(outcomes)) => {
            tx.commit()?;
            Ok(outcomes)
        }
        (Some(tx), Err(e)) => {
            if let Err(rollback) = tx.rollback() {
                warn!(store = %base.identifier(), error = %rollback, "rollback of failed ripple failed");
            }
            Err(e)
        }
        (None, outcomes) => outcomes,
    }
}

/// Blessing with a subtype records the removal of the replaced supertypes
/// right before the addition. Rippling the bless replaces them the same way
/// without dropping the property values they share.
fn is_replaced_by_bless(change: &Change, next: Option<&Change>) -> bool {
    let (
        Change::TypesRemoved {
            identifier,
            types: removed,
            removed_properties,
        },
        Some(Change::TypesAdded {
            identifier: next_identifier,
            types: added,
            ..
        }),
    ) = (change, next)
    else {
        return false;
    };
    identifier == next_identifier
        && removed_properties.is_empty()
        && removed
            .iter()
            .all(|old| added.iter().any(|t| t.is_subtype_of(old)))
}

fn ripple_change(base: &NetMeshBase, from: &MeshBaseIdentifier, change: &Change) -> MeshResult<Outcome> {
    match change {
        Change::Created { identifier, types } => {
            if base.find_by_identifier(identifier).is_some() {
                return Ok(Outcome::AlreadyInState);
            }
            let replica = base
                .lifecycle()
                .create_mesh_object_in_mode(Some(identifier.clone()), types, None, ApplyMode::Ripple)?;
            replica.make_replica_from(from, 0);
            Ok(Outcome::Applied)
        }
        Change::Deleted { identifier, .. } => base.ripple_delete(identifier),
        Change::PropertyChanged {
            identifier,
            property_type,
            new,
            ..
        } => base.ripple_set_property_values(identifier, &[(property_type.clone(), new.clone())]),
        Change::TypesAdded { identifier, types, .. } => base.ripple_bless(identifier, types),
        Change::TypesRemoved { identifier, types, .. } => base.ripple_unbless(identifier, types),
        Change::NeighborAdded {
            identifier,
            neighbor,
        } => base.ripple_relate(identifier, neighbor),
        Change::NeighborRemoved {
            identifier,
            neighbor,
            ..
        } => base.ripple_unrelate(identifier, neighbor),
        Change::RoleTypesAdded {
            identifier,
            neighbor,
            roles,
        } => base.ripple_bless_relationship(identifier, roles, neighbor),
        Change::RoleTypesRemoved {
            identifier,
            neighbor,
            roles,
        } => base.ripple_unbless_relationship(identifier, roles, neighbor),
        Change::EquivalentsChanged {
            identifier,
            old,
            new,
        } => ripple_equivalents(base, identifier, old, new),
        Change::LockGained { .. } | Change::LockLost { .. } => Ok(Outcome::AlreadyInState),
    }
}

/// An object that lost both pointers left its chain. A pointer that appeared
/// means a chain was joined on that side; the object's own chain follows a
/// new left neighbor and precedes a new right one.
fn ripple_equivalents(
    base: &NetMeshBase,
    identifier: &MeshObjectIdentifier,
    old: &EquivalencePointers,
    new: &EquivalencePointers,
) -> MeshResult<Outcome> {
    if new.is_empty() {
        return match old.left.as_ref().or(old.right.as_ref()) {
            Some(representative) => base.ripple_remove_as_equivalent(identifier, representative),
            None => Ok(Outcome::AlreadyInState),
        };
    }
    let mut outcome = Outcome::AlreadyInState;
    let joined = [(&new.left, &old.left, true), (&new.right, &old.right, false)];
    for (pointer, previous, is_left) in joined {
        let Some(pointer) = pointer.as_ref().filter(|p| previous.as_ref() != Some(*p)) else {
            continue;
        };
        let result = if is_left {
            base.ripple_add_as_equivalent(identifier, pointer)?
        } else {
            base.ripple_add_as_equivalent(pointer, identifier)?
        };
        match result {
            Outcome::Applied => outcome = Outcome::Applied,
            Outcome::NotFound if outcome != Outcome::Applied => outcome = Outcome::NotFound,
            _ => {}
        }
    }
    Ok(outcome)
}
