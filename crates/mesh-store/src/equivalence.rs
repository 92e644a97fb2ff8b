//! Equivalence chains.
//!
//! Objects that denote the same thing are linked into a doubly linked chain
//! of identifiers. Walks over a chain never revisit a member, so a corrupted
//! chain ends the walk with a warning instead of looping.

use std::collections::HashSet;
use std::sync::Arc;

use mesh_types::{now_millis, MeshObjectIdentifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::access::Operation;
use crate::change::Change;
use crate::error::{MeshError, MeshResult};
use crate::extension::ObjectExtension;
use crate::meshbase::MeshBase;
use crate::object::{ApplyMode, MeshObject, Outcome};
use crate::relationship::write_all;

/// The left and right neighbors of an object in its equivalence chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EquivalencePointers {
    pub left: Option<MeshObjectIdentifier>,
    pub right: Option<MeshObjectIdentifier>,
}

impl EquivalencePointers {
    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Left,
    Right,
}

impl<E: ObjectExtension> MeshObject<E> {
    pub fn equivalence_pointers(&self) -> EquivalencePointers {
        self.state().equivalents.clone()
    }

    /// Identifiers of the whole equivalence chain, leftmost first. Always
    /// contains this object.
    pub fn equivalent_identifiers(&self) -> Vec<MeshObjectIdentifier> {
        let base = self.mesh_base();
        let start = self.equivalence_pointers();
        let mut visited: HashSet<MeshObjectIdentifier> = HashSet::new();
        visited.insert(self.identifier().clone());

        let mut left = self.walk(base.as_ref(), start.left, Direction::Left, &mut visited);
        left.reverse();
        let right = self.walk(base.as_ref(), start.right, Direction::Right, &mut visited);

        left.push(self.identifier().clone());
        left.extend(right);
        left
    }

    fn walk(
        &self,
        base: Option<&Arc<MeshBase<E>>>,
        mut next: Option<MeshObjectIdentifier>,
        direction: Direction,
        visited: &mut HashSet<MeshObjectIdentifier>,
    ) -> Vec<MeshObjectIdentifier> {
        let mut result = Vec::new();
        while let Some(id) = next.take() {
            if !visited.insert(id.clone()) {
                warn!(object = %self.identifier(), revisited = %id, "cycle in equivalence chain");
                break;
            }
            let Some(member) = base.and_then(|b| b.find_by_identifier(&id)) else {
                warn!(object = %self.identifier(), unresolved = %id, "equivalence chain ends in unresolved member");
                result.push(id);
                break;
            };
            let pointers = member.equivalence_pointers();
            next = match direction {
                Direction::Left => pointers.left,
                Direction::Right => pointers.right,
            };
            result.push(id);
        }
        result
    }

    /// The MeshObjects of the equivalence chain that are available locally,
    /// leftmost first. Always contains this object.
    pub fn equivalents(&self) -> MeshResult<Vec<Arc<MeshObject<E>>>> {
        let base = self.live_base()?;
        let objects = self
            .equivalent_identifiers()
            .iter()
            .filter_map(|id| base.find_by_identifier(id))
            .collect();
        self.touch_read();
        Ok(objects)
    }

    pub fn add_as_equivalent(&self, other: &MeshObject<E>) -> MeshResult<()> {
        self.add_as_equivalent_with(other, ApplyMode::Master)
            .map(|_| ())
    }

    /// Join this object's equivalence chain with `other`'s: `other`'s chain
    /// comes first, this chain follows.
    pub fn add_as_equivalent_with(
        &self,
        other: &MeshObject<E>,
        mode: ApplyMode,
    ) -> MeshResult<Outcome> {
        let (base, tx) =
            self.begin_update(Operation::AddEquivalent, Some(other.identifier()), mode)?;
        self.shared_base(other)?;

        let mine = self.equivalent_identifiers();
        let theirs = other.equivalent_identifiers();
        if mine.contains(other.identifier()) || theirs.contains(self.identifier()) {
            return match mode {
                ApplyMode::Master => Err(MeshError::EquivalentAlready {
                    object: self.identifier().clone(),
                    other: other.identifier().clone(),
                }),
                ApplyMode::Ripple => Ok(Outcome::AlreadyInState),
            };
        }

        // Both chains always contain at least their own starting object.
        let (Some(my_leftmost), Some(their_rightmost)) = (mine.first(), theirs.last()) else {
            return Err(MeshError::Internal("empty equivalence chain".into()));
        };
        let resolved = base.find_by_identifiers(&[my_leftmost.clone(), their_rightmost.clone()]);
        let (Some(left_end), Some(right_end)) = (&resolved[1], &resolved[0]) else {
            let missing: Vec<MeshObjectIdentifier> = [my_leftmost, their_rightmost]
                .into_iter()
                .zip(&resolved)
                .filter(|(_, found)| found.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            warn!(object = %self.identifier(), ?missing, "cannot join equivalence chains");
            return match mode {
                ApplyMode::Master => Err(MeshError::ObjectsNotFound { missing }),
                ApplyMode::Ripple => Ok(Outcome::NotFound),
            };
        };

        // `left_end` is the rightmost of `other`'s chain, `right_end` the
        // leftmost of this chain.
        let mut guards = write_all(&[left_end.as_ref(), right_end.as_ref()]);
        let now = now_millis();
        let old_left = guards[0].equivalents.clone();
        guards[0].equivalents.right = Some(right_end.identifier().clone());
        guards[0].updated = now;
        let old_right = guards[1].equivalents.clone();
        guards[1].equivalents.left = Some(left_end.identifier().clone());
        guards[1].updated = now;

        tx.record(Change::EquivalentsChanged {
            identifier: left_end.identifier().clone(),
            old: old_left,
            new: guards[0].equivalents.clone(),
        });
        tx.record(Change::EquivalentsChanged {
            identifier: right_end.identifier().clone(),
            old: old_right,
            new: guards[1].equivalents.clone(),
        });
        debug!(object = %self.identifier(), other = %other.identifier(), "joined equivalence chains");
        Ok(Outcome::Applied)
    }

    pub fn remove_as_equivalent(&self, representative: &MeshObjectIdentifier) -> MeshResult<()> {
        self.remove_as_equivalent_with(representative, ApplyMode::Master)
            .map(|_| ())
    }

    /// Leave the equivalence chain `representative` belongs to, reconnecting
    /// the former neighbors in the chain to each other.
    pub fn remove_as_equivalent_with(
        &self,
        representative: &MeshObjectIdentifier,
        mode: ApplyMode,
    ) -> MeshResult<Outcome> {
        let (base, tx) =
            self.begin_update(Operation::RemoveEquivalent, Some(representative), mode)?;

        let chain = self.equivalent_identifiers();
        if representative == self.identifier() || !chain.contains(representative) {
            return match mode {
                ApplyMode::Master => Err(MeshError::NotEquivalent {
                    object: self.identifier().clone(),
                    other: representative.clone(),
                }),
                ApplyMode::Ripple => Ok(Outcome::AlreadyInState),
            };
        }

        let pointers = self.equivalence_pointers();
        let left = pointers
            .left
            .as_ref()
            .filter(|id| *id != self.identifier())
            .and_then(|id| base.find_by_identifier(id));
        let right = pointers
            .right
            .as_ref()
            .filter(|id| *id != self.identifier() && pointers.left.as_ref() != Some(*id))
            .and_then(|id| base.find_by_identifier(id));

        let mut members: Vec<&MeshObject<E>> = vec![self];
        members.extend(left.as_deref());
        members.extend(right.as_deref());
        let mut guards = write_all(&members);
        let now = now_millis();

        let mut changes = Vec::new();
        let old = guards[0].equivalents.clone();
        guards[0].equivalents = Default::default();
        guards[0].updated = now;
        changes.push(Change::EquivalentsChanged {
            identifier: self.identifier().clone(),
            old,
            new: Default::default(),
        });

        let mut next = 1;
        if let Some(left) = &left {
            let old = guards[next].equivalents.clone();
            guards[next].equivalents.right = pointers.right.clone();
            guards[next].updated = now;
            changes.push(Change::EquivalentsChanged {
                identifier: left.identifier().clone(),
                old,
                new: guards[next].equivalents.clone(),
            });
            next += 1;
        }
        if let Some(right) = &right {
            let old = guards[next].equivalents.clone();
            guards[next].equivalents.left = pointers.left.clone();
            guards[next].updated = now;
            changes.push(Change::EquivalentsChanged {
                identifier: right.identifier().clone(),
                old,
                new: guards[next].equivalents.clone(),
            });
        }
        drop(guards);

        if (pointers.left.is_some() && left.is_none()) || (pointers.right.is_some() && right.is_none()) {
            warn!(object = %self.identifier(), "equivalence neighbor not available locally");
        }
        for change in changes {
            tx.record(change);
        }
        debug!(object = %self.identifier(), "left equivalence chain");
        Ok(Outcome::Applied)
    }
}
