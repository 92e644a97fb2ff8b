//! Relationships between MeshObjects.
//!
//! Every relationship is stored twice, once in the adjacency list of each
//! endpoint. The two slots of one relationship carry inverse role sets.
//! Both endpoints are write-locked, in ascending identifier order, for as
//! long as either side is being changed, so no reader ever sees a
//! relationship from one side only.

use std::collections::HashSet;
use std::sync::{Arc, RwLockWriteGuard};

use mesh_types::{now_millis, MeshObjectIdentifier, RoleType};
use tracing::{debug, warn};

use crate::access::Operation;
use crate::change::Change;
use crate::error::{MeshError, MeshResult};
use crate::extension::ObjectExtension;
use crate::object::{ApplyMode, MeshObject, NeighborSlot, ObjectState, Outcome};

/// Write-lock two distinct objects in ascending identifier order. The guards
/// come back in argument order.
pub(crate) fn write_pair<'a, E: ObjectExtension>(
    a: &'a MeshObject<E>,
    b: &'a MeshObject<E>,
) -> (
    RwLockWriteGuard<'a, ObjectState>,
    RwLockWriteGuard<'a, ObjectState>,
) {
    if a.identifier() <= b.identifier() {
        let ga = a.state_mut();
        let gb = b.state_mut();
        (ga, gb)
    } else {
        let gb = b.state_mut();
        let ga = a.state_mut();
        (ga, gb)
    }
}

/// Write-lock distinct objects in ascending identifier order. The guards come
/// back in argument order.
pub(crate) fn write_all<'a, E: ObjectExtension>(
    objects: &[&'a MeshObject<E>],
) -> Vec<RwLockWriteGuard<'a, ObjectState>> {
    let mut order: Vec<usize> = (0..objects.len()).collect();
    order.sort_by(|&x, &y| objects[x].identifier().cmp(objects[y].identifier()));
    let mut guards: Vec<Option<RwLockWriteGuard<'a, ObjectState>>> =
        objects.iter().map(|_| None).collect();
    for i in order {
        guards[i] = Some(objects[i].state_mut());
    }
    guards.into_iter().flatten().collect()
}

fn inverse_of(roles: &[RoleType]) -> Vec<RoleType> {
    roles.iter().map(RoleType::inverse).collect()
}

impl<E: ObjectExtension> MeshObject<E> {
    // -- queries ---------------------------------------------------------------

    /// Identifiers of all neighbors, in the order the relationships were made.
    pub fn neighbor_identifiers(&self) -> Vec<MeshObjectIdentifier> {
        self.state()
            .neighbors
            .iter()
            .map(|s| s.identifier.clone())
            .collect()
    }

    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.state().slot(neighbor).is_some()
    }

    /// The roles this object plays towards `neighbor`. `None` if the two are
    /// not related; an empty list if they are related without roles.
    pub fn roles_towards(&self, neighbor: &MeshObjectIdentifier) -> Option<Vec<RoleType>> {
        self.state().slot(neighbor).map(|s| s.roles().to_vec())
    }

    /// Every neighbor with the roles played towards it.
    pub fn relationships(&self) -> Vec<(MeshObjectIdentifier, Vec<RoleType>)> {
        self.state()
            .neighbors
            .iter()
            .map(|s| (s.identifier.clone(), s.roles().to_vec()))
            .collect()
    }

    /// The neighbors available locally, with no regard to roles.
    pub fn traverse_to_neighbors(&self) -> MeshResult<Vec<Arc<MeshObject<E>>>> {
        let base = self.live_base()?;
        let neighbors = self
            .neighbor_identifiers()
            .iter()
            .filter_map(|id| base.find_by_identifier(id))
            .filter(|n| base.is_permitted(n.identifier(), Operation::Traverse, Some(self.identifier())))
            .collect();
        self.touch_read();
        Ok(neighbors)
    }

    /// The neighbors reached by playing `role` or a specialization of it.
    ///
    /// With `consider_equivalents`, the traversal starts from every member of
    /// this object's equivalence chain. Neighbors not available locally are
    /// skipped.
    pub fn traverse(
        &self,
        role: &RoleType,
        consider_equivalents: bool,
    ) -> MeshResult<Vec<Arc<MeshObject<E>>>> {
        let base = self.live_base()?;
        let mut starts: Vec<Arc<MeshObject<E>>> = Vec::new();
        if consider_equivalents {
            starts = self.equivalents()?;
        }

        let mut seen: HashSet<MeshObjectIdentifier> = HashSet::new();
        let mut candidates: Vec<MeshObjectIdentifier> = Vec::new();
        let mut collect = |state: &ObjectState| {
            for slot in &state.neighbors {
                if slot.roles().iter().any(|r| r.is_specialization_of(role))
                    && seen.insert(slot.identifier.clone())
                {
                    candidates.push(slot.identifier.clone());
                }
            }
        };
        if starts.is_empty() {
            collect(&*self.state());
        } else {
            for start in &starts {
                collect(&*start.state());
            }
        }

        let result = candidates
            .iter()
            .filter(|id| base.is_permitted(id, Operation::Traverse, Some(self.identifier())))
            .filter_map(|id| base.find_by_identifier(id))
            .collect();
        self.touch_read();
        Ok(result)
    }

    fn ensure_distinct(&self, other: &MeshObject<E>) -> MeshResult<()> {
        if self.identifier() == other.identifier() {
            return Err(MeshError::CannotRelateToItself(self.identifier().clone()));
        }
        self.shared_base(other).map(|_| ())
    }

    // -- relate / unrelate -----------------------------------------------------------

    pub fn relate(&self, other: &MeshObject<E>) -> MeshResult<()> {
        self.relate_with(other, ApplyMode::Master).map(|_| ())
    }

    /// Relate two objects without any roles.
    pub fn relate_with(&self, other: &MeshObject<E>, mode: ApplyMode) -> MeshResult<Outcome> {
        self.ensure_distinct(other)?;
        let (_base, tx) = self.begin_update(Operation::Relate, Some(other.identifier()), mode)?;

        let (mut mine, mut theirs) = write_pair(self, other);
        let here = mine.slot(other.identifier()).is_some();
        let there = theirs.slot(self.identifier()).is_some();
        if here || there {
            if mode == ApplyMode::Master {
                return Err(MeshError::RelatedAlready {
                    object: self.identifier().clone(),
                    neighbor: other.identifier().clone(),
                });
            }
            if here && there {
                return Ok(Outcome::AlreadyInState);
            }
            warn!(
                object = %self.identifier(),
                neighbor = %other.identifier(),
                "repairing one-sided relationship"
            );
        }

        let now = now_millis();
        if !here {
            mine.neighbors
                .push(NeighborSlot::new(other.identifier().clone(), &[]));
            mine.updated = now;
            tx.record(Change::NeighborAdded {
                identifier: self.identifier().clone(),
                neighbor: other.identifier().clone(),
            });
        }
        if !there {
            theirs
                .neighbors
                .push(NeighborSlot::new(self.identifier().clone(), &[]));
            theirs.updated = now;
            tx.record(Change::NeighborAdded {
                identifier: other.identifier().clone(),
                neighbor: self.identifier().clone(),
            });
        }
        debug!(object = %self.identifier(), neighbor = %other.identifier(), "related");
        Ok(Outcome::Applied)
    }

    pub fn unrelate(&self, other: &MeshObject<E>) -> MeshResult<()> {
        self.unrelate_with(other, ApplyMode::Master).map(|_| ())
    }

    /// Remove the relationship between two objects with all its roles.
    ///
    /// A master unrelate of a relationship that still carries roles must also
    /// be allowed to unbless those roles on both ends.
    pub fn unrelate_with(&self, other: &MeshObject<E>, mode: ApplyMode) -> MeshResult<Outcome> {
        self.ensure_distinct(other)?;
        let (base, tx) = self.begin_update(Operation::Unrelate, Some(other.identifier()), mode)?;

        let has_roles = match self.roles_towards(other.identifier()) {
            Some(roles) => !roles.is_empty(),
            None => other
                .roles_towards(self.identifier())
                .is_some_and(|r| !r.is_empty()),
        };
        if mode == ApplyMode::Master && has_roles {
            base.check_permission(self, Operation::UnblessRole, Some(other.identifier()))?;
            base.check_permission(other, Operation::UnblessRole, Some(self.identifier()))?;
        }

        let (mut mine, mut theirs) = write_pair(self, other);
        let here = mine.remove_slot(other.identifier());
        let there = theirs.remove_slot(self.identifier());
        match (&here, &there) {
            (None, None) => {
                return match mode {
                    ApplyMode::Master => Err(MeshError::NotRelated {
                        object: self.identifier().clone(),
                        neighbor: other.identifier().clone(),
                    }),
                    ApplyMode::Ripple => Ok(Outcome::AlreadyInState),
                };
            }
            (Some(_), None) | (None, Some(_)) => warn!(
                object = %self.identifier(),
                neighbor = %other.identifier(),
                "removing one-sided relationship"
            ),
            (Some(_), Some(_)) => {}
        }

        let now = now_millis();
        if let Some(slot) = here {
            mine.updated = now;
            tx.record(Change::NeighborRemoved {
                identifier: self.identifier().clone(),
                neighbor: other.identifier().clone(),
                roles: slot.roles().to_vec(),
            });
        }
        if let Some(slot) = there {
            theirs.updated = now;
            tx.record(Change::NeighborRemoved {
                identifier: other.identifier().clone(),
                neighbor: self.identifier().clone(),
                roles: slot.roles().to_vec(),
            });
        }
        debug!(object = %self.identifier(), neighbor = %other.identifier(), "unrelated");
        Ok(Outcome::Applied)
    }

    // -- roles -------------------------------------------------------------------------

    pub fn bless_relationship(&self, roles: &[RoleType], other: &MeshObject<E>) -> MeshResult<()> {
        self.bless_relationship_with(roles, other, ApplyMode::Master)
            .map(|_| ())
    }

    /// Add roles this object plays towards `other`; `other` plays the inverse
    /// roles towards this object. The two must be related already.
    ///
    /// A role replaces a more general role of the same end already present.
    pub fn bless_relationship_with(
        &self,
        roles: &[RoleType],
        other: &MeshObject<E>,
        mode: ApplyMode,
    ) -> MeshResult<Outcome> {
        self.ensure_distinct(other)?;
        let (base, tx) = self.begin_update(Operation::BlessRole, Some(other.identifier()), mode)?;
        if mode == ApplyMode::Master {
            base.check_permission(other, Operation::BlessRole, Some(self.identifier()))?;
        }
        if let Some(role) = roles.iter().find(|r| r.is_abstract()) {
            return Err(MeshError::IsAbstract(role.relationship_type().identifier().clone()));
        }

        let (mut mine, mut theirs) = write_pair(self, other);
        if mine.slot(other.identifier()).is_none() || theirs.slot(self.identifier()).is_none() {
            return match mode {
                ApplyMode::Master => Err(MeshError::NotRelated {
                    object: self.identifier().clone(),
                    neighbor: other.identifier().clone(),
                }),
                ApplyMode::Ripple => {
                    warn!(
                        object = %self.identifier(),
                        neighbor = %other.identifier(),
                        "cannot bless roles of a missing relationship"
                    );
                    Ok(Outcome::NotFound)
                }
            };
        }

        if mode == ApplyMode::Master {
            for role in roles {
                let inverse = role.inverse();
                let checks = [
                    (self.identifier(), &*mine, role.required_entity_type()),
                    (other.identifier(), &*theirs, inverse.required_entity_type()),
                ];
                for (object, state, required) in checks {
                    if let Some(required) = required {
                        if !state.is_blessed_by(required) {
                            return Err(MeshError::EntityNotBlessed {
                                object: object.clone(),
                                entity_type: required.identifier().clone(),
                            });
                        }
                    }
                }
            }
        }

        let current = mine
            .slot(other.identifier())
            .map(|s| s.roles().to_vec())
            .unwrap_or_default();
        let mut added: Vec<RoleType> = Vec::new();
        let mut replaced: Vec<RoleType> = Vec::new();
        for role in roles {
            let present = current
                .iter()
                .chain(&added)
                .any(|r| r.is_specialization_of(role));
            if present {
                match mode {
                    ApplyMode::Master => {
                        return Err(MeshError::RoleTypeBlessedAlready {
                            object: self.identifier().clone(),
                            role: role.identifier(),
                            neighbor: other.identifier().clone(),
                        })
                    }
                    ApplyMode::Ripple => continue,
                }
            }
            for general in current.iter().filter(|r| role.is_specialization_of(r)) {
                if !replaced.contains(general) {
                    replaced.push(general.clone());
                }
            }
            added.push(role.clone());
        }
        if added.is_empty() {
            return Ok(Outcome::AlreadyInState);
        }

        let now = now_millis();
        let mut changes = Vec::new();
        if !replaced.is_empty() {
            let inverse = inverse_of(&replaced);
            if let Some(slot) = mine.slot_mut(other.identifier()) {
                slot.remove_roles(&replaced);
            }
            if let Some(slot) = theirs.slot_mut(self.identifier()) {
                slot.remove_roles(&inverse);
            }
            changes.push(Change::RoleTypesRemoved {
                identifier: self.identifier().clone(),
                neighbor: other.identifier().clone(),
                roles: replaced,
            });
            changes.push(Change::RoleTypesRemoved {
                identifier: other.identifier().clone(),
                neighbor: self.identifier().clone(),
                roles: inverse,
            });
        }
        let inverse = inverse_of(&added);
        if let Some(slot) = mine.slot_mut(other.identifier()) {
            slot.add_roles(&added);
        }
        if let Some(slot) = theirs.slot_mut(self.identifier()) {
            slot.add_roles(&inverse);
        }
        mine.updated = now;
        theirs.updated = now;
        debug!(object = %self.identifier(), neighbor = %other.identifier(), roles = ?added, "blessed roles");
        changes.push(Change::RoleTypesAdded {
            identifier: self.identifier().clone(),
            neighbor: other.identifier().clone(),
            roles: added,
        });
        changes.push(Change::RoleTypesAdded {
            identifier: other.identifier().clone(),
            neighbor: self.identifier().clone(),
            roles: inverse,
        });
        for change in changes {
            tx.record(change);
        }
        Ok(Outcome::Applied)
    }

    pub fn unbless_relationship(&self, roles: &[RoleType], other: &MeshObject<E>) -> MeshResult<()> {
        self.unbless_relationship_with(roles, other, ApplyMode::Master)
            .map(|_| ())
    }

    /// Remove roles this object plays towards `other`, and their inverses
    /// from `other`. The relationship itself stays.
    pub fn unbless_relationship_with(
        &self,
        roles: &[RoleType],
        other: &MeshObject<E>,
        mode: ApplyMode,
    ) -> MeshResult<Outcome> {
        self.ensure_distinct(other)?;
        let (base, tx) =
            self.begin_update(Operation::UnblessRole, Some(other.identifier()), mode)?;
        if mode == ApplyMode::Master {
            base.check_permission(other, Operation::UnblessRole, Some(self.identifier()))?;
        }

        let (mut mine, mut theirs) = write_pair(self, other);
        let current = match mine.slot(other.identifier()) {
            Some(slot) => slot.roles().to_vec(),
            None => {
                return match mode {
                    ApplyMode::Master => Err(MeshError::NotRelated {
                        object: self.identifier().clone(),
                        neighbor: other.identifier().clone(),
                    }),
                    ApplyMode::Ripple => Ok(Outcome::AlreadyInState),
                };
            }
        };

        let mut removing: Vec<RoleType> = Vec::new();
        for role in roles {
            if !current.contains(role) {
                match mode {
                    ApplyMode::Master => {
                        return Err(MeshError::RoleTypeNotBlessed {
                            object: self.identifier().clone(),
                            role: role.identifier(),
                            neighbor: other.identifier().clone(),
                        })
                    }
                    ApplyMode::Ripple => continue,
                }
            }
            if !removing.contains(role) {
                removing.push(role.clone());
            }
        }
        if removing.is_empty() {
            return Ok(Outcome::AlreadyInState);
        }

        let inverse = inverse_of(&removing);
        if let Some(slot) = mine.slot_mut(other.identifier()) {
            slot.remove_roles(&removing);
        }
        match theirs.slot_mut(self.identifier()) {
            Some(slot) => slot.remove_roles(&inverse),
            None => warn!(
                object = %self.identifier(),
                neighbor = %other.identifier(),
                "unblessing roles of a one-sided relationship"
            ),
        }
        let now = now_millis();
        mine.updated = now;
        theirs.updated = now;
        debug!(object = %self.identifier(), neighbor = %other.identifier(), roles = ?removing, "unblessed roles");
        tx.record(Change::RoleTypesRemoved {
            identifier: self.identifier().clone(),
            neighbor: other.identifier().clone(),
            roles: removing,
        });
        tx.record(Change::RoleTypesRemoved {
            identifier: other.identifier().clone(),
            neighbor: self.identifier().clone(),
            roles: inverse,
        });
        Ok(Outcome::Applied)
    }
}
