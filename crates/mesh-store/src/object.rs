//! MeshObject: a node of the graph.
//!
//! Every mutation runs the same preamble: the object must be alive, the
//! calling thread must own the store's active transaction, and master
//! operations must pass the permission checks. Only then is object state
//! locked and changed, and every change is recorded into the transaction.
//!
//! Relationship operations live in [`relationship`](crate::relationship),
//! equivalence chains in [`equivalence`](crate::equivalence).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use mesh_types::{
    now_millis, EntityType, MeshObjectIdentifier, PropertyType, PropertyValue, RoleType,
    Timestamps,
};
use tracing::{debug, warn};

use crate::access::Operation;
use crate::change::Change;
use crate::equivalence::EquivalencePointers;
use crate::error::{ErrorKind, MeshError, MeshResult};
use crate::extension::{Local, ObjectExtension};
use crate::externalized::{ExternalizedMeshObject, MeshObjectSnapshot};
use crate::meshbase::MeshBase;
use crate::transaction::Transaction;

/// How strictly an operation is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplyMode {
    /// A change originating here: permission and lock checks run, and
    /// finding the target state already in place is an error.
    Master,
    /// Replay of a change already confirmed elsewhere: no permission or lock
    /// checks, and finding the target state already in place is a no-op.
    Ripple,
}

/// Result of a mode-aware operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Applied,
    AlreadyInState,
    /// The object or a peer it refers to is not available locally.
    NotFound,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

// ---------------------------------------------------------------------------
// Object state
// ---------------------------------------------------------------------------

/// One entry of the adjacency list. An empty role set is always `None`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct NeighborSlot {
    pub(crate) identifier: MeshObjectIdentifier,
    pub(crate) roles: Option<Vec<RoleType>>,
}

impl NeighborSlot {
    pub(crate) fn new(identifier: MeshObjectIdentifier, roles: &[RoleType]) -> Self {
        let mut slot = Self {
            identifier,
            roles: None,
        };
        slot.add_roles(roles);
        slot
    }

    pub(crate) fn roles(&self) -> &[RoleType] {
        self.roles.as_deref().unwrap_or(&[])
    }

    pub(crate) fn add_roles(&mut self, roles: &[RoleType]) {
        for role in roles {
            let current = self.roles.get_or_insert_with(Vec::new);
            if !current.contains(role) {
                current.push(role.clone());
            }
        }
        if self.roles.as_ref().is_some_and(Vec::is_empty) {
            self.roles = None;
        }
    }

    pub(crate) fn remove_roles(&mut self, roles: &[RoleType]) {
        if let Some(current) = &mut self.roles {
            current.retain(|r| !roles.contains(r));
            if current.is_empty() {
                self.roles = None;
            }
        }
    }
}

pub(crate) struct ObjectState {
    pub(crate) created: i64,
    pub(crate) updated: i64,
    pub(crate) expires: i64,
    pub(crate) types: Vec<EntityType>,
    pub(crate) properties: BTreeMap<PropertyType, PropertyValue>,
    pub(crate) neighbors: Vec<NeighborSlot>,
    pub(crate) equivalents: EquivalencePointers,
}

impl ObjectState {
    fn new(timestamps: &Timestamps) -> Self {
        Self {
            created: timestamps.created,
            updated: timestamps.updated,
            expires: timestamps.expires,
            types: Vec::new(),
            properties: BTreeMap::new(),
            neighbors: Vec::new(),
            equivalents: EquivalencePointers::default(),
        }
    }

    pub(crate) fn slot(&self, neighbor: &MeshObjectIdentifier) -> Option<&NeighborSlot> {
        self.neighbors.iter().find(|s| &s.identifier == neighbor)
    }

    pub(crate) fn slot_mut(&mut self, neighbor: &MeshObjectIdentifier) -> Option<&mut NeighborSlot> {
        self.neighbors.iter_mut().find(|s| &s.identifier == neighbor)
    }

    pub(crate) fn remove_slot(&mut self, neighbor: &MeshObjectIdentifier) -> Option<NeighborSlot> {
        let index = self.neighbors.iter().position(|s| &s.identifier == neighbor)?;
        Some(self.neighbors.remove(index))
    }

    /// Blessed with `entity_type` or one of its subtypes.
    pub(crate) fn is_blessed_by(&self, entity_type: &EntityType) -> bool {
        self.types.iter().any(|t| t.is_subtype_of(entity_type))
    }

    fn declares(&self, property_type: &PropertyType) -> bool {
        self.types.iter().any(|t| t.declares(property_type))
    }

    /// Adds the mandatory properties `types` declare that are not set yet.
    fn initialize_properties(&mut self, types: &[EntityType]) -> Vec<PropertyType> {
        let mut initialized = Vec::new();
        for t in types {
            for pt in t.property_types() {
                if self.properties.contains_key(&pt) {
                    continue;
                }
                if let Some(default) = pt.default_value() {
                    self.properties.insert(pt.clone(), default.clone());
                    initialized.push(pt);
                }
            }
        }
        initialized
    }
}

// ---------------------------------------------------------------------------
// MeshObject
// ---------------------------------------------------------------------------

/// A node of the graph held by a [`MeshBase`].
///
/// Once deleted, a MeshObject is a tombstone: it still answers
/// [`identifier`](Self::identifier) but every other operation fails with
/// [`MeshError::ObjectDead`].
pub struct MeshObject<E: ObjectExtension = Local> {
    identifier: MeshObjectIdentifier,
    base: RwLock<Weak<MeshBase<E>>>,
    state: RwLock<ObjectState>,
    time_read: AtomicI64,
    extension: E,
}

impl<E: ObjectExtension> MeshObject<E> {
    pub(crate) fn new(
        identifier: MeshObjectIdentifier,
        base: Weak<MeshBase<E>>,
        timestamps: Timestamps,
        types: &[EntityType],
        extension: E,
    ) -> Self {
        let mut state = ObjectState::new(&timestamps);
        state.types = types.to_vec();
        state.initialize_properties(types);
        Self {
            identifier,
            base: RwLock::new(base),
            state: RwLock::new(state),
            time_read: AtomicI64::new(timestamps.read),
            extension,
        }
    }

    /// Bring an object back from a snapshot.
    pub(crate) fn restored(
        snapshot: &MeshObjectSnapshot,
        base: Weak<MeshBase<E>>,
        extension: E,
    ) -> Self {
        let mut state = ObjectState::new(&snapshot.timestamps);
        state.types = snapshot.types.clone();
        state.properties = snapshot.properties.iter().cloned().collect();
        state.neighbors = snapshot
            .neighbors
            .iter()
            .map(|(id, roles)| NeighborSlot::new(id.clone(), roles))
            .collect();
        state.equivalents = snapshot.equivalents.clone();
        Self {
            identifier: snapshot.identifier.clone(),
            base: RwLock::new(base),
            state: RwLock::new(state),
            time_read: AtomicI64::new(snapshot.timestamps.read),
            extension,
        }
    }

    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.identifier
    }

    /// The store holding this object, or `None` once it has been deleted.
    pub fn mesh_base(&self) -> Option<Arc<MeshBase<E>>> {
        self.base.read().expect("lock poisoned").upgrade()
    }

    pub fn is_dead(&self) -> bool {
        self.mesh_base().is_none()
    }

    pub fn extension(&self) -> &E {
        &self.extension
    }

    pub fn is_home_object(&self) -> bool {
        self.identifier.is_home()
    }

    pub fn timestamps(&self) -> Timestamps {
        let state = self.state();
        Timestamps {
            created: state.created,
            updated: state.updated,
            read: self.time_read.load(Ordering::Acquire),
            expires: state.expires,
        }
    }

    pub fn time_created(&self) -> i64 {
        self.state().created
    }

    pub fn time_updated(&self) -> i64 {
        self.state().updated
    }

    pub fn time_read(&self) -> i64 {
        self.time_read.load(Ordering::Acquire)
    }

    pub fn time_expires(&self) -> i64 {
        self.state().expires
    }

    // -- internals -------------------------------------------------------------

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, ObjectState> {
        self.state.read().expect("lock poisoned")
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, ObjectState> {
        self.state.write().expect("lock poisoned")
    }

    pub(crate) fn touch_read(&self) {
        self.time_read.fetch_max(now_millis(), Ordering::AcqRel);
    }

    pub(crate) fn sever(&self) {
        *self.base.write().expect("lock poisoned") = Weak::new();
    }

    pub(crate) fn revive(&self, base: Weak<MeshBase<E>>) {
        *self.base.write().expect("lock poisoned") = base;
    }

    /// The owning store, failing if this object or the store is dead.
    pub(crate) fn live_base(&self) -> MeshResult<Arc<MeshBase<E>>> {
        let base = self
            .mesh_base()
            .ok_or_else(|| MeshError::ObjectDead(self.identifier.clone()))?;
        if base.is_dead() {
            return Err(MeshError::MeshBaseDead(base.identifier().clone()));
        }
        Ok(base)
    }

    /// The store of both `self` and `other`, failing if they live apart.
    pub(crate) fn shared_base(&self, other: &MeshObject<E>) -> MeshResult<Arc<MeshBase<E>>> {
        let base = self.live_base()?;
        if !Arc::ptr_eq(&base, &other.live_base()?) {
            return Err(MeshError::DifferentMeshBase {
                object: self.identifier.clone(),
                other: other.identifier.clone(),
            });
        }
        Ok(base)
    }

    /// Common preamble of every mutation.
    pub(crate) fn begin_update(
        &self,
        operation: Operation,
        other: Option<&MeshObjectIdentifier>,
        mode: ApplyMode,
    ) -> MeshResult<(Arc<MeshBase<E>>, Arc<Transaction>)> {
        let base = self.live_base()?;
        let tx = base.check_transaction()?;
        if mode == ApplyMode::Master {
            base.check_permission(self, operation, other)?;
        }
        Ok((base, tx))
    }

    // -- entity types ------------------------------------------------------------

    /// The entity types this object is blessed with.
    pub fn types(&self) -> MeshResult<Vec<EntityType>> {
        self.live_base()?;
        Ok(self.state().types.clone())
    }

    /// Returns `true` if blessed with `entity_type` or one of its subtypes.
    pub fn is_blessed_by(&self, entity_type: &EntityType) -> bool {
        self.state().is_blessed_by(entity_type)
    }

    pub fn bless(&self, types: &[EntityType]) -> MeshResult<()> {
        self.bless_with(types, ApplyMode::Master).map(|_| ())
    }

    /// Bless with additional entity types.
    ///
    /// Blessing with a subtype of a type already blessed replaces that type.
    /// Mandatory properties of the new types are set to their defaults.
    pub fn bless_with(&self, types: &[EntityType], mode: ApplyMode) -> MeshResult<Outcome> {
        let (_base, tx) = self.begin_update(Operation::Bless, None, mode)?;
        if let Some(t) = types.iter().find(|t| t.is_abstract()) {
            return Err(MeshError::IsAbstract(t.identifier().clone()));
        }

        let mut state = self.state_mut();
        let mut added: Vec<EntityType> = Vec::new();
        for t in types {
            if state.is_blessed_by(t) || added.contains(t) {
                match mode {
                    ApplyMode::Master => {
                        return Err(MeshError::EntityBlessedAlready {
                            object: self.identifier.clone(),
                            entity_type: t.identifier().clone(),
                        })
                    }
                    ApplyMode::Ripple => continue,
                }
            }
            added.push(t.clone());
        }
        // A subtype in the same batch subsumes its supertypes.
        let added: Vec<EntityType> = added
            .iter()
            .filter(|t| !added.iter().any(|o| o != *t && o.is_subtype_of(t)))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(Outcome::AlreadyInState);
        }

        let replaced: Vec<EntityType> = state
            .types
            .iter()
            .filter(|old| added.iter().any(|t| t.is_subtype_of(old)))
            .cloned()
            .collect();
        if !replaced.is_empty() {
            state.types.retain(|old| !replaced.contains(old));
            tx.record(Change::TypesRemoved {
                identifier: self.identifier.clone(),
                types: replaced,
                removed_properties: Vec::new(),
            });
        }

        let initialized_properties = state.initialize_properties(&added);
        state.types.extend(added.iter().cloned());
        state.updated = now_millis();
        debug!(object = %self.identifier, types = ?added, "blessed");
        tx.record(Change::TypesAdded {
            identifier: self.identifier.clone(),
            types: added,
            initialized_properties,
        });
        Ok(Outcome::Applied)
    }

    pub fn unbless(&self, types: &[EntityType]) -> MeshResult<()> {
        self.unbless_with(types, ApplyMode::Master).map(|_| ())
    }

    /// Remove entity types. Property values no remaining type declares are
    /// removed with them.
    pub fn unbless_with(&self, types: &[EntityType], mode: ApplyMode) -> MeshResult<Outcome> {
        let (_base, tx) = self.begin_update(Operation::Unbless, None, mode)?;

        let mut state = self.state_mut();
        let mut removing: Vec<EntityType> = Vec::new();
        for t in types {
            if !state.types.contains(t) {
                match mode {
                    ApplyMode::Master => {
                        return Err(MeshError::EntityNotBlessed {
                            object: self.identifier.clone(),
                            entity_type: t.identifier().clone(),
                        })
                    }
                    ApplyMode::Ripple => continue,
                }
            }
            if !removing.contains(t) {
                removing.push(t.clone());
            }
        }
        if removing.is_empty() {
            return Ok(Outcome::AlreadyInState);
        }

        let remaining: Vec<EntityType> = state
            .types
            .iter()
            .filter(|t| !removing.contains(t))
            .cloned()
            .collect();
        for slot in &state.neighbors {
            for role in slot.roles() {
                let Some(required) = role.required_entity_type() else {
                    continue;
                };
                let lost = removing.iter().any(|t| t.is_subtype_of(required))
                    && !remaining.iter().any(|t| t.is_subtype_of(required));
                if !lost {
                    continue;
                }
                match mode {
                    ApplyMode::Master => {
                        return Err(MeshError::RoleTypeRequiresEntityType {
                            object: self.identifier.clone(),
                            entity_type: required.identifier().clone(),
                            role: role.identifier(),
                        })
                    }
                    ApplyMode::Ripple => warn!(
                        object = %self.identifier,
                        role = %role.identifier(),
                        "unblessing a type still required by a role"
                    ),
                }
            }
        }

        state.types = remaining;
        let undeclared: Vec<PropertyType> = state
            .properties
            .keys()
            .filter(|pt| !state.declares(pt))
            .cloned()
            .collect();
        let removed_properties = undeclared
            .into_iter()
            .filter_map(|pt| state.properties.remove(&pt).map(|v| (pt, v)))
            .collect();
        state.updated = now_millis();
        debug!(object = %self.identifier, types = ?removing, "unblessed");
        tx.record(Change::TypesRemoved {
            identifier: self.identifier.clone(),
            types: removing,
            removed_properties,
        });
        Ok(Outcome::Applied)
    }

    // -- properties ----------------------------------------------------------------

    /// All property types carried by the blessed entity types.
    pub fn property_types(&self) -> MeshResult<Vec<PropertyType>> {
        self.live_base()?;
        let state = self.state();
        let mut result: Vec<PropertyType> = Vec::new();
        for t in &state.types {
            for pt in t.property_types() {
                if !result.contains(&pt) {
                    result.push(pt);
                }
            }
        }
        Ok(result)
    }

    /// The value of a property, `None` if it has no value.
    pub fn property_value(&self, property_type: &PropertyType) -> MeshResult<Option<PropertyValue>> {
        self.live_base()?;
        let state = self.state();
        if !state.declares(property_type) {
            return Err(MeshError::IllegalPropertyType {
                object: self.identifier.clone(),
                property_type: property_type.identifier().clone(),
            });
        }
        let value = state.properties.get(property_type).cloned();
        drop(state);
        self.touch_read();
        Ok(value)
    }

    /// All properties that currently have a value.
    pub fn property_values(&self) -> MeshResult<Vec<(PropertyType, PropertyValue)>> {
        self.live_base()?;
        let values = self
            .state()
            .properties
            .iter()
            .map(|(pt, v)| (pt.clone(), v.clone()))
            .collect();
        self.touch_read();
        Ok(values)
    }

    /// Set one property, returning its previous value.
    pub fn set_property_value(
        &self,
        property_type: &PropertyType,
        value: Option<PropertyValue>,
    ) -> MeshResult<Option<PropertyValue>> {
        let old = self.state().properties.get(property_type).cloned();
        self.set_property_values_with(&[(property_type.clone(), value)], ApplyMode::Master)?;
        Ok(old)
    }

    pub fn set_property_values(&self, values: &[(PropertyType, Option<PropertyValue>)]) -> MeshResult<()> {
        self.set_property_values_with(values, ApplyMode::Master)
            .map(|_| ())
    }

    /// Set several properties at once. A master call validates every value
    /// before changing any; a ripple call skips the invalid ones.
    pub fn set_property_values_with(
        &self,
        values: &[(PropertyType, Option<PropertyValue>)],
        mode: ApplyMode,
    ) -> MeshResult<Outcome> {
        let (_base, tx) = self.begin_update(Operation::SetProperty, None, mode)?;

        let mut state = self.state_mut();
        let mut valid = Vec::with_capacity(values.len());
        for (pt, value) in values {
            match self.check_property(&state, pt, value.as_ref()) {
                Ok(()) => valid.push((pt, value)),
                Err(e) if mode == ApplyMode::Master => return Err(e),
                Err(e) => warn!(object = %self.identifier, error = %e, "skipping property"),
            }
        }

        let mut changes = Vec::new();
        for (pt, value) in valid {
            let old = state.properties.get(pt).cloned();
            if old.as_ref() == value.as_ref() {
                continue;
            }
            match value {
                Some(v) => state.properties.insert(pt.clone(), v.clone()),
                None => state.properties.remove(pt),
            };
            changes.push(Change::PropertyChanged {
                identifier: self.identifier.clone(),
                property_type: pt.clone(),
                old,
                new: value.clone(),
            });
        }
        if changes.is_empty() {
            return Ok(Outcome::AlreadyInState);
        }
        state.updated = now_millis();
        for change in changes {
            tx.record(change);
        }
        Ok(Outcome::Applied)
    }

    fn check_property(
        &self,
        state: &ObjectState,
        property_type: &PropertyType,
        value: Option<&PropertyValue>,
    ) -> MeshResult<()> {
        if !state.declares(property_type) {
            return Err(MeshError::IllegalPropertyType {
                object: self.identifier.clone(),
                property_type: property_type.identifier().clone(),
            });
        }
        let reason = match value {
            Some(v) if v.data_type() != property_type.data_type() => format!(
                "expected {:?}, got {:?}",
                property_type.data_type(),
                v.data_type()
            ),
            None if !property_type.is_optional() => "mandatory property cannot be cleared".into(),
            _ => return Ok(()),
        };
        Err(MeshError::IllegalPropertyValue {
            object: self.identifier.clone(),
            property_type: property_type.identifier().clone(),
            reason,
        })
    }

    // -- deletion ------------------------------------------------------------------

    pub fn delete(&self) -> MeshResult<()> {
        self.delete_with(ApplyMode::Master).map(|_| ())
    }

    /// Delete this object: leave its equivalence chain, unrelate from every
    /// neighbor, then sever it from the store.
    pub fn delete_with(&self, mode: ApplyMode) -> MeshResult<Outcome> {
        if self.identifier.is_home() {
            return Err(MeshError::HomeObjectUndeletable(self.identifier.clone()));
        }
        let (base, tx) = self.begin_update(Operation::Delete, None, mode)?;

        let chain = self.equivalent_identifiers();
        if let Some(representative) = chain.iter().find(|id| **id != self.identifier) {
            match self.remove_as_equivalent_with(representative, mode) {
                Ok(_) => {}
                Err(MeshError::NotEquivalent { .. }) => {
                    debug!(object = %self.identifier, "equivalence chain changed during delete")
                }
                Err(e) => return Err(e),
            }
        }

        for neighbor in self.neighbor_identifiers() {
            let Some(other) = base.find_by_identifier(&neighbor) else {
                warn!(object = %self.identifier, %neighbor, "dropping unresolved neighbor");
                self.drop_unresolved_neighbor(&tx, &neighbor);
                continue;
            };
            match self.unrelate_with(&other, mode) {
                Ok(_) | Err(MeshError::NotRelated { .. }) => {}
                Err(e) if e.kind() == ErrorKind::Permission => {
                    warn!(object = %self.identifier, %neighbor, error = %e, "cannot unrelate during delete")
                }
                Err(e) => return Err(e),
            }
        }

        let snapshot = self.snapshot();
        base.forget(&self.identifier);
        self.sever();
        debug!(object = %self.identifier, "deleted");
        tx.record(Change::Deleted {
            identifier: self.identifier.clone(),
            snapshot: Box::new(snapshot),
        });
        Ok(Outcome::Applied)
    }

    fn drop_unresolved_neighbor(&self, tx: &Transaction, neighbor: &MeshObjectIdentifier) {
        let mut state = self.state_mut();
        if let Some(slot) = state.remove_slot(neighbor) {
            state.updated = now_millis();
            tx.record(Change::NeighborRemoved {
                identifier: self.identifier.clone(),
                neighbor: neighbor.clone(),
                roles: slot.roles().to_vec(),
            });
        }
    }

    // -- snapshots -------------------------------------------------------------------

    pub fn snapshot(&self) -> MeshObjectSnapshot {
        let state = self.state();
        MeshObjectSnapshot {
            identifier: self.identifier.clone(),
            timestamps: Timestamps {
                created: state.created,
                updated: state.updated,
                read: self.time_read.load(Ordering::Acquire),
                expires: state.expires,
            },
            types: state.types.clone(),
            properties: state
                .properties
                .iter()
                .map(|(pt, v)| (pt.clone(), v.clone()))
                .collect(),
            neighbors: state
                .neighbors
                .iter()
                .map(|s| (s.identifier.clone(), s.roles().to_vec()))
                .collect(),
            equivalents: state.equivalents.clone(),
            replication: self.extension.replication(),
        }
    }

    pub fn externalize(&self) -> ExternalizedMeshObject {
        self.snapshot().externalize()
    }

    /// Undo one recorded change to this object without recording anything.
    pub(crate) fn revert(&self, change: &Change) {
        let mut state = self.state_mut();
        match change {
            Change::PropertyChanged {
                property_type, old, ..
            } => {
                match old {
                    Some(v) => state.properties.insert(property_type.clone(), v.clone()),
                    None => state.properties.remove(property_type),
                };
            }
            Change::TypesAdded {
                types,
                initialized_properties,
                ..
            } => {
                state.types.retain(|t| !types.contains(t));
                for pt in initialized_properties {
                    state.properties.remove(pt);
                }
            }
            Change::TypesRemoved {
                types,
                removed_properties,
                ..
            } => {
                state.types.extend(types.iter().cloned());
                state
                    .properties
                    .extend(removed_properties.iter().cloned());
            }
            Change::NeighborAdded { neighbor, .. } => {
                state.remove_slot(neighbor);
            }
            Change::NeighborRemoved {
                neighbor, roles, ..
            } => {
                state.neighbors.push(NeighborSlot::new(neighbor.clone(), roles));
            }
            Change::RoleTypesAdded {
                neighbor, roles, ..
            } => match state.slot_mut(neighbor) {
                Some(slot) => slot.remove_roles(roles),
                None => warn!(object = %self.identifier, %neighbor, "no slot to revert roles in"),
            },
            Change::RoleTypesRemoved {
                neighbor, roles, ..
            } => match state.slot_mut(neighbor) {
                Some(slot) => slot.add_roles(roles),
                None => warn!(object = %self.identifier, %neighbor, "no slot to revert roles in"),
            },
            Change::EquivalentsChanged { old, .. } => {
                state.equivalents = old.clone();
            }
            Change::Created { .. }
            | Change::Deleted { .. }
            | Change::LockGained { .. }
            | Change::LockLost { .. } => {}
        }
    }
}

impl<E: ObjectExtension> fmt::Debug for MeshObject<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshObject")
            .field("identifier", &self.identifier)
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MeshBase;
    use mesh_types::{DataType, MeshBaseIdentifier};

    fn base() -> Arc<MeshBase> {
        MeshBase::builder(MeshBaseIdentifier::parse("test").unwrap()).build()
    }

    fn person() -> (EntityType, PropertyType, PropertyType) {
        let name = PropertyType::optional("Person/Name", DataType::String);
        let age = PropertyType::mandatory("Person/Age", PropertyValue::Integer(0));
        let t = EntityType::builder("Person")
            .property(name.clone())
            .property(age.clone())
            .build();
        (t, name, age)
    }

    #[test]
    fn mutation_outside_transaction_fails() {
        let mb = base();
        let (person, _, _) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        tx.commit().unwrap();

        let err = obj.bless(&[person]).unwrap_err();
        assert!(matches!(err, MeshError::NotWithinTransactionBoundaries));
    }

    #[test]
    fn bless_initializes_mandatory_properties() {
        let mb = base();
        let (person, name, age) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.bless(&[person.clone()]).unwrap();

        assert_eq!(obj.property_value(&age).unwrap(), Some(PropertyValue::Integer(0)));
        assert_eq!(obj.property_value(&name).unwrap(), None);
        let err = obj.bless(&[person]).unwrap_err();
        assert!(matches!(err, MeshError::EntityBlessedAlready { .. }));
        tx.commit().unwrap();
    }

    #[test]
    fn subtype_replaces_supertype() {
        let mb = base();
        let (person, _, _) = person();
        let employee = EntityType::builder("Employee").supertype(&person).build();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.bless(&[person.clone()]).unwrap();
        obj.bless(&[employee.clone()]).unwrap();

        assert_eq!(obj.types().unwrap(), vec![employee]);
        assert!(obj.is_blessed_by(&person));
        tx.commit().unwrap();
    }

    #[test]
    fn batch_bless_keeps_only_the_subtype() {
        let mb = base();
        let (person, _, _) = person();
        let employee = EntityType::builder("Employee").supertype(&person).build();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.bless(&[employee.clone(), person.clone()]).unwrap();

        assert_eq!(obj.types().unwrap(), vec![employee.clone()]);
        assert!(matches!(
            obj.unbless(&[person]),
            Err(MeshError::EntityNotBlessed { .. })
        ));
        obj.unbless(&[employee]).unwrap();
        assert!(obj.types().unwrap().is_empty());
        tx.commit().unwrap();
    }

    #[test]
    fn abstract_types_cannot_be_blessed() {
        let mb = base();
        let thing = EntityType::builder("Thing").abstract_type().build();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        assert!(matches!(obj.bless(&[thing]), Err(MeshError::IsAbstract(_))));
        tx.rollback().unwrap();
    }

    #[test]
    fn property_values_are_type_checked() {
        let mb = base();
        let (person, name, age) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();

        let err = obj.set_property_value(&name, Some("x".into())).unwrap_err();
        assert!(matches!(err, MeshError::IllegalPropertyType { .. }));

        obj.bless(&[person]).unwrap();
        let err = obj.set_property_value(&name, Some(PropertyValue::Integer(3))).unwrap_err();
        assert!(matches!(err, MeshError::IllegalPropertyValue { .. }));
        let err = obj.set_property_value(&age, None).unwrap_err();
        assert!(matches!(err, MeshError::IllegalPropertyValue { .. }));

        let old = obj.set_property_value(&name, Some("Alice".into())).unwrap();
        assert_eq!(old, None);
        assert_eq!(obj.property_value(&name).unwrap(), Some("Alice".into()));
        tx.commit().unwrap();
    }

    #[test]
    fn master_set_validates_everything_first() {
        let mb = base();
        let (person, name, age) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.bless(&[person]).unwrap();

        let err = obj
            .set_property_values(&[(name.clone(), Some("Bob".into())), (age.clone(), None)])
            .unwrap_err();
        assert!(matches!(err, MeshError::IllegalPropertyValue { .. }));
        assert_eq!(obj.property_value(&name).unwrap(), None);

        let outcome = obj
            .set_property_values_with(
                &[(name.clone(), Some("Bob".into())), (age, None)],
                ApplyMode::Ripple,
            )
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(obj.property_value(&name).unwrap(), Some("Bob".into()));
        tx.commit().unwrap();
    }

    #[test]
    fn unbless_removes_undeclared_properties() {
        let mb = base();
        let (person, name, _) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.bless(&[person.clone()]).unwrap();
        obj.set_property_value(&name, Some("Carol".into())).unwrap();
        obj.unbless(&[person.clone()]).unwrap();

        assert!(obj.property_values().unwrap().is_empty());
        assert!(matches!(
            obj.unbless(&[person]),
            Err(MeshError::EntityNotBlessed { .. })
        ));
        tx.commit().unwrap();
    }

    #[test]
    fn deleted_object_is_a_tombstone() {
        let mb = base();
        let (person, _, _) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        let id = obj.identifier().clone();
        obj.delete().unwrap();

        assert!(obj.is_dead());
        assert_eq!(obj.identifier(), &id);
        assert!(matches!(obj.bless(&[person]), Err(MeshError::ObjectDead(_))));
        assert!(mb.find_by_identifier(&id).is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn home_object_cannot_be_deleted() {
        let mb = base();
        let tx = mb.create_transaction_now().unwrap();
        let err = mb.home_object().delete().unwrap_err();
        assert!(matches!(err, MeshError::HomeObjectUndeletable(_)));
        tx.commit().unwrap();
    }

    #[test]
    fn reading_updates_time_read() {
        let mb = base();
        let (person, name, _) = person();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb
            .lifecycle()
            .create_mesh_object_with(None, &[person], Some(Timestamps::at(10)))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(obj.time_read(), 10);
        obj.property_value(&name).unwrap();
        assert!(obj.time_read() > 10);
        assert_eq!(obj.time_created(), 10);
    }

    #[test]
    fn neighbor_slot_never_holds_empty_role_set() {
        let mut slot = NeighborSlot::new(MeshObjectIdentifier::new("n").unwrap(), &[]);
        assert!(slot.roles.is_none());
        let rel = mesh_types::RelationshipType::new("R", None, None);
        slot.add_roles(&[rel.source()]);
        assert_eq!(slot.roles().len(), 1);
        slot.remove_roles(&[rel.source()]);
        assert!(slot.roles.is_none());
    }
}
