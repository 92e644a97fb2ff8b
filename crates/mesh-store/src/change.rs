use mesh_types::{EntityType, MeshObjectIdentifier, PropertyType, PropertyValue, RoleType};

use crate::equivalence::EquivalencePointers;
use crate::externalized::MeshObjectSnapshot;

/// A change to one MeshObject, captured by the transaction it happened in.
///
/// Every change concerns exactly one object. A relate emits one
/// `NeighborAdded` for each endpoint, and so on. This makes each change
/// individually reversible, which is how rollback works.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Created {
        identifier: MeshObjectIdentifier,
        types: Vec<EntityType>,
    },
    /// Carries the state the object had right before it was severed from its
    /// store, after its relationships and equivalences were unwound.
    Deleted {
        identifier: MeshObjectIdentifier,
        snapshot: Box<MeshObjectSnapshot>,
    },
    PropertyChanged {
        identifier: MeshObjectIdentifier,
        property_type: PropertyType,
        old: Option<PropertyValue>,
        new: Option<PropertyValue>,
    },
    TypesAdded {
        identifier: MeshObjectIdentifier,
        types: Vec<EntityType>,
        /// Properties that did not exist before and were set to their default.
        initialized_properties: Vec<PropertyType>,
    },
    TypesRemoved {
        identifier: MeshObjectIdentifier,
        types: Vec<EntityType>,
        /// Properties no remaining type declares, with their last values.
        removed_properties: Vec<(PropertyType, PropertyValue)>,
    },
    NeighborAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    NeighborRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleType>,
    },
    RoleTypesAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleType>,
    },
    RoleTypesRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleType>,
    },
    EquivalentsChanged {
        identifier: MeshObjectIdentifier,
        old: EquivalencePointers,
        new: EquivalencePointers,
    },
    LockGained {
        identifier: MeshObjectIdentifier,
    },
    LockLost {
        identifier: MeshObjectIdentifier,
    },
}

impl Change {
    /// The object this change happened to.
    pub fn identifier(&self) -> &MeshObjectIdentifier {
        match self {
            Self::Created { identifier, .. }
            | Self::Deleted { identifier, .. }
            | Self::PropertyChanged { identifier, .. }
            | Self::TypesAdded { identifier, .. }
            | Self::TypesRemoved { identifier, .. }
            | Self::NeighborAdded { identifier, .. }
            | Self::NeighborRemoved { identifier, .. }
            | Self::RoleTypesAdded { identifier, .. }
            | Self::RoleTypesRemoved { identifier, .. }
            | Self::EquivalentsChanged { identifier, .. }
            | Self::LockGained { identifier }
            | Self::LockLost { identifier } => identifier,
        }
    }

    /// Lock hand-offs belong to the replication layer and are not undone by
    /// a rollback.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Self::LockGained { .. } | Self::LockLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_of_every_variant() {
        let a = MeshObjectIdentifier::new("a").unwrap();
        let b = MeshObjectIdentifier::new("b").unwrap();
        let change = Change::NeighborAdded {
            identifier: a.clone(),
            neighbor: b,
        };
        assert_eq!(change.identifier(), &a);
        assert!(change.is_reversible());
        assert!(!Change::LockLost { identifier: a }.is_reversible());
    }
}
