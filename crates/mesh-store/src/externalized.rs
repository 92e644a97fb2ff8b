//! Flat records of a MeshObject.
//!
//! [`ExternalizedMeshObject`] is the boundary format: type identifiers only,
//! resolvable through a [`ModelBase`](mesh_types::ModelBase), serde-derived
//! and with an opaque binary encoding. [`MeshObjectSnapshot`] holds the same
//! content as live type tokens and is what a deletion leaves behind so a
//! rollback can bring the object back.

use mesh_types::{
    EntityType, MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier, PropertyType,
    PropertyValue, RoleType, Timestamps,
};
use serde::{Deserialize, Serialize};

use crate::equivalence::EquivalencePointers;
use crate::error::{MeshError, MeshResult};

/// Replica bookkeeping of a networked object.
///
/// Proxy indices refer into `proxies`; `None` means this replica itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalizedReplication {
    pub proxies: Vec<MeshBaseIdentifier>,
    pub home_proxy: Option<usize>,
    pub lock_proxy: Option<usize>,
    pub will_give_up_lock: bool,
    pub lock_epoch: u64,
}

/// A MeshObject in its externalized form.
///
/// `property_types`/`property_values` and `neighbors`/`role_types` are
/// parallel arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedMeshObject {
    pub identifier: MeshObjectIdentifier,
    pub entity_types: Vec<MeshTypeIdentifier>,
    pub timestamps: Timestamps,
    pub property_types: Vec<MeshTypeIdentifier>,
    pub property_values: Vec<PropertyValue>,
    pub neighbors: Vec<MeshObjectIdentifier>,
    pub role_types: Vec<Vec<MeshTypeIdentifier>>,
    pub equivalents: EquivalencePointers,
    pub replication: Option<ExternalizedReplication>,
}

impl ExternalizedMeshObject {
    /// A record for an object with nothing but an identifier.
    pub fn new(identifier: MeshObjectIdentifier) -> Self {
        Self {
            identifier,
            entity_types: Vec::new(),
            timestamps: Timestamps::now(),
            property_types: Vec::new(),
            property_values: Vec::new(),
            neighbors: Vec::new(),
            role_types: Vec::new(),
            equivalents: EquivalencePointers::default(),
            replication: None,
        }
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        let ext: Self =
            bincode::deserialize(bytes).map_err(|e| MeshError::Serialization(e.to_string()))?;
        ext.validate()?;
        Ok(ext)
    }

    /// Check that the parallel arrays line up.
    pub fn validate(&self) -> MeshResult<()> {
        if self.property_types.len() != self.property_values.len() {
            return Err(MeshError::Serialization(format!(
                "{}: {} property types but {} values",
                self.identifier,
                self.property_types.len(),
                self.property_values.len()
            )));
        }
        if self.neighbors.len() != self.role_types.len() {
            return Err(MeshError::Serialization(format!(
                "{}: {} neighbors but {} role sets",
                self.identifier,
                self.neighbors.len(),
                self.role_types.len()
            )));
        }
        Ok(())
    }
}

/// The full state of a MeshObject at one instant, as type tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshObjectSnapshot {
    pub identifier: MeshObjectIdentifier,
    pub timestamps: Timestamps,
    pub types: Vec<EntityType>,
    pub properties: Vec<(PropertyType, PropertyValue)>,
    pub neighbors: Vec<(MeshObjectIdentifier, Vec<RoleType>)>,
    pub equivalents: EquivalencePointers,
    pub replication: Option<ExternalizedReplication>,
}

impl MeshObjectSnapshot {
    pub fn empty(identifier: MeshObjectIdentifier) -> Self {
        Self {
            identifier,
            timestamps: Timestamps::now(),
            types: Vec::new(),
            properties: Vec::new(),
            neighbors: Vec::new(),
            equivalents: EquivalencePointers::default(),
            replication: None,
        }
    }

    pub fn externalize(&self) -> ExternalizedMeshObject {
        let (property_types, property_values) = self
            .properties
            .iter()
            .map(|(pt, v)| (pt.identifier().clone(), v.clone()))
            .unzip();
        let (neighbors, role_types) = self
            .neighbors
            .iter()
            .map(|(id, roles)| (id.clone(), roles.iter().map(RoleType::identifier).collect()))
            .unzip();
        ExternalizedMeshObject {
            identifier: self.identifier.clone(),
            entity_types: self.types.iter().map(|t| t.identifier().clone()).collect(),
            timestamps: self.timestamps,
            property_types,
            property_values,
            neighbors,
            role_types,
            equivalents: self.equivalents.clone(),
            replication: self.replication.clone(),
        }
    }
}
