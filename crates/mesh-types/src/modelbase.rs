use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::TypeError;
use crate::model::{EntityType, MeshTypeIdentifier, PropertyType, RelationshipType, RoleType};

/// Resolves type identifiers back into type tokens.
///
/// Needed wherever MeshObjects are reconstructed from their externalized
/// form, which only carries identifiers.
pub trait ModelBase: Send + Sync {
    fn find_entity_type(&self, id: &MeshTypeIdentifier) -> Option<EntityType>;

    fn find_role_type(&self, id: &MeshTypeIdentifier) -> Option<RoleType>;

    fn find_property_type(&self, id: &MeshTypeIdentifier) -> Option<PropertyType>;
}

/// In-memory, HashMap-based [`ModelBase`].
#[derive(Default)]
pub struct InMemoryModelBase {
    inner: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    entity_types: HashMap<MeshTypeIdentifier, EntityType>,
    role_types: HashMap<MeshTypeIdentifier, RoleType>,
    property_types: HashMap<MeshTypeIdentifier, PropertyType>,
}

impl InMemoryModelBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type together with the property types it declares
    /// directly.
    pub fn register_entity_type(&self, entity_type: &EntityType) -> Result<(), TypeError> {
        let mut registry = self.inner.write().expect("model lock poisoned");
        if registry.entity_types.contains_key(entity_type.identifier()) {
            return Err(TypeError::DuplicateType(entity_type.identifier().to_string()));
        }
        for pt in entity_type.local_property_types() {
            if registry.property_types.contains_key(pt.identifier()) {
                return Err(TypeError::DuplicateType(pt.identifier().to_string()));
            }
        }
        for pt in entity_type.local_property_types() {
            registry
                .property_types
                .insert(pt.identifier().clone(), pt.clone());
        }
        registry
            .entity_types
            .insert(entity_type.identifier().clone(), entity_type.clone());
        Ok(())
    }

    /// Register both role types of a relationship type.
    pub fn register_relationship_type(
        &self,
        relationship_type: &RelationshipType,
    ) -> Result<(), TypeError> {
        let mut registry = self.inner.write().expect("model lock poisoned");
        let source = relationship_type.source();
        let destination = relationship_type.destination();
        if registry.role_types.contains_key(&source.identifier()) {
            return Err(TypeError::DuplicateType(
                relationship_type.identifier().to_string(),
            ));
        }
        registry.role_types.insert(source.identifier(), source);
        registry
            .role_types
            .insert(destination.identifier(), destination);
        Ok(())
    }
}

impl ModelBase for InMemoryModelBase {
    fn find_entity_type(&self, id: &MeshTypeIdentifier) -> Option<EntityType> {
        let registry = self.inner.read().expect("model lock poisoned");
        registry.entity_types.get(id).cloned()
    }

    fn find_role_type(&self, id: &MeshTypeIdentifier) -> Option<RoleType> {
        let registry = self.inner.read().expect("model lock poisoned");
        registry.role_types.get(id).cloned()
    }

    fn find_property_type(&self, id: &MeshTypeIdentifier) -> Option<PropertyType> {
        let registry = self.inner.read().expect("model lock poisoned");
        registry.property_types.get(id).cloned()
    }
}

impl std::fmt::Debug for InMemoryModelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.read().expect("model lock poisoned");
        f.debug_struct("InMemoryModelBase")
            .field("entity_types", &registry.entity_types.len())
            .field("role_types", &registry.role_types.len())
            .field("property_types", &registry.property_types.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn register_and_find() {
        let model = InMemoryModelBase::new();
        let name = PropertyType::optional("Person_Name", DataType::String);
        let person = EntityType::builder("Person").property(name.clone()).build();
        let knows = RelationshipType::new("Knows", Some(&person), Some(&person));
        model.register_entity_type(&person).unwrap();
        model.register_relationship_type(&knows).unwrap();

        assert_eq!(model.find_entity_type(&"Person".into()), Some(person));
        assert_eq!(model.find_property_type(&"Person_Name".into()), Some(name));
        assert_eq!(model.find_role_type(&"Knows-S".into()), Some(knows.source()));
        assert_eq!(model.find_role_type(&"Knows-D".into()), Some(knows.destination()));
        assert!(model.find_entity_type(&"Nope".into()).is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let model = InMemoryModelBase::new();
        let person = EntityType::new("Person");
        model.register_entity_type(&person).unwrap();
        assert_eq!(
            model.register_entity_type(&person),
            Err(TypeError::DuplicateType("Person".into()))
        );
    }
}
