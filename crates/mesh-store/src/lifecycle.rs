//! Creation, deletion and loading of MeshObjects.

use std::sync::Arc;

use mesh_types::{EntityType, MeshObjectIdentifier, Timestamps};
use tracing::debug;

use crate::access::Operation;
use crate::change::Change;
use crate::error::{MeshError, MeshResult};
use crate::extension::ObjectExtension;
use crate::externalized::{ExternalizedMeshObject, MeshObjectSnapshot};
use crate::meshbase::MeshBase;
use crate::object::{ApplyMode, MeshObject};

/// Creates and deletes the MeshObjects of one store. Obtained from
/// [`MeshBase::lifecycle`].
pub struct LifecycleManager<'a, E: ObjectExtension> {
    base: &'a MeshBase<E>,
}

impl<'a, E: ObjectExtension> LifecycleManager<'a, E> {
    pub(crate) fn new(base: &'a MeshBase<E>) -> Self {
        Self { base }
    }

    /// A fresh identifier, scoped to the store if its objects are replicated.
    pub fn generate_identifier(&self) -> MeshObjectIdentifier {
        let scope = E::SCOPED_IDENTIFIERS.then(|| self.base.identifier().clone());
        MeshObjectIdentifier::generate(scope)
    }

    pub fn create_mesh_object(&self) -> MeshResult<Arc<MeshObject<E>>> {
        self.create_mesh_object_with(None, &[], None)
    }

    /// Create a MeshObject. Without an identifier one is generated; without
    /// timestamps the object is created now and never expires.
    pub fn create_mesh_object_with(
        &self,
        identifier: Option<MeshObjectIdentifier>,
        types: &[EntityType],
        timestamps: Option<Timestamps>,
    ) -> MeshResult<Arc<MeshObject<E>>> {
        self.create_mesh_object_in_mode(identifier, types, timestamps, ApplyMode::Master)
    }

    /// Like [`create_mesh_object_with`](Self::create_mesh_object_with). In
    /// [`ApplyMode::Ripple`] the creation was confirmed elsewhere and the
    /// access manager is not asked.
    pub fn create_mesh_object_in_mode(
        &self,
        identifier: Option<MeshObjectIdentifier>,
        types: &[EntityType],
        timestamps: Option<Timestamps>,
        mode: ApplyMode,
    ) -> MeshResult<Arc<MeshObject<E>>> {
        self.base.ensure_alive()?;
        let tx = self.base.check_transaction()?;
        let identifier = identifier.unwrap_or_else(|| self.generate_identifier());
        if mode == ApplyMode::Master
            && !self.base.is_permitted(&identifier, Operation::Create, None)
        {
            return Err(MeshError::NotPermitted {
                object: identifier,
                operation: Operation::Create,
            });
        }
        if let Some(t) = types.iter().find(|t| t.is_abstract()) {
            return Err(MeshError::IsAbstract(t.identifier().clone()));
        }

        let object = Arc::new(MeshObject::new(
            identifier.clone(),
            self.base.me(),
            timestamps.unwrap_or_else(Timestamps::now),
            types,
            E::create(self.base.extension()),
        ));
        self.base.insert(Arc::clone(&object))?;
        debug!(store = %self.base.identifier(), object = %identifier, "created");
        tx.record(Change::Created {
            identifier,
            types: types.to_vec(),
        });
        Ok(object)
    }

    pub fn delete_mesh_object(&self, object: &MeshObject<E>) -> MeshResult<()> {
        object.delete()
    }

    /// Delete several objects, stopping at the first failure.
    pub fn delete_mesh_objects(&self, objects: &[Arc<MeshObject<E>>]) -> MeshResult<()> {
        objects.iter().try_for_each(|o| o.delete())
    }

    /// Instantiate an object from its externalized form, resolving its types
    /// through the store's model.
    ///
    /// Neighbors and equivalents are taken as they are; the objects they
    /// refer to may be loaded later.
    pub fn load_externalized_mesh_object(
        &self,
        ext: &ExternalizedMeshObject,
    ) -> MeshResult<Arc<MeshObject<E>>> {
        ext.validate()?;
        self.base.ensure_alive()?;
        let tx = self.base.check_transaction()?;
        let model = self.base.model();

        let types = ext
            .entity_types
            .iter()
            .map(|id| {
                model
                    .find_entity_type(id)
                    .ok_or_else(|| MeshError::UnknownType(id.clone()))
            })
            .collect::<MeshResult<Vec<_>>>()?;
        let properties = ext
            .property_types
            .iter()
            .zip(&ext.property_values)
            .map(|(id, value)| {
                model
                    .find_property_type(id)
                    .map(|pt| (pt, value.clone()))
                    .ok_or_else(|| MeshError::UnknownType(id.clone()))
            })
            .collect::<MeshResult<Vec<_>>>()?;
        let neighbors = ext
            .neighbors
            .iter()
            .zip(&ext.role_types)
            .map(|(neighbor, role_ids)| {
                let roles = role_ids
                    .iter()
                    .map(|id| {
                        model
                            .find_role_type(id)
                            .ok_or_else(|| MeshError::UnknownType(id.clone()))
                    })
                    .collect::<MeshResult<Vec<_>>>()?;
                Ok((neighbor.clone(), roles))
            })
            .collect::<MeshResult<Vec<_>>>()?;

        let snapshot = MeshObjectSnapshot {
            identifier: ext.identifier.clone(),
            timestamps: ext.timestamps,
            types: types.clone(),
            properties,
            neighbors,
            equivalents: ext.equivalents.clone(),
            replication: ext.replication.clone(),
        };
        let object = Arc::new(MeshObject::restored(
            &snapshot,
            self.base.me(),
            E::restore(self.base.extension(), ext.replication.as_ref()),
        ));
        self.base.insert(Arc::clone(&object))?;
        debug!(store = %self.base.identifier(), object = %ext.identifier, "loaded");
        tx.record(Change::Created {
            identifier: ext.identifier.clone(),
            types,
        });
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessRequest;
    use mesh_types::{
        DataType, InMemoryModelBase, MeshBaseIdentifier, PropertyType, PropertyValue,
        RelationshipType,
    };

    fn base_with_model() -> (Arc<MeshBase>, EntityType, PropertyType, RelationshipType) {
        let name = PropertyType::optional("Name", DataType::String);
        let person = EntityType::builder("Person").property(name.clone()).build();
        let knows = RelationshipType::new("Knows", Some(&person), Some(&person));
        let model = InMemoryModelBase::new();
        model.register_entity_type(&person).unwrap();
        model.register_relationship_type(&knows).unwrap();
        let mb = MeshBase::builder(MeshBaseIdentifier::parse("lc").unwrap())
            .model(Arc::new(model))
            .build();
        (mb, person, name, knows)
    }

    #[test]
    fn explicit_identifier_must_be_unique() {
        let (mb, ..) = base_with_model();
        let id = MeshObjectIdentifier::new("fixed").unwrap();
        let tx = mb.create_transaction_now().unwrap();
        mb.lifecycle()
            .create_mesh_object_with(Some(id.clone()), &[], None)
            .unwrap();
        let err = mb
            .lifecycle()
            .create_mesh_object_with(Some(id), &[], None)
            .unwrap_err();
        assert!(matches!(err, MeshError::IdentifierNotUnique(_)));
        tx.commit().unwrap();
    }

    #[test]
    fn ripple_creation_bypasses_access_manager() {
        let mb = MeshBase::builder(MeshBaseIdentifier::parse("deny").unwrap())
            .access_manager(Arc::new(|_: &AccessRequest<'_>| false))
            .build();
        let id = MeshObjectIdentifier::new("confirmed").unwrap();
        let tx = mb.create_transaction_now().unwrap();
        let err = mb
            .lifecycle()
            .create_mesh_object_with(Some(id.clone()), &[], None)
            .unwrap_err();
        assert!(matches!(err, MeshError::NotPermitted { operation: Operation::Create, .. }));

        mb.lifecycle()
            .create_mesh_object_in_mode(Some(id.clone()), &[], None, ApplyMode::Ripple)
            .unwrap();
        assert!(mb.find_by_identifier(&id).is_some());
        let err = mb
            .lifecycle()
            .create_mesh_object_in_mode(Some(id), &[], None, ApplyMode::Ripple)
            .unwrap_err();
        assert!(matches!(err, MeshError::IdentifierNotUnique(_)));
        tx.commit().unwrap();
    }

    #[test]
    fn local_stores_generate_unscoped_identifiers() {
        let (mb, ..) = base_with_model();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        assert!(obj.identifier().scope().is_none());
        assert!(!obj.identifier().is_home());
        tx.commit().unwrap();
    }

    #[test]
    fn create_requires_transaction() {
        let (mb, ..) = base_with_model();
        assert!(matches!(
            mb.lifecycle().create_mesh_object(),
            Err(MeshError::NotWithinTransactionBoundaries)
        ));
    }

    #[test]
    fn externalize_and_load_into_another_store() {
        let (source, person, name, knows) = base_with_model();
        let tx = source.create_transaction_now().unwrap();
        let a = source
            .lifecycle()
            .create_mesh_object_with(None, &[person.clone()], None)
            .unwrap();
        let b = source
            .lifecycle()
            .create_mesh_object_with(None, &[person.clone()], None)
            .unwrap();
        a.set_property_value(&name, Some("Alice".into())).unwrap();
        a.relate(&b).unwrap();
        a.bless_relationship(&[knows.source()], &b).unwrap();
        tx.commit().unwrap();

        let bytes = a.externalize().to_bytes().unwrap();
        let ext = ExternalizedMeshObject::from_bytes(&bytes).unwrap();

        let (target, ..) = base_with_model();
        let tx = target.create_transaction_now().unwrap();
        let loaded = target.lifecycle().load_externalized_mesh_object(&ext).unwrap();
        tx.commit().unwrap();

        assert_eq!(loaded.identifier(), a.identifier());
        assert_eq!(loaded.types().unwrap(), vec![person]);
        assert_eq!(loaded.property_value(&name).unwrap(), Some(PropertyValue::from("Alice")));
        assert_eq!(loaded.roles_towards(b.identifier()), Some(vec![knows.source()]));
        assert_eq!(loaded.time_created(), a.time_created());
    }

    #[test]
    fn load_fails_on_unknown_types() {
        let (mb, ..) = base_with_model();
        let mut ext = ExternalizedMeshObject::new(MeshObjectIdentifier::new("x").unwrap());
        ext.entity_types.push("Nope".into());
        let tx = mb.create_transaction_now().unwrap();
        let err = mb.lifecycle().load_externalized_mesh_object(&ext).unwrap_err();
        assert!(matches!(err, MeshError::UnknownType(_)));
        tx.rollback().unwrap();
        assert!(mb.model().find_entity_type(&"Person".into()).is_some());
    }

    #[test]
    fn delete_many() {
        let (mb, ..) = base_with_model();
        let tx = mb.create_transaction_now().unwrap();
        let objects: Vec<_> = (0..3)
            .map(|_| mb.lifecycle().create_mesh_object().unwrap())
            .collect();
        mb.lifecycle().delete_mesh_objects(&objects).unwrap();
        tx.commit().unwrap();
        assert_eq!(mb.size(), 1);
        assert!(objects.iter().all(|o| o.is_dead()));
    }
}
