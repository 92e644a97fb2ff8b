//! Foundation types for MeshBase.
//!
//! This crate provides the identifier, type-token, and value types shared by
//! every other MeshBase crate. The type system itself is deliberately thin:
//! entity, relationship, role, and property types are opaque, comparable
//! tokens that know their supertypes and nothing else.
//!
//! # Key Types
//!
//! - [`MeshObjectIdentifier`] -- Identifies a MeshObject, optionally scoped to its home store
//! - [`MeshBaseIdentifier`] -- Network location of a store
//! - [`EntityType`], [`RelationshipType`], [`RoleType`], [`PropertyType`] -- Opaque type tokens
//! - [`PropertyValue`] -- Value held by a property
//! - [`Timestamps`] -- Created / updated / read / expires times of a MeshObject
//! - [`ModelBase`] -- Resolves type identifiers back into type tokens

pub mod error;
pub mod identifier;
pub mod model;
pub mod modelbase;
pub mod temporal;
pub mod value;

pub use error::TypeError;
pub use identifier::{MeshBaseIdentifier, MeshObjectIdentifier};
pub use model::{
    DataType, EntityType, EntityTypeBuilder, MeshTypeIdentifier, PropertyType, RelationshipType,
    RoleEnd, RoleType,
};
pub use modelbase::{InMemoryModelBase, ModelBase};
pub use temporal::{now_millis, Timestamps, NEVER_EXPIRES};
pub use value::PropertyValue;
