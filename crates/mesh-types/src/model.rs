//! Opaque type tokens.
//!
//! MeshBase does not define a type system; it only needs tokens that can be
//! compared, ordered by specialization, and resolved from their identifiers.
//! Tokens are cheap to clone (`Arc`-backed) and compare by identifier.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::PropertyValue;

/// Identifier of a type token (entity, relationship, role, or property type).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshTypeIdentifier(String);

impl MeshTypeIdentifier {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MeshTypeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshTypeIdentifier({})", self.0)
    }
}

impl fmt::Display for MeshTypeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeshTypeIdentifier {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MeshTypeIdentifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// PropertyType
// ---------------------------------------------------------------------------

/// The data type of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    String,
    Blob,
    TimeStamp,
    Enumerated,
}

struct PropertyTypeInner {
    identifier: MeshTypeIdentifier,
    data_type: DataType,
    /// `None` for optional properties; the initial value otherwise.
    default_value: Option<PropertyValue>,
}

/// A property declared by an [`EntityType`].
#[derive(Clone)]
pub struct PropertyType(Arc<PropertyTypeInner>);

impl PropertyType {
    /// An optional property: starts out without a value and may be cleared.
    pub fn optional(identifier: impl Into<MeshTypeIdentifier>, data_type: DataType) -> Self {
        Self(Arc::new(PropertyTypeInner {
            identifier: identifier.into(),
            data_type,
            default_value: None,
        }))
    }

    /// A mandatory property: starts out with `default_value` and can never be
    /// cleared.
    pub fn mandatory(
        identifier: impl Into<MeshTypeIdentifier>,
        default_value: PropertyValue,
    ) -> Self {
        Self(Arc::new(PropertyTypeInner {
            identifier: identifier.into(),
            data_type: default_value.data_type(),
            default_value: Some(default_value),
        }))
    }

    pub fn identifier(&self) -> &MeshTypeIdentifier {
        &self.0.identifier
    }

    pub fn data_type(&self) -> DataType {
        self.0.data_type
    }

    pub fn is_optional(&self) -> bool {
        self.0.default_value.is_none()
    }

    pub fn default_value(&self) -> Option<&PropertyValue> {
        self.0.default_value.as_ref()
    }
}

impl PartialEq for PropertyType {
    fn eq(&self, other: &Self) -> bool {
        self.0.identifier == other.0.identifier
    }
}

impl Eq for PropertyType {}

impl Hash for PropertyType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.identifier.hash(state);
    }
}

impl PartialOrd for PropertyType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.identifier.cmp(&other.0.identifier)
    }
}

impl fmt::Debug for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyType({})", self.0.identifier)
    }
}

// ---------------------------------------------------------------------------
// EntityType
// ---------------------------------------------------------------------------

struct EntityTypeInner {
    identifier: MeshTypeIdentifier,
    supertypes: Vec<EntityType>,
    is_abstract: bool,
    property_types: Vec<PropertyType>,
}

/// A type a MeshObject can be blessed with.
#[derive(Clone)]
pub struct EntityType(Arc<EntityTypeInner>);

impl EntityType {
    pub fn builder(identifier: impl Into<MeshTypeIdentifier>) -> EntityTypeBuilder {
        EntityTypeBuilder {
            identifier: identifier.into(),
            supertypes: Vec::new(),
            is_abstract: false,
            property_types: Vec::new(),
        }
    }

    /// A concrete entity type with no supertypes and no properties.
    pub fn new(identifier: impl Into<MeshTypeIdentifier>) -> Self {
        Self::builder(identifier).build()
    }

    pub fn identifier(&self) -> &MeshTypeIdentifier {
        &self.0.identifier
    }

    pub fn is_abstract(&self) -> bool {
        self.0.is_abstract
    }

    pub fn supertypes(&self) -> &[EntityType] {
        &self.0.supertypes
    }

    /// Returns `true` if `self` equals `other` or inherits from it.
    pub fn is_subtype_of(&self, other: &EntityType) -> bool {
        self == other || self.0.supertypes.iter().any(|s| s.is_subtype_of(other))
    }

    /// Property types declared directly on this type.
    pub fn local_property_types(&self) -> &[PropertyType] {
        &self.0.property_types
    }

    /// Property types declared on this type and all of its supertypes.
    pub fn property_types(&self) -> Vec<PropertyType> {
        let mut result: Vec<PropertyType> = self.0.property_types.clone();
        for supertype in &self.0.supertypes {
            for pt in supertype.property_types() {
                if !result.contains(&pt) {
                    result.push(pt);
                }
            }
        }
        result
    }

    /// Returns `true` if this type or one of its supertypes declares `pt`.
    pub fn declares(&self, pt: &PropertyType) -> bool {
        self.0.property_types.contains(pt) || self.0.supertypes.iter().any(|s| s.declares(pt))
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.0.identifier == other.0.identifier
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.identifier.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityType({})", self.0.identifier)
    }
}

/// Builder for [`EntityType`].
pub struct EntityTypeBuilder {
    identifier: MeshTypeIdentifier,
    supertypes: Vec<EntityType>,
    is_abstract: bool,
    property_types: Vec<PropertyType>,
}

impl EntityTypeBuilder {
    pub fn supertype(mut self, supertype: &EntityType) -> Self {
        self.supertypes.push(supertype.clone());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn property(mut self, pt: PropertyType) -> Self {
        self.property_types.push(pt);
        self
    }

    pub fn build(self) -> EntityType {
        EntityType(Arc::new(EntityTypeInner {
            identifier: self.identifier,
            supertypes: self.supertypes,
            is_abstract: self.is_abstract,
            property_types: self.property_types,
        }))
    }
}

// ---------------------------------------------------------------------------
// RelationshipType / RoleType
// ---------------------------------------------------------------------------

struct RelationshipTypeInner {
    identifier: MeshTypeIdentifier,
    source: Option<EntityType>,
    destination: Option<EntityType>,
    supertypes: Vec<RelationshipType>,
    is_abstract: bool,
}

/// A type a relationship between two MeshObjects can be blessed with.
///
/// Each relationship type has two ends, its source and destination
/// [`RoleType`]s. An end may require the MeshObject playing it to be blessed
/// with a particular [`EntityType`].
#[derive(Clone)]
pub struct RelationshipType(Arc<RelationshipTypeInner>);

impl RelationshipType {
    /// A concrete relationship type between the given entity types. `None`
    /// leaves that end unconstrained.
    pub fn new(
        identifier: impl Into<MeshTypeIdentifier>,
        source: Option<&EntityType>,
        destination: Option<&EntityType>,
    ) -> Self {
        Self::build(identifier.into(), source, destination, Vec::new(), false)
    }

    /// An abstract relationship type; roles of it can never be blessed.
    pub fn new_abstract(
        identifier: impl Into<MeshTypeIdentifier>,
        source: Option<&EntityType>,
        destination: Option<&EntityType>,
    ) -> Self {
        Self::build(identifier.into(), source, destination, Vec::new(), true)
    }

    /// A concrete relationship type specializing `supertype`.
    pub fn specializing(
        identifier: impl Into<MeshTypeIdentifier>,
        source: Option<&EntityType>,
        destination: Option<&EntityType>,
        supertype: &RelationshipType,
    ) -> Self {
        Self::build(
            identifier.into(),
            source,
            destination,
            vec![supertype.clone()],
            false,
        )
    }

    fn build(
        identifier: MeshTypeIdentifier,
        source: Option<&EntityType>,
        destination: Option<&EntityType>,
        supertypes: Vec<RelationshipType>,
        is_abstract: bool,
    ) -> Self {
        Self(Arc::new(RelationshipTypeInner {
            identifier,
            source: source.cloned(),
            destination: destination.cloned(),
            supertypes,
            is_abstract,
        }))
    }

    pub fn identifier(&self) -> &MeshTypeIdentifier {
        &self.0.identifier
    }

    pub fn is_abstract(&self) -> bool {
        self.0.is_abstract
    }

    pub fn source(&self) -> RoleType {
        RoleType {
            relationship: self.clone(),
            end: RoleEnd::Source,
        }
    }

    pub fn destination(&self) -> RoleType {
        RoleType {
            relationship: self.clone(),
            end: RoleEnd::Destination,
        }
    }

    /// Returns `true` if `self` equals `other` or inherits from it.
    pub fn is_subtype_of(&self, other: &RelationshipType) -> bool {
        self == other || self.0.supertypes.iter().any(|s| s.is_subtype_of(other))
    }
}

impl PartialEq for RelationshipType {
    fn eq(&self, other: &Self) -> bool {
        self.0.identifier == other.0.identifier
    }
}

impl Eq for RelationshipType {}

impl Hash for RelationshipType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.identifier.hash(state);
    }
}

impl fmt::Debug for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationshipType({})", self.0.identifier)
    }
}

/// Which end of a relationship a [`RoleType`] is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleEnd {
    Source,
    Destination,
}

impl RoleEnd {
    fn suffix(self) -> &'static str {
        match self {
            Self::Source => "-S",
            Self::Destination => "-D",
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Source => Self::Destination,
            Self::Destination => Self::Source,
        }
    }
}

/// One end of a [`RelationshipType`]: the role a MeshObject plays towards a
/// neighbor.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoleType {
    relationship: RelationshipType,
    end: RoleEnd,
}

impl RoleType {
    /// `<relationship identifier>-S` or `<relationship identifier>-D`.
    pub fn identifier(&self) -> MeshTypeIdentifier {
        MeshTypeIdentifier::new(format!(
            "{}{}",
            self.relationship.identifier(),
            self.end.suffix()
        ))
    }

    pub fn relationship_type(&self) -> &RelationshipType {
        &self.relationship
    }

    pub fn end(&self) -> RoleEnd {
        self.end
    }

    /// The role played by the neighbor at the other end.
    pub fn inverse(&self) -> RoleType {
        RoleType {
            relationship: self.relationship.clone(),
            end: self.end.opposite(),
        }
    }

    pub fn is_abstract(&self) -> bool {
        self.relationship.is_abstract()
    }

    /// The entity type a MeshObject must carry to play this role.
    pub fn required_entity_type(&self) -> Option<&EntityType> {
        match self.end {
            RoleEnd::Source => self.relationship.0.source.as_ref(),
            RoleEnd::Destination => self.relationship.0.destination.as_ref(),
        }
    }

    /// Returns `true` if `self` is the same end as `other` of the same or a
    /// more specific relationship type.
    pub fn is_specialization_of(&self, other: &RoleType) -> bool {
        self.end == other.end && self.relationship.is_subtype_of(&other.relationship)
    }
}

impl fmt::Debug for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoleType({})", self.identifier())
    }
}
