use std::fmt;

use mesh_types::MeshObjectIdentifier;

/// Kinds of operations presented to an [`AccessManager`] and to the
/// per-object permission hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Delete,
    Bless,
    Unbless,
    SetProperty,
    Relate,
    Unrelate,
    BlessRole,
    UnblessRole,
    AddEquivalent,
    RemoveEquivalent,
    Traverse,
}

impl Operation {
    /// Operations that may only originate at the replica holding the update
    /// lock.
    pub fn requires_update_lock(self) -> bool {
        matches!(
            self,
            Self::Delete
                | Self::Bless
                | Self::Unbless
                | Self::SetProperty
                | Self::BlessRole
                | Self::UnblessRole
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Bless => "bless",
            Self::Unbless => "unbless",
            Self::SetProperty => "set-property",
            Self::Relate => "relate",
            Self::Unrelate => "unrelate",
            Self::BlessRole => "bless-role",
            Self::UnblessRole => "unbless-role",
            Self::AddEquivalent => "add-equivalent",
            Self::RemoveEquivalent => "remove-equivalent",
            Self::Traverse => "traverse",
        };
        f.write_str(s)
    }
}

/// One permission question: may `operation` be performed on `subject`
/// (towards `other`, for two-endpoint operations)?
#[derive(Clone, Copy, Debug)]
pub struct AccessRequest<'a> {
    pub subject: &'a MeshObjectIdentifier,
    pub operation: Operation,
    pub other: Option<&'a MeshObjectIdentifier>,
}

/// Policy deciding which operations are allowed.
///
/// A store without an access manager allows everything. Only master
/// operations are checked; ripple operations replay decisions already taken
/// elsewhere.
pub trait AccessManager: Send + Sync {
    fn is_permitted(&self, request: &AccessRequest<'_>) -> bool;
}

impl<F> AccessManager for F
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync,
{
    fn is_permitted(&self, request: &AccessRequest<'_>) -> bool {
        self(request)
    }
}
