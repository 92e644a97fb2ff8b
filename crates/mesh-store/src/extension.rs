//! Seams through which a store specializes its objects.
//!
//! A plain [`MeshBase`](crate::MeshBase) uses [`Local`]. Replicated stores plug
//! in per-object replica bookkeeping and a store-wide replication context,
//! and override the update permission hook to require the write lock.

use crate::access::Operation;
use crate::error::MeshResult;
use crate::externalized::ExternalizedReplication;
use crate::object::MeshObject;

/// Store-wide state shared by all objects of one store.
pub trait StoreExtension: Send + Sync + 'static {
    /// Called once when the store dies.
    fn die(&self, _permanent: bool) {}
}

impl StoreExtension for () {}

/// Per-object state carried by every MeshObject of a store.
pub trait ObjectExtension: Sized + Send + Sync + 'static {
    type Store: StoreExtension;

    /// Whether auto-created identifiers are scoped to the owning store.
    const SCOPED_IDENTIFIERS: bool = false;

    /// State for an object created locally.
    fn create(store: &Self::Store) -> Self;

    /// State for an object loaded from its externalized form, or restored by
    /// a rollback.
    fn restore(store: &Self::Store, replication: Option<&ExternalizedReplication>) -> Self;

    /// Replication data to carry into the externalized form.
    fn replication(&self) -> Option<ExternalizedReplication> {
        None
    }

    /// Runs for master operations that require the update lock, after the
    /// access manager has allowed them and before any state is touched.
    fn check_update_permission(_object: &MeshObject<Self>, _operation: Operation) -> MeshResult<()> {
        Ok(())
    }
}

/// Extension of objects in a store that is not replicated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Local;

impl ObjectExtension for Local {
    type Store = ();

    fn create(_store: &()) -> Self {
        Local
    }

    fn restore(_store: &(), _replication: Option<&ExternalizedReplication>) -> Self {
        Local
    }
}
