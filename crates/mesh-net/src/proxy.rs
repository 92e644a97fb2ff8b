//! The connection from a store to one peer store.

use std::time::Duration;

use mesh_store::RemoteQueryTimeout;
use mesh_types::MeshBaseIdentifier;

use crate::NetMeshObject;

/// A channel to one peer store holding other replicas.
///
/// Calls block until the peer has answered or the timeout has passed. The
/// peer answers by invoking the inbound side of the lock protocol
/// ([`push_lock`](crate::LockProtocol::push_lock) and friends) on the local
/// replicas.
pub trait Proxy: Send + Sync {
    /// The store at the other end.
    fn partner_identifier(&self) -> &MeshBaseIdentifier;

    /// Ask the peer to hand over the update locks of `objects`. Returns once
    /// the peer has answered; whether a lock arrived shows on each replica.
    fn try_to_obtain_locks(
        &self,
        objects: &[&NetMeshObject],
        timeout: Duration,
    ) -> Result<(), RemoteQueryTimeout>;

    /// Tell the peer that the locks of `objects` have been reclaimed here.
    fn force_obtain_locks(&self, objects: &[&NetMeshObject]) -> Result<(), RemoteQueryTimeout>;
}
