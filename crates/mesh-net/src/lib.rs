//! Replicated MeshBases: update locks, home replicas and ripples.
//!
//! A [`NetMeshBase`] is a [`MeshBase`] whose objects are replicas. Several
//! stores may hold a replica of the same object; one of them is its home
//! replica and exactly one holds the update lock. Before a replica is
//! changed it obtains the lock through a [`Proxy`] towards the holder. Peers
//! then replay the committed [`Change`](mesh_store::Change)s with
//! [`ripple_changes`], which neither checks permissions nor moves locks.
//!
//! # Key Types
//!
//! - [`NetMeshBase`] -- A store of replicas, built with [`MeshBaseBuilderExt::build_net`]
//! - [`Replica`] -- Proxies, home and lock direction of one object
//! - [`LockProtocol`] -- Obtaining, surrendering and reclaiming the update lock
//! - [`Proxy`] -- The connection from a store to one peer store
//! - [`LoopbackProxy`] -- A proxy between two stores in the same process
//! - [`RippleOperations`] -- Applying changes already confirmed elsewhere
//!
//! # Design Rules
//!
//! 1. At most one replica of an object holds the lock at any time.
//! 2. A lock hand-off carries a strictly newer epoch than any the receiver has seen.
//! 3. No replica state is locked while a proxy is called.
//! 4. Ripples are idempotent.

use std::sync::Arc;

use mesh_store::{MeshBase, MeshBaseBuilder, MeshObject};

pub mod config;
pub mod context;
pub mod lock;
pub mod loopback;
pub mod proxy;
pub mod replica;
pub mod ripple;

pub use config::ReplicationConfig;
pub use context::ReplicationContext;
pub use lock::LockProtocol;
pub use loopback::LoopbackProxy;
pub use proxy::Proxy;
pub use replica::{LockEpoch, ProxyIndex, Replica, ReplicaBookkeeping};
pub use ripple::{ripple_changes, RippleOperations};

pub type NetMeshBase = MeshBase<Replica>;

pub type NetMeshObject = MeshObject<Replica>;

pub trait MeshBaseBuilderExt {
    /// Build a store whose objects are replicas.
    fn build_net(self, config: ReplicationConfig) -> Arc<NetMeshBase>;
}

impl MeshBaseBuilderExt for MeshBaseBuilder {
    fn build_net(self, config: ReplicationConfig) -> Arc<NetMeshBase> {
        self.build_with::<Replica>(ReplicationContext::new(config))
    }
}
