//! The MeshBase kernel: a transactional graph store of MeshObjects.
//!
//! A [`MeshBase`] holds a graph of [`MeshObject`]s. Each object carries
//! blessed entity types, typed property values, relationships to neighbors
//! with role types on both ends, and an optional place in an equivalence
//! chain. All mutation happens inside the single active [`Transaction`] of
//! the store, which only the thread that created it may use.
//!
//! # Key Types
//!
//! - [`MeshBase`] -- The store, its object cache and its transaction gate
//! - [`MeshObject`] -- A graph node; relationships and equivalents are held by identifier
//! - [`Transaction`] -- Captures [`Change`]s; commit delivers them, rollback undoes them
//! - [`LifecycleManager`] -- Creates, deletes and loads objects
//! - [`EventBus`] -- Transaction, change and lifecycle listeners of one store
//! - [`ObjectExtension`] -- Seam through which replicated stores plug in lock handling
//!
//! # Design Rules
//!
//! 1. At most one active transaction per store, owned by one thread.
//! 2. Two-endpoint mutations lock both objects in identifier order.
//! 3. Adjacency is symmetric: if A lists B with roles R, B lists A with the inverses of R.
//! 4. Every change concerns one object and can be undone on its own.
//! 5. Strict ([`ApplyMode::Master`]) operations fail on no-ops; ripple operations report them as [`Outcome`]s.

pub mod access;
pub mod change;
pub mod config;
pub mod equivalence;
pub mod error;
pub mod execute;
pub mod extension;
pub mod externalized;
pub mod lifecycle;
pub mod listener;
pub mod meshbase;
pub mod object;
pub mod relationship;
pub mod sweep;
pub mod transaction;

pub use access::{AccessManager, AccessRequest, Operation};
pub use change::Change;
pub use config::MeshBaseConfig;
pub use equivalence::EquivalencePointers;
pub use error::{ErrorKind, MeshError, MeshResult, ObjectsNotFound, RemoteQueryTimeout};
pub use execute::{ActionError, ExecuteError, TransactionAction};
pub use extension::{Local, ObjectExtension, StoreExtension};
pub use externalized::{ExternalizedMeshObject, ExternalizedReplication, MeshObjectSnapshot};
pub use lifecycle::LifecycleManager;
pub use listener::{
    ChangeListener, EventBus, LifecycleListener, ListenerSet, TransactionListener,
};
pub use meshbase::{MeshBase, MeshBaseBuilder};
pub use object::{ApplyMode, MeshObject, Outcome};
pub use sweep::{ExpirySweepPolicy, SweepPolicy};
pub use transaction::{Transaction, TransactionId, TransactionState};
