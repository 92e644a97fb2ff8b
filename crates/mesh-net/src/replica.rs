//! Replica bookkeeping: which peers hold replicas of an object, and where
//! its home replica and its update lock are.

use std::sync::{Mutex, MutexGuard};

use mesh_store::{
    ExternalizedReplication, MeshError, MeshObject, MeshResult, ObjectExtension, Operation,
};
use mesh_types::MeshBaseIdentifier;
use tracing::{debug, warn};

use crate::context::ReplicationContext;
use crate::lock::LockProtocol;
use crate::NetMeshObject;

/// Monotonic counter carried by every lock hand-off.
pub type LockEpoch = u64;

/// Where something lives, seen from one replica: here, or behind one of its
/// proxies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyIndex {
    Here,
    At(usize),
}

impl ProxyIndex {
    fn externalize(self) -> Option<usize> {
        match self {
            Self::Here => None,
            Self::At(i) => Some(i),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReplicaState {
    pub(crate) proxies: Vec<MeshBaseIdentifier>,
    pub(crate) home: ProxyIndex,
    pub(crate) lock: ProxyIndex,
    pub(crate) will_give_up_lock: bool,
    pub(crate) lock_epoch: LockEpoch,
}

impl ReplicaState {
    pub(crate) fn proxy_at(&self, index: ProxyIndex) -> Option<&MeshBaseIdentifier> {
        match index {
            ProxyIndex::Here => None,
            ProxyIndex::At(i) => self.proxies.get(i),
        }
    }

    pub(crate) fn index_of(&self, proxy: &MeshBaseIdentifier) -> Option<usize> {
        self.proxies.iter().position(|p| p == proxy)
    }

    /// Index of `proxy`, appending it first if unknown.
    pub(crate) fn index_or_insert(&mut self, proxy: &MeshBaseIdentifier) -> usize {
        self.index_of(proxy).unwrap_or_else(|| {
            self.proxies.push(proxy.clone());
            self.proxies.len() - 1
        })
    }
}

/// Per-object state of a replicated MeshObject.
pub struct Replica {
    state: Mutex<ReplicaState>,
}

impl Replica {
    /// A replica that is its own home and holds the lock.
    fn home(will_give_up_lock: bool) -> Self {
        Self {
            state: Mutex::new(ReplicaState {
                proxies: Vec::new(),
                home: ProxyIndex::Here,
                lock: ProxyIndex::Here,
                will_give_up_lock,
                lock_epoch: 0,
            }),
        }
    }

    fn from_externalized(object_replication: &ExternalizedReplication) -> Self {
        let len = object_replication.proxies.len();
        let index = |i: Option<usize>, what: &str| match i {
            None => ProxyIndex::Here,
            Some(i) if i < len => ProxyIndex::At(i),
            Some(i) => {
                warn!(index = i, proxies = len, what, "proxy index out of range, using here");
                ProxyIndex::Here
            }
        };
        Self {
            state: Mutex::new(ReplicaState {
                proxies: object_replication.proxies.clone(),
                home: index(object_replication.home_proxy, "home"),
                lock: index(object_replication.lock_proxy, "lock"),
                will_give_up_lock: object_replication.will_give_up_lock,
                lock_epoch: object_replication.lock_epoch,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().expect("replica lock poisoned")
    }

    pub fn has_lock(&self) -> bool {
        self.state().lock == ProxyIndex::Here
    }

    pub fn is_home_replica(&self) -> bool {
        self.state().home == ProxyIndex::Here
    }

    /// Peers known to hold replicas, in index order.
    pub fn proxies(&self) -> Vec<MeshBaseIdentifier> {
        self.state().proxies.clone()
    }

    pub fn home_index(&self) -> ProxyIndex {
        self.state().home
    }

    pub fn lock_index(&self) -> ProxyIndex {
        self.state().lock
    }

    /// The peer in the direction of the home replica, `None` if it is here.
    pub fn home_proxy(&self) -> Option<MeshBaseIdentifier> {
        let state = self.state();
        state.proxy_at(state.home).cloned()
    }

    /// The peer in the direction of the lock holder, `None` if it is here.
    pub fn lock_proxy(&self) -> Option<MeshBaseIdentifier> {
        let state = self.state();
        state.proxy_at(state.lock).cloned()
    }

    pub fn lock_epoch(&self) -> LockEpoch {
        self.state().lock_epoch
    }

    pub fn will_give_up_lock(&self) -> bool {
        self.state().will_give_up_lock
    }

    pub fn set_will_give_up_lock(&self, will: bool) {
        self.state().will_give_up_lock = will;
    }

    fn externalize(&self) -> ExternalizedReplication {
        let state = self.state();
        ExternalizedReplication {
            proxies: state.proxies.clone(),
            home_proxy: state.home.externalize(),
            lock_proxy: state.lock.externalize(),
            will_give_up_lock: state.will_give_up_lock,
            lock_epoch: state.lock_epoch,
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Replica")
            .field("proxies", &state.proxies)
            .field("home", &state.home)
            .field("lock", &state.lock)
            .field("lock_epoch", &state.lock_epoch)
            .finish()
    }
}

impl ObjectExtension for Replica {
    type Store = ReplicationContext;

    const SCOPED_IDENTIFIERS: bool = true;

    fn create(store: &ReplicationContext) -> Self {
        Self::home(store.config().will_give_up_lock)
    }

    fn restore(store: &ReplicationContext, replication: Option<&ExternalizedReplication>) -> Self {
        match replication {
            Some(r) => Self::from_externalized(r),
            None => Self::create(store),
        }
    }

    fn replication(&self) -> Option<ExternalizedReplication> {
        Some(self.externalize())
    }

    /// An update must originate at the replica holding the lock, so obtain it
    /// first.
    fn check_update_permission(object: &MeshObject<Self>, operation: Operation) -> MeshResult<()> {
        let base = object
            .mesh_base()
            .ok_or_else(|| MeshError::ObjectDead(object.identifier().clone()))?;
        let timeout = base.extension().config().lock_timeout();
        match object.try_to_obtain_lock(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(object = %object.identifier(), %operation, "update lock not obtained");
                Err(MeshError::CannotObtainLock {
                    object: object.identifier().clone(),
                    cause: None,
                })
            }
            Err(timeout) => Err(MeshError::CannotObtainLock {
                object: object.identifier().clone(),
                cause: Some(timeout),
            }),
        }
    }
}

/// Maintaining the set of peers that hold replicas of an object.
pub trait ReplicaBookkeeping {
    /// Note that `proxy` leads to a replica. Returns `false` if it was known.
    fn register_replication_towards(&self, proxy: &MeshBaseIdentifier) -> bool;

    /// Forget `proxy`. Indices past it shift down; a home or lock index
    /// pointing at it falls back to here.
    fn unregister_replication_towards(&self, proxy: &MeshBaseIdentifier) -> bool;

    /// Turn this object into a replica whose home and lock lie behind
    /// `proxy`, as of `epoch`.
    fn make_replica_from(&self, proxy: &MeshBaseIdentifier, epoch: LockEpoch);
}

impl ReplicaBookkeeping for NetMeshObject {
    fn register_replication_towards(&self, proxy: &MeshBaseIdentifier) -> bool {
        let mut state = self.extension().state();
        if state.index_of(proxy).is_some() {
            return false;
        }
        state.proxies.push(proxy.clone());
        debug!(object = %self.identifier(), %proxy, "replication registered");
        true
    }

    fn unregister_replication_towards(&self, proxy: &MeshBaseIdentifier) -> bool {
        let mut state = self.extension().state();
        let Some(removed) = state.index_of(proxy) else {
            return false;
        };
        let state = &mut *state;
        state.proxies.remove(removed);
        for (what, index) in [("home", &mut state.home), ("lock", &mut state.lock)] {
            match *index {
                ProxyIndex::At(i) if i == removed => {
                    warn!(object = %self.identifier(), %proxy, what, "index pointed at removed proxy, using here");
                    *index = ProxyIndex::Here;
                }
                ProxyIndex::At(i) if i > removed => *index = ProxyIndex::At(i - 1),
                _ => {}
            }
        }
        debug!(object = %self.identifier(), %proxy, "replication unregistered");
        true
    }

    fn make_replica_from(&self, proxy: &MeshBaseIdentifier, epoch: LockEpoch) {
        let mut state = self.extension().state();
        let index = state.index_or_insert(proxy);
        state.home = ProxyIndex::At(index);
        state.lock = ProxyIndex::At(index);
        state.lock_epoch = epoch;
        debug!(object = %self.identifier(), %proxy, epoch, "made replica");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MeshBaseBuilderExt, NetMeshBase, ReplicationConfig};
    use mesh_store::MeshBase;
    use std::sync::Arc;

    fn peer(name: &str) -> MeshBaseIdentifier {
        MeshBaseIdentifier::parse(name).unwrap()
    }

    fn store() -> Arc<NetMeshBase> {
        MeshBase::builder(peer("here")).build_net(ReplicationConfig::default())
    }

    #[test]
    fn new_objects_are_home_and_hold_the_lock() {
        let mb = store();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        tx.commit().unwrap();
        assert!(obj.extension().has_lock());
        assert!(obj.extension().is_home_replica());
        assert_eq!(obj.identifier().scope(), Some(mb.identifier()));
        assert!(obj.extension().proxies().is_empty());
    }

    #[test]
    fn unregister_rebases_indices() {
        let mb = store();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        tx.commit().unwrap();

        for p in ["p1", "p2", "p3"] {
            assert!(obj.register_replication_towards(&peer(p)));
        }
        assert!(!obj.register_replication_towards(&peer("p2")));
        obj.make_replica_from(&peer("p3"), 4);
        assert_eq!(obj.extension().home_index(), ProxyIndex::At(2));
        assert_eq!(obj.extension().lock_index(), ProxyIndex::At(2));

        assert!(obj.unregister_replication_towards(&peer("p1")));
        assert_eq!(obj.extension().lock_index(), ProxyIndex::At(1));
        assert_eq!(obj.extension().lock_proxy(), Some(peer("p3")));
        assert_eq!(obj.extension().home_proxy(), Some(peer("p3")));

        assert!(obj.unregister_replication_towards(&peer("p3")));
        assert_eq!(obj.extension().lock_index(), ProxyIndex::Here);
        assert_eq!(obj.extension().home_index(), ProxyIndex::Here);
        assert_eq!(obj.extension().proxies(), vec![peer("p2")]);
        assert!(!obj.unregister_replication_towards(&peer("p3")));
    }

    #[test]
    fn replication_survives_externalization() {
        let mb = store();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        obj.make_replica_from(&peer("origin"), 7);
        obj.extension().set_will_give_up_lock(false);
        tx.commit().unwrap();

        let replication = obj.externalize().replication.unwrap();
        assert_eq!(replication.proxies, vec![peer("origin")]);
        assert_eq!(replication.lock_proxy, Some(0));
        assert_eq!(replication.lock_epoch, 7);

        let restored = Replica::from_externalized(&replication);
        assert_eq!(restored.lock_proxy(), Some(peer("origin")));
        assert!(!restored.will_give_up_lock());
    }

    #[test]
    fn out_of_range_indices_fall_back_to_here() {
        let replica = Replica::from_externalized(&ExternalizedReplication {
            proxies: vec![peer("a")],
            home_proxy: Some(3),
            lock_proxy: Some(0),
            will_give_up_lock: true,
            lock_epoch: 1,
        });
        assert!(replica.is_home_replica());
        assert!(!replica.has_lock());
    }
}
