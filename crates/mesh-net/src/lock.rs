//! The update-lock protocol between replicas.
//!
//! Exactly one replica of an object holds the update lock and may originate
//! changes to it. The lock moves between replicas by hand-off: the
//! requester asks its proxy in the direction of the holder
//! ([`LockProtocol::try_to_obtain_lock`]), the holder gives the lock up
//! ([`LockProtocol::surrender_lock`]) and the requester receives it
//! ([`LockProtocol::push_lock`]).
//!
//! Every hand-off increments the lock epoch. A replica refuses grants whose
//! epoch is not newer than the one it has seen, so a delayed grant cannot
//! take the lock back after it has moved on. The home replica may reclaim
//! the lock without negotiation ([`LockProtocol::force_obtain_lock`]). If
//! the peer holding the lock cannot be told, it keeps believing it holds the
//! lock until it hears of a newer epoch.

use std::time::Duration;

use mesh_store::{Change, MeshError, MeshResult, RemoteQueryTimeout};
use mesh_types::MeshBaseIdentifier;
use tracing::{debug, warn};

use crate::replica::{LockEpoch, ProxyIndex};
use crate::NetMeshObject;

pub trait LockProtocol {
    fn has_lock(&self) -> bool;

    /// Obtain the update lock from whichever peer holds it, waiting at most
    /// `timeout`. Returns whether this replica holds the lock afterwards.
    fn try_to_obtain_lock(&self, timeout: Duration) -> Result<bool, RemoteQueryTimeout>;

    /// A peer hands the lock to this replica. Returns `false` for a stale
    /// grant, which is ignored.
    fn push_lock(&self, from: &MeshBaseIdentifier, epoch: LockEpoch) -> bool;

    /// A peer asks for the lock. If the lock lies towards a third replica it
    /// is first obtained from there. On success the lock now lies in the
    /// direction of `asking`, and the epoch of the grant is returned.
    fn surrender_lock(&self, asking: &MeshBaseIdentifier) -> Option<LockEpoch>;

    /// Take the lock back without asking. Only the home replica may.
    fn force_obtain_lock(&self) -> MeshResult<()>;

    /// The home replica behind `by` has reclaimed the lock at `epoch`.
    /// Returns `false` if the notice is stale.
    fn lock_reclaimed(&self, by: &MeshBaseIdentifier, epoch: LockEpoch) -> bool;
}

fn notify(object: &NetMeshObject, change: Change) {
    if let Some(base) = object.mesh_base() {
        base.notify_change(change);
    }
}

/// Pull the lock from `holder` on behalf of `asking`, so it can be passed on.
/// Returns whether this replica holds the lock afterwards.
fn forward_lock_request(object: &NetMeshObject, holder: &MeshBaseIdentifier, asking: &MeshBaseIdentifier) -> bool {
    let Some(base) = object.mesh_base() else {
        return false;
    };
    let timeout = base.extension().config().lock_timeout();
    debug!(object = %object.identifier(), %asking, %holder, "forwarding lock request");
    match object.try_to_obtain_lock(timeout) {
        Ok(obtained) => obtained,
        Err(e) => {
            warn!(object = %object.identifier(), %asking, %holder, error = %e, "lock request not forwarded");
            false
        }
    }
}

impl LockProtocol for NetMeshObject {
    fn has_lock(&self) -> bool {
        self.extension().has_lock()
    }

    fn try_to_obtain_lock(&self, timeout: Duration) -> Result<bool, RemoteQueryTimeout> {
        if self.has_lock() {
            return Ok(true);
        }
        let Some(base) = self.mesh_base() else {
            return Ok(false);
        };
        let context = base.extension();
        if context.refuses_lock_requests() {
            debug!(object = %self.identifier(), "store refuses lock requests");
            return Ok(false);
        }
        let Some(partner) = self.extension().lock_proxy() else {
            return Ok(self.has_lock());
        };
        let Some(proxy) = context.proxy(&partner) else {
            warn!(object = %self.identifier(), %partner, "no proxy towards lock holder");
            return Ok(false);
        };

        debug!(object = %self.identifier(), %partner, ?timeout, "asking for lock");
        proxy.try_to_obtain_locks(&[self], timeout)?;
        Ok(self.has_lock())
    }

    fn push_lock(&self, from: &MeshBaseIdentifier, epoch: LockEpoch) -> bool {
        {
            let mut state = self.extension().state();
            if state.lock == ProxyIndex::Here {
                state.lock_epoch = state.lock_epoch.max(epoch);
                return true;
            }
            if epoch <= state.lock_epoch {
                warn!(
                    object = %self.identifier(),
                    %from,
                    epoch,
                    seen = state.lock_epoch,
                    "ignoring stale lock grant"
                );
                return false;
            }
            if state.proxy_at(state.lock) != Some(from) {
                warn!(object = %self.identifier(), %from, "lock pushed by unexpected peer");
            }
            state.lock = ProxyIndex::Here;
            state.lock_epoch = epoch;
        }
        debug!(object = %self.identifier(), %from, epoch, "lock gained");
        notify(
            self,
            Change::LockGained {
                identifier: self.identifier().clone(),
            },
        );
        true
    }

    fn surrender_lock(&self, asking: &MeshBaseIdentifier) -> Option<LockEpoch> {
        let holder = {
            let state = self.extension().state();
            match state.lock {
                ProxyIndex::Here => None,
                ProxyIndex::At(i) => match state.proxies.get(i) {
                    Some(p) if p == asking => return Some(state.lock_epoch),
                    p => p.cloned(),
                },
            }
        };
        if let Some(holder) = holder {
            if !forward_lock_request(self, &holder, asking) {
                return None;
            }
        }

        let epoch = {
            let mut state = self.extension().state();
            if state.lock != ProxyIndex::Here {
                debug!(object = %self.identifier(), %asking, "lock is not here");
                return None;
            }
            if !state.will_give_up_lock {
                debug!(object = %self.identifier(), %asking, "refusing to give up lock");
                return None;
            }
            let index = state.index_or_insert(asking);
            state.lock = ProxyIndex::At(index);
            state.lock_epoch += 1;
            state.lock_epoch
        };
        debug!(object = %self.identifier(), %asking, epoch, "lock surrendered");
        notify(
            self,
            Change::LockLost {
                identifier: self.identifier().clone(),
            },
        );
        Some(epoch)
    }

    fn force_obtain_lock(&self) -> MeshResult<()> {
        let base = self
            .mesh_base()
            .ok_or_else(|| MeshError::ObjectDead(self.identifier().clone()))?;
        let (previous, epoch) = {
            let mut state = self.extension().state();
            if state.home != ProxyIndex::Here {
                return Err(MeshError::CannotObtainLock {
                    object: self.identifier().clone(),
                    cause: None,
                });
            }
            if state.lock == ProxyIndex::Here {
                return Ok(());
            }
            let previous = state.proxy_at(state.lock).cloned();
            state.lock = ProxyIndex::Here;
            state.lock_epoch += 1;
            (previous, state.lock_epoch)
        };
        debug!(object = %self.identifier(), epoch, "lock forcibly reclaimed");
        notify(
            self,
            Change::LockGained {
                identifier: self.identifier().clone(),
            },
        );

        let Some(partner) = previous else {
            return Ok(());
        };
        match base.extension().proxy(&partner) {
            Some(proxy) => {
                if let Err(e) = proxy.force_obtain_locks(&[self]) {
                    warn!(object = %self.identifier(), %partner, error = %e, "peer not told of reclaimed lock");
                }
            }
            None => warn!(object = %self.identifier(), %partner, "no proxy towards former lock holder"),
        }
        Ok(())
    }

    fn lock_reclaimed(&self, by: &MeshBaseIdentifier, epoch: LockEpoch) -> bool {
        let lost = {
            let mut state = self.extension().state();
            if epoch <= state.lock_epoch {
                warn!(
                    object = %self.identifier(),
                    %by,
                    epoch,
                    seen = state.lock_epoch,
                    "ignoring stale lock reclaim"
                );
                return false;
            }
            let had = state.lock == ProxyIndex::Here;
            let index = state.index_or_insert(by);
            state.lock = ProxyIndex::At(index);
            state.lock_epoch = epoch;
            had
        };
        if lost {
            debug!(object = %self.identifier(), %by, epoch, "lock reclaimed by home");
            notify(
                self,
                Change::LockLost {
                    identifier: self.identifier().clone(),
                },
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaBookkeeping;
    use crate::{MeshBaseBuilderExt, NetMeshBase, ReplicationConfig};
    use mesh_store::MeshBase;
    use std::sync::Arc;

    fn peer(name: &str) -> MeshBaseIdentifier {
        MeshBaseIdentifier::parse(name).unwrap()
    }

    fn object() -> (Arc<NetMeshBase>, Arc<NetMeshObject>) {
        let mb = MeshBase::builder(peer("here")).build_net(ReplicationConfig::default());
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb.lifecycle().create_mesh_object().unwrap();
        tx.commit().unwrap();
        (mb, obj)
    }

    #[test]
    fn surrender_hands_off_once() {
        let (_mb, obj) = object();
        assert_eq!(obj.surrender_lock(&peer("p")), Some(1));
        assert!(!obj.has_lock());
        assert_eq!(obj.extension().lock_proxy(), Some(peer("p")));

        // Asked again by the same peer: the grant is repeated.
        assert_eq!(obj.surrender_lock(&peer("p")), Some(1));
        // No proxy towards p to pull the lock back through.
        assert_eq!(obj.surrender_lock(&peer("q")), None);
        assert_eq!(obj.extension().lock_proxy(), Some(peer("p")));
        assert_eq!(obj.extension().lock_epoch(), 1);
    }

    #[test]
    fn push_to_holder_keeps_the_lock() {
        let (_mb, obj) = object();
        assert!(obj.push_lock(&peer("p"), 5));
        assert!(obj.has_lock());
        assert_eq!(obj.extension().lock_epoch(), 5);
    }

    #[test]
    fn lock_round_trip_raises_the_epoch() {
        let (_mb, obj) = object();
        let epoch = obj.surrender_lock(&peer("p")).unwrap();
        assert!(!obj.push_lock(&peer("p"), epoch));
        assert!(obj.push_lock(&peer("p"), epoch + 1));
        assert!(obj.has_lock());
    }

    #[test]
    fn holder_without_proxy_cannot_obtain() {
        let (_mb, obj) = object();
        obj.make_replica_from(&peer("gone"), 0);
        assert!(!obj.try_to_obtain_lock(Duration::from_millis(1)).unwrap());
        assert!(matches!(
            obj.force_obtain_lock(),
            Err(MeshError::CannotObtainLock { cause: None, .. })
        ));
    }

    #[test]
    fn home_reclaim_without_holder_elsewhere_is_a_no_op() {
        let (_mb, obj) = object();
        obj.force_obtain_lock().unwrap();
        assert_eq!(obj.extension().lock_epoch(), 0);
    }
}
