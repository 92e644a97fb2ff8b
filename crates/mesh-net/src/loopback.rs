//! A proxy between two stores in the same process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mesh_store::{MeshError, MeshResult, RemoteQueryTimeout};
use mesh_types::{MeshBaseIdentifier, MeshObjectIdentifier};
use tracing::{debug, warn};

use crate::lock::LockProtocol;
use crate::proxy::Proxy;
use crate::replica::ReplicaBookkeeping;
use crate::{NetMeshBase, NetMeshObject};

/// Connects a store to a peer store in the same process by calling into the
/// peer's replicas directly.
///
/// Can be switched unreachable, in which case every call fails with a
/// [`RemoteQueryTimeout`] as a lost network peer would.
pub struct LoopbackProxy {
    local: Weak<NetMeshBase>,
    local_identifier: MeshBaseIdentifier,
    partner: Weak<NetMeshBase>,
    partner_identifier: MeshBaseIdentifier,
    unreachable: AtomicBool,
}

impl LoopbackProxy {
    /// Connect two stores, registering a proxy in each towards the other.
    /// Returns the proxy of `a`, then the proxy of `b`.
    pub fn connect(a: &Arc<NetMeshBase>, b: &Arc<NetMeshBase>) -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(Self::new(a, b));
        let b_to_a = Arc::new(Self::new(b, a));
        a.extension().register_proxy(a_to_b.clone());
        b.extension().register_proxy(b_to_a.clone());
        debug!(a = %a.identifier(), b = %b.identifier(), "stores connected");
        (a_to_b, b_to_a)
    }

    fn new(local: &Arc<NetMeshBase>, partner: &Arc<NetMeshBase>) -> Self {
        Self {
            local: Arc::downgrade(local),
            local_identifier: local.identifier().clone(),
            partner: Arc::downgrade(partner),
            partner_identifier: partner.identifier().clone(),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Acquire)
    }

    fn reach_partner(&self, timeout: Duration) -> Result<Arc<NetMeshBase>, RemoteQueryTimeout> {
        let partner = self
            .partner
            .upgrade()
            .filter(|p| !p.is_dead() && !self.is_unreachable());
        partner.ok_or_else(|| RemoteQueryTimeout {
            partner: self.partner_identifier.clone(),
            timeout,
        })
    }

    /// Fetch a replica of the partner's object into the local store, within
    /// the calling thread's transaction on the local store.
    ///
    /// The partner registers the local store as holding a replica. The new
    /// replica has its home and lock behind this proxy.
    pub fn obtain_replica(&self, identifier: &MeshObjectIdentifier) -> MeshResult<Arc<NetMeshObject>> {
        let local = self
            .local
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseDead(self.local_identifier.clone()))?;
        let partner = self.reach_partner(Duration::ZERO)?;
        let source = partner
            .find_by_identifier(identifier)
            .ok_or_else(|| MeshError::ObjectsNotFound {
                missing: vec![identifier.clone()],
            })?;

        let mut ext = source.externalize();
        ext.replication = None;
        let replica = local.lifecycle().load_externalized_mesh_object(&ext)?;
        replica.make_replica_from(&self.partner_identifier, source.extension().lock_epoch());
        source.register_replication_towards(&self.local_identifier);
        debug!(object = %identifier, from = %self.partner_identifier, "replica obtained");
        Ok(replica)
    }
}

impl Proxy for LoopbackProxy {
    fn partner_identifier(&self) -> &MeshBaseIdentifier {
        &self.partner_identifier
    }

    fn try_to_obtain_locks(
        &self,
        objects: &[&NetMeshObject],
        timeout: Duration,
    ) -> Result<(), RemoteQueryTimeout> {
        let partner = self.reach_partner(timeout)?;
        for object in objects {
            let Some(peer) = partner.find_by_identifier(object.identifier()) else {
                warn!(object = %object.identifier(), partner = %self.partner_identifier, "partner has no replica");
                continue;
            };
            if let Some(epoch) = peer.surrender_lock(&self.local_identifier) {
                object.push_lock(&self.partner_identifier, epoch);
            }
        }
        Ok(())
    }

    fn force_obtain_locks(&self, objects: &[&NetMeshObject]) -> Result<(), RemoteQueryTimeout> {
        let partner = self.reach_partner(Duration::ZERO)?;
        for object in objects {
            match partner.find_by_identifier(object.identifier()) {
                Some(peer) => {
                    peer.lock_reclaimed(&self.local_identifier, object.extension().lock_epoch());
                }
                None => {
                    warn!(object = %object.identifier(), partner = %self.partner_identifier, "partner has no replica")
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackProxy")
            .field("local", &self.local_identifier)
            .field("partner", &self.partner_identifier)
            .field("unreachable", &self.is_unreachable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MeshBaseBuilderExt, ReplicationConfig};
    use mesh_store::{Change, MeshBase};
    use mesh_types::{DataType, EntityType, InMemoryModelBase, ModelBase, PropertyType};
    use std::sync::Mutex;

    struct Pair {
        a: Arc<NetMeshBase>,
        b: Arc<NetMeshBase>,
        a_to_b: Arc<LoopbackProxy>,
        b_to_a: Arc<LoopbackProxy>,
        original: Arc<NetMeshObject>,
        replica: Arc<NetMeshObject>,
        name: PropertyType,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn store(name: &str, model: &Arc<dyn ModelBase>) -> Arc<NetMeshBase> {
        MeshBase::builder(MeshBaseIdentifier::parse(name).unwrap())
            .model(model.clone())
            .build_net(ReplicationConfig::default())
    }

    /// Store `a` holds the home replica of a Person, store `b` a replica of it.
    fn pair() -> Pair {
        init_tracing();
        let name = PropertyType::optional("Person/Name", DataType::String);
        let person = EntityType::builder("Person").property(name.clone()).build();
        let model = InMemoryModelBase::new();
        model.register_entity_type(&person).unwrap();
        let model: Arc<dyn ModelBase> = Arc::new(model);

        let a = store("a", &model);
        let b = store("b", &model);
        let (a_to_b, b_to_a) = LoopbackProxy::connect(&a, &b);

        let tx = a.create_transaction_now().unwrap();
        let original = a.lifecycle().create_mesh_object().unwrap();
        original.bless(&[person]).unwrap();
        tx.commit().unwrap();

        let tx = b.create_transaction_now().unwrap();
        let replica = b_to_a.obtain_replica(original.identifier()).unwrap();
        tx.commit().unwrap();

        Pair {
            a,
            b,
            a_to_b,
            b_to_a,
            original,
            replica,
            name,
        }
    }

    fn set_name(mb: &NetMeshBase, object: &NetMeshObject, name: &PropertyType, value: &str) -> MeshResult<()> {
        let tx = mb.create_transaction_now()?;
        match object.set_property_value(name, Some(value.into())) {
            Ok(_) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    fn holders(p: &Pair) -> usize {
        [&p.original, &p.replica].iter().filter(|o| o.has_lock()).count()
    }

    #[test]
    fn obtained_replica_points_home() {
        let p = pair();
        assert!(p.original.has_lock());
        assert!(p.original.extension().is_home_replica());
        assert_eq!(p.original.extension().proxies(), vec![p.b.identifier().clone()]);

        assert!(!p.replica.has_lock());
        assert!(!p.replica.extension().is_home_replica());
        assert_eq!(p.replica.extension().home_proxy(), Some(p.a.identifier().clone()));
        assert_eq!(p.replica.types().unwrap(), p.original.types().unwrap());
    }

    #[test]
    fn lock_moves_to_whoever_updates() {
        let p = pair();
        assert_eq!(holders(&p), 1);

        set_name(&p.b, &p.replica, &p.name, "from b").unwrap();
        assert!(p.replica.has_lock());
        assert!(!p.original.has_lock());
        assert_eq!(holders(&p), 1);
        assert_eq!(p.replica.extension().lock_epoch(), 1);

        set_name(&p.a, &p.original, &p.name, "from a").unwrap();
        assert!(p.original.has_lock());
        assert_eq!(holders(&p), 1);
        assert_eq!(p.original.extension().lock_epoch(), 2);

        set_name(&p.b, &p.replica, &p.name, "again").unwrap();
        assert_eq!(holders(&p), 1);
        assert_eq!(p.replica.extension().lock_epoch(), 3);
    }

    #[test]
    fn lock_events_are_delivered() {
        let p = pair();
        let seen: Arc<Mutex<Vec<Change>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        p.a.events()
            .change_listeners()
            .add(Arc::new(move |c: &Change| sink.lock().unwrap().push(c.clone())));

        set_name(&p.b, &p.replica, &p.name, "x").unwrap();
        let seen = seen.lock().unwrap();
        assert!(matches!(seen.as_slice(), [Change::LockLost { identifier }] if identifier == p.original.identifier()));
    }

    #[test]
    fn lock_travels_along_a_chain_of_replicas() {
        let p = pair();
        let c = store("c", p.a.model());
        let (_b_to_c, c_to_b) = LoopbackProxy::connect(&p.b, &c);
        let tx = c.create_transaction_now().unwrap();
        let tail = c_to_b.obtain_replica(p.original.identifier()).unwrap();
        tx.commit().unwrap();
        assert_eq!(tail.extension().lock_proxy(), Some(p.b.identifier().clone()));
        assert_eq!(p.replica.extension().lock_proxy(), Some(p.a.identifier().clone()));

        let chain = [&p.original, &p.replica, &tail];
        let holders = || chain.iter().filter(|o| o.has_lock()).count();

        set_name(&c, &tail, &p.name, "from c").unwrap();
        assert!(tail.has_lock());
        assert_eq!(holders(), 1);
        assert_eq!(tail.extension().lock_epoch(), 2);
        assert_eq!(p.original.extension().lock_proxy(), Some(p.b.identifier().clone()));
        assert_eq!(p.replica.extension().lock_proxy(), Some(c.identifier().clone()));

        set_name(&p.a, &p.original, &p.name, "from a").unwrap();
        assert!(p.original.has_lock());
        assert_eq!(holders(), 1);
        assert_eq!(p.original.extension().lock_epoch(), 4);
    }

    #[test]
    fn chain_stops_at_an_unreachable_holder() {
        let p = pair();
        let c = store("c", p.a.model());
        let (_b_to_c, c_to_b) = LoopbackProxy::connect(&p.b, &c);
        let tx = c.create_transaction_now().unwrap();
        let tail = c_to_b.obtain_replica(p.original.identifier()).unwrap();
        tx.commit().unwrap();

        p.b_to_a.set_unreachable(true);
        let err = set_name(&c, &tail, &p.name, "x").unwrap_err();
        assert!(matches!(err, MeshError::CannotObtainLock { cause: None, .. }));
        assert!(p.original.has_lock());
        assert!(!p.replica.has_lock());
        assert!(!tail.has_lock());
    }

    #[test]
    fn holder_may_refuse_to_give_up_the_lock() {
        let p = pair();
        p.original.extension().set_will_give_up_lock(false);

        let err = set_name(&p.b, &p.replica, &p.name, "x").unwrap_err();
        assert!(matches!(err, MeshError::CannotObtainLock { cause: None, .. }));
        assert!(p.original.has_lock());
        assert_eq!(holders(&p), 1);
        assert_eq!(p.replica.property_value(&p.name).unwrap(), None);
    }

    #[test]
    fn unreachable_holder_times_out() {
        let p = pair();
        p.b_to_a.set_unreachable(true);

        let err = set_name(&p.b, &p.replica, &p.name, "x").unwrap_err();
        assert!(matches!(err, MeshError::CannotObtainLock { cause: Some(_), .. }));
        assert!(err.is_retryable());
        assert_eq!(holders(&p), 1);

        p.b_to_a.set_unreachable(false);
        set_name(&p.b, &p.replica, &p.name, "x").unwrap();
        assert!(p.replica.has_lock());
    }

    #[test]
    fn refusing_store_does_not_ask() {
        let p = pair();
        p.b.extension().set_refuse_lock_requests(true);
        let err = set_name(&p.b, &p.replica, &p.name, "x").unwrap_err();
        assert!(matches!(err, MeshError::CannotObtainLock { cause: None, .. }));
        assert!(p.original.has_lock());
    }

    #[test]
    fn home_replica_reclaims_the_lock() {
        let p = pair();
        set_name(&p.b, &p.replica, &p.name, "x").unwrap();
        assert!(p.replica.has_lock());

        p.original.force_obtain_lock().unwrap();
        assert!(p.original.has_lock());
        assert!(!p.replica.has_lock());
        assert_eq!(p.replica.extension().lock_epoch(), 2);
        assert_eq!(p.replica.extension().lock_proxy(), Some(p.a.identifier().clone()));

        let err = p.replica.force_obtain_lock().unwrap_err();
        assert!(matches!(err, MeshError::CannotObtainLock { .. }));
    }

    #[test]
    fn reclaim_survives_an_unreachable_holder() {
        let p = pair();
        set_name(&p.b, &p.replica, &p.name, "x").unwrap();
        p.a_to_b.set_unreachable(true);

        p.original.force_obtain_lock().unwrap();
        assert!(p.original.has_lock());
        // The replica has not heard of the reclaim yet.
        assert!(p.replica.has_lock());

        p.a_to_b.set_unreachable(false);
        let epoch = p.original.extension().lock_epoch();
        assert!(p.replica.lock_reclaimed(p.a.identifier(), epoch));
        assert_eq!(holders(&p), 1);
    }

    #[test]
    fn stale_grants_are_ignored() {
        let p = pair();
        set_name(&p.b, &p.replica, &p.name, "x").unwrap();
        p.original.force_obtain_lock().unwrap();

        assert!(!p.replica.push_lock(p.a.identifier(), 1));
        assert!(!p.replica.has_lock());
        assert!(!p.replica.lock_reclaimed(p.a.identifier(), 1));
        assert_eq!(holders(&p), 1);
    }

    #[test]
    fn dead_partner_is_unreachable() {
        let p = pair();
        p.a.die(false);
        let err = p.b_to_a.try_to_obtain_locks(&[p.replica.as_ref()], Duration::from_millis(5)).unwrap_err();
        assert_eq!(&err.partner, p.a.identifier());
        assert!(p.b.extension().proxy(p.a.identifier()).is_some());
    }
}
