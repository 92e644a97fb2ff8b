//! Sweeping: deleting objects a policy no longer wants in the store.

use mesh_types::{now_millis, MeshObjectIdentifier, Timestamps};
use tracing::{debug, warn};

use crate::error::MeshResult;
use crate::extension::ObjectExtension;
use crate::meshbase::MeshBase;
use crate::object::ApplyMode;

/// Decides which objects a sweep deletes.
pub trait SweepPolicy: Send + Sync {
    fn should_be_swept(&self, identifier: &MeshObjectIdentifier, timestamps: &Timestamps) -> bool;
}

/// Sweeps objects whose expiry time has passed.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpirySweepPolicy {
    at: Option<i64>,
}

impl ExpirySweepPolicy {
    /// Compares against the wall clock at the time of the sweep.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares against a fixed point in time, in milliseconds.
    pub fn at(millis: i64) -> Self {
        Self { at: Some(millis) }
    }
}

impl SweepPolicy for ExpirySweepPolicy {
    fn should_be_swept(&self, _identifier: &MeshObjectIdentifier, timestamps: &Timestamps) -> bool {
        timestamps.is_expired_at(self.at.unwrap_or_else(now_millis))
    }
}

impl<E: ObjectExtension> MeshBase<E> {
    /// Delete every object `policy` selects, except the home object.
    ///
    /// Runs in the calling thread's transaction if there is one, otherwise in
    /// a transaction of its own. An object that cannot be deleted is logged
    /// and skipped. Returns how many objects were deleted.
    pub fn sweep(&self, policy: &dyn SweepPolicy) -> MeshResult<usize> {
        self.ensure_alive()?;
        let created = self.create_transaction_asap_if_needed()?;

        let mut swept = 0;
        for object in self.objects() {
            if object.is_home_object()
                || !policy.should_be_swept(object.identifier(), &object.timestamps())
            {
                continue;
            }
            match object.delete_with(ApplyMode::Master) {
                Ok(outcome) if outcome.is_applied() => swept += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    store = %self.identifier(),
                    object = %object.identifier(),
                    error = %e,
                    "cannot sweep object"
                ),
            }
        }

        if let Some(tx) = created {
            tx.commit()?;
        }
        debug!(store = %self.identifier(), swept, "sweep done");
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRequest, Operation};
    use mesh_types::MeshBaseIdentifier;
    use std::sync::Arc;

    fn expiring(expires: i64) -> Option<Timestamps> {
        Some(Timestamps {
            expires,
            ..Timestamps::at(1_000)
        })
    }

    #[test]
    fn expiry_policy() {
        let id = MeshObjectIdentifier::new("x").unwrap();
        let policy = ExpirySweepPolicy::at(5_000);
        assert!(policy.should_be_swept(&id, &expiring(4_000).unwrap()));
        assert!(!policy.should_be_swept(&id, &expiring(6_000).unwrap()));
        assert!(!policy.should_be_swept(&id, &Timestamps::at(0)));
    }

    #[test]
    fn sweeps_expired_objects_in_own_transaction() {
        let mb = MeshBase::builder(MeshBaseIdentifier::parse("sweep").unwrap()).build();
        let tx = mb.create_transaction_now().unwrap();
        let old = mb
            .lifecycle()
            .create_mesh_object_with(None, &[], expiring(2_000))
            .unwrap();
        let young = mb
            .lifecycle()
            .create_mesh_object_with(None, &[], expiring(9_000))
            .unwrap();
        old.relate(&young).unwrap();
        tx.commit().unwrap();

        assert_eq!(mb.sweep(&ExpirySweepPolicy::at(5_000)).unwrap(), 1);
        assert!(mb.current_transaction().is_none());
        assert!(old.is_dead());
        assert!(!young.is_related_to(old.identifier()));
        assert_eq!(mb.size(), 2);
    }

    #[test]
    fn home_object_is_never_swept() {
        struct Everything;
        impl SweepPolicy for Everything {
            fn should_be_swept(&self, _: &MeshObjectIdentifier, _: &Timestamps) -> bool {
                true
            }
        }
        let mb = MeshBase::builder(MeshBaseIdentifier::parse("sweep").unwrap()).build();
        let tx = mb.create_transaction_now().unwrap();
        mb.lifecycle().create_mesh_object().unwrap();
        assert_eq!(mb.sweep(&Everything).unwrap(), 1);
        assert!(tx.is_active());
        tx.commit().unwrap();
        assert_eq!(mb.size(), 1);
    }

    #[test]
    fn denied_deletions_are_skipped() {
        let mb = MeshBase::builder(MeshBaseIdentifier::parse("sweep").unwrap())
            .access_manager(Arc::new(|r: &AccessRequest<'_>| r.operation != Operation::Delete))
            .build();
        let tx = mb.create_transaction_now().unwrap();
        let obj = mb
            .lifecycle()
            .create_mesh_object_with(None, &[], expiring(2_000))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(mb.sweep(&ExpirySweepPolicy::new()).unwrap(), 0);
        assert!(!obj.is_dead());
    }
}
