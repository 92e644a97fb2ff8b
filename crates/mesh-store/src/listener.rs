//! Listener sets and the per-store event bus.
//!
//! Listener sets are copy-on-read: firing takes a snapshot of the current
//! listeners and releases the lock before calling any of them, so listeners
//! may add or remove listeners (including themselves) while being notified.

use std::sync::{Arc, RwLock};

use mesh_types::MeshObjectIdentifier;
use tracing::debug;

use crate::change::Change;
use crate::transaction::Transaction;

/// Notified when transactions on a store start and finish.
pub trait TransactionListener: Send + Sync {
    fn transaction_started(&self, _tx: &Transaction) {}

    fn transaction_committed(&self, _tx: &Transaction) {}

    fn transaction_rolled_back(&self, _tx: &Transaction) {}
}

/// Notified of every committed change, in commit order.
pub trait ChangeListener: Send + Sync {
    fn change_occurred(&self, change: &Change);
}

impl<F> ChangeListener for F
where
    F: Fn(&Change) + Send + Sync,
{
    fn change_occurred(&self, change: &Change) {
        self(change)
    }
}

/// Notified when MeshObjects are created or deleted.
pub trait LifecycleListener: Send + Sync {
    fn object_created(&self, _identifier: &MeshObjectIdentifier) {}

    fn object_deleted(&self, _identifier: &MeshObjectIdentifier) {}
}

/// A set of listeners that may change while events are being delivered.
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Remove a listener by identity. Returns `true` if it was present.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().expect("listener lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .clear();
    }

    /// The listeners registered right now.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().expect("listener lock poisoned").clone()
    }

    /// Call `f` on every listener registered at the time of the call.
    pub fn fire(&self, f: impl Fn(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// All listener sets of one store. Created with the store, cleared when the
/// store dies.
#[derive(Default)]
pub struct EventBus {
    transaction: ListenerSet<dyn TransactionListener>,
    change: ListenerSet<dyn ChangeListener>,
    lifecycle: ListenerSet<dyn LifecycleListener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_listeners(&self) -> &ListenerSet<dyn TransactionListener> {
        &self.transaction
    }

    pub fn change_listeners(&self) -> &ListenerSet<dyn ChangeListener> {
        &self.change
    }

    pub fn lifecycle_listeners(&self) -> &ListenerSet<dyn LifecycleListener> {
        &self.lifecycle
    }

    pub(crate) fn transaction_started(&self, tx: &Transaction) {
        self.transaction.fire(|l| l.transaction_started(tx));
    }

    /// Deliver the changes of a committed transaction, then announce the
    /// commit itself.
    pub(crate) fn transaction_committed(&self, tx: &Transaction) {
        let changes = tx.changes();
        debug!(tx = %tx.id(), changes = changes.len(), "delivering committed changes");
        for change in &changes {
            self.deliver(change);
        }
        self.transaction.fire(|l| l.transaction_committed(tx));
    }

    pub(crate) fn transaction_rolled_back(&self, tx: &Transaction) {
        self.transaction.fire(|l| l.transaction_rolled_back(tx));
    }

    /// Deliver a single change to change and lifecycle listeners.
    pub(crate) fn deliver(&self, change: &Change) {
        self.change.fire(|l| l.change_occurred(change));
        match change {
            Change::Created { identifier, .. } => {
                self.lifecycle.fire(|l| l.object_created(identifier));
            }
            Change::Deleted { identifier, .. } => {
                self.lifecycle.fire(|l| l.object_deleted(identifier));
            }
            _ => {}
        }
    }

    pub(crate) fn clear(&self) {
        self.transaction.clear();
        self.change.clear();
        self.lifecycle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Counter(AtomicUsize);

    impl ChangeListener for Counter {
        fn change_occurred(&self, _change: &Change) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lock_lost() -> Change {
        Change::LockLost {
            identifier: MeshObjectIdentifier::new("x").unwrap(),
        }
    }

    #[test]
    fn add_fire_remove() {
        let set: ListenerSet<dyn ChangeListener> = ListenerSet::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let as_listener: Arc<dyn ChangeListener> = counter.clone();
        set.add(as_listener.clone());
        set.fire(|l| l.change_occurred(&lock_lost()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(set.remove(&as_listener));
        assert!(!set.remove(&as_listener));
        set.fire(|l| l.change_occurred(&lock_lost()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn listener_can_modify_set_while_firing() {
        let set: Arc<ListenerSet<dyn ChangeListener>> = Arc::new(ListenerSet::new());
        let inner = Arc::clone(&set);
        let adder: Arc<dyn ChangeListener> = Arc::new(move |_: &Change| {
            inner.add(Arc::new(|_: &Change| {}));
        });
        set.add(adder);
        set.fire(|l| l.change_occurred(&lock_lost()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn lifecycle_listeners_see_deletions() {
        #[derive(Default)]
        struct Seen(Mutex<Vec<String>>);
        impl LifecycleListener for Seen {
            fn object_deleted(&self, identifier: &MeshObjectIdentifier) {
                self.0.lock().unwrap().push(identifier.to_string());
            }
        }

        let bus = EventBus::new();
        let seen = Arc::new(Seen::default());
        bus.lifecycle_listeners().add(seen.clone());
        let snapshot = crate::externalized::MeshObjectSnapshot::empty(
            MeshObjectIdentifier::new("gone").unwrap(),
        );
        bus.deliver(&Change::Deleted {
            identifier: snapshot.identifier.clone(),
            snapshot: Box::new(snapshot),
        });
        assert_eq!(*seen.0.lock().unwrap(), vec!["gone".to_string()]);
    }
}
