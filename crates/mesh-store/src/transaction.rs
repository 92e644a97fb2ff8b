//! Transactions: the unit of work of a store.
//!
//! A transaction is created by its store, belongs to the thread that created
//! it, and captures every change made under it. It finishes exactly once,
//! by commit or by rollback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use mesh_types::MeshBaseIdentifier;

use crate::change::Change;
use crate::error::{MeshError, MeshResult};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// The store side of finishing a transaction.
pub(crate) trait TransactionHost: Send + Sync {
    fn commit_transaction(&self, tx: &Arc<Transaction>) -> MeshResult<()>;

    fn rollback_transaction(&self, tx: &Arc<Transaction>) -> MeshResult<()>;
}

pub struct Transaction {
    id: TransactionId,
    store: MeshBaseIdentifier,
    owner: ThreadId,
    state: Mutex<TransactionState>,
    changes: Mutex<Vec<Change>>,
    host: Weak<dyn TransactionHost>,
}

impl Transaction {
    pub(crate) fn new(store: MeshBaseIdentifier, host: Weak<dyn TransactionHost>) -> Self {
        Self {
            id: TransactionId::next(),
            store,
            owner: thread::current().id(),
            state: Mutex::new(TransactionState::Active),
            changes: Mutex::new(Vec::new()),
            host,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The store this transaction belongs to.
    pub fn store(&self) -> &MeshBaseIdentifier {
        &self.store
    }

    /// The thread that created this transaction and alone may use it.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().expect("lock poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The changes captured so far, in the order they happened.
    pub fn changes(&self) -> Vec<Change> {
        self.changes.lock().expect("lock poisoned").clone()
    }

    pub fn change_count(&self) -> usize {
        self.changes.lock().expect("lock poisoned").len()
    }

    pub(crate) fn record(&self, change: Change) {
        self.changes.lock().expect("lock poisoned").push(change);
    }

    /// Move from `Active` to `to`. Fails if the transaction has finished.
    pub(crate) fn finish(&self, to: TransactionState) -> MeshResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if *state != TransactionState::Active {
            return Err(MeshError::TransactionNotActive {
                id: self.id,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Fails with `TransactionNotActive` if already finished.
    pub(crate) fn ensure_active(&self) -> MeshResult<()> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(MeshError::TransactionNotActive { id: self.id, state });
        }
        Ok(())
    }

    fn host(&self) -> MeshResult<Arc<dyn TransactionHost>> {
        self.host
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseDead(self.store.clone()))
    }

    /// Commit, delivering the captured changes to the store's listeners.
    pub fn commit(self: &Arc<Self>) -> MeshResult<()> {
        self.host()?.commit_transaction(self)
    }

    /// Roll back, undoing the captured changes in reverse order.
    pub fn rollback(self: &Arc<Self>) -> MeshResult<()> {
        self.host()?.rollback_transaction(self)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("changes", &self.change_count())
            .finish()
    }
}
