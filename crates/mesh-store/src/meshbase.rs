//! MeshBase: the store and its transaction gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread;
use std::time::Duration;

use mesh_types::{
    InMemoryModelBase, MeshBaseIdentifier, MeshObjectIdentifier, ModelBase, Timestamps,
};
use tracing::{debug, info, warn};

use crate::access::{AccessManager, AccessRequest, Operation};
use crate::change::Change;
use crate::config::MeshBaseConfig;
use crate::error::{MeshError, MeshResult, ObjectsNotFound};
use crate::extension::{Local, ObjectExtension, StoreExtension};
use crate::lifecycle::LifecycleManager;
use crate::listener::EventBus;
use crate::object::MeshObject;
use crate::transaction::{Transaction, TransactionHost, TransactionState};

/// Builder for [`MeshBase`].
pub struct MeshBaseBuilder {
    identifier: MeshBaseIdentifier,
    config: MeshBaseConfig,
    model: Option<Arc<dyn ModelBase>>,
    access_manager: Option<Arc<dyn AccessManager>>,
}

impl MeshBaseBuilder {
    pub fn config(mut self, config: MeshBaseConfig) -> Self {
        self.config = config;
        self
    }

    /// The model used to resolve type identifiers of externalized objects.
    pub fn model(mut self, model: Arc<dyn ModelBase>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn access_manager(mut self, access_manager: Arc<dyn AccessManager>) -> Self {
        self.access_manager = Some(access_manager);
        self
    }

    /// Build a store whose objects are not replicated.
    pub fn build(self) -> Arc<MeshBase<Local>> {
        self.build_with(())
    }

    /// Build a store whose objects carry the extension `E`.
    pub fn build_with<E: ObjectExtension>(self, extension: E::Store) -> Arc<MeshBase<E>> {
        let base = Arc::new_cyclic(|me: &Weak<MeshBase<E>>| {
            let scope = E::SCOPED_IDENTIFIERS.then(|| self.identifier.clone());
            let home = Arc::new(MeshObject::new(
                MeshObjectIdentifier::home(scope),
                me.clone(),
                Timestamps::now(),
                &[],
                E::create(&extension),
            ));
            let mut cache = HashMap::new();
            cache.insert(home.identifier().clone(), Arc::clone(&home));
            MeshBase {
                identifier: self.identifier,
                me: me.clone(),
                config: self.config,
                model: self
                    .model
                    .unwrap_or_else(|| Arc::new(InMemoryModelBase::new())),
                access_manager: self.access_manager,
                cache: RwLock::new(cache),
                transaction: Mutex::new(None),
                deleted: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                alive: AtomicBool::new(true),
                home,
                extension,
            }
        });
        info!(store = %base.identifier, "store created");
        base
    }
}

/// A store of MeshObjects.
///
/// All mutations go through the single active transaction of the store,
/// which only the thread that created it may use. Lookups never block on
/// the transaction and are safe from any thread.
pub struct MeshBase<E: ObjectExtension = Local> {
    identifier: MeshBaseIdentifier,
    me: Weak<Self>,
    config: MeshBaseConfig,
    model: Arc<dyn ModelBase>,
    access_manager: Option<Arc<dyn AccessManager>>,
    cache: RwLock<HashMap<MeshObjectIdentifier, Arc<MeshObject<E>>>>,
    transaction: Mutex<Option<Arc<Transaction>>>,
    /// Objects deleted under the active transaction, kept for rollback.
    deleted: Mutex<HashMap<MeshObjectIdentifier, Arc<MeshObject<E>>>>,
    events: EventBus,
    alive: AtomicBool,
    home: Arc<MeshObject<E>>,
    extension: E::Store,
}

impl MeshBase<Local> {
    pub fn builder(identifier: MeshBaseIdentifier) -> MeshBaseBuilder {
        MeshBaseBuilder {
            identifier,
            config: MeshBaseConfig::default(),
            model: None,
            access_manager: None,
        }
    }
}

impl<E: ObjectExtension> MeshBase<E> {
    pub fn identifier(&self) -> &MeshBaseIdentifier {
        &self.identifier
    }

    pub fn config(&self) -> &MeshBaseConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<dyn ModelBase> {
        &self.model
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Store-wide state of the object extension.
    pub fn extension(&self) -> &E::Store {
        &self.extension
    }

    pub fn home_object(&self) -> Arc<MeshObject<E>> {
        Arc::clone(&self.home)
    }

    pub fn lifecycle(&self) -> LifecycleManager<'_, E> {
        LifecycleManager::new(self)
    }

    pub fn is_dead(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_alive(&self) -> MeshResult<()> {
        if self.is_dead() {
            return Err(MeshError::MeshBaseDead(self.identifier.clone()));
        }
        Ok(())
    }

    pub(crate) fn me(&self) -> Weak<Self> {
        self.me.clone()
    }

    // -- cache -----------------------------------------------------------------

    fn cache(&self) -> RwLockReadGuard<'_, HashMap<MeshObjectIdentifier, Arc<MeshObject<E>>>> {
        self.cache.read().expect("lock poisoned")
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, HashMap<MeshObjectIdentifier, Arc<MeshObject<E>>>> {
        self.cache.write().expect("lock poisoned")
    }

    /// Number of objects in the store, the home object included.
    pub fn size(&self) -> usize {
        self.cache().len()
    }

    pub fn identifiers(&self) -> Vec<MeshObjectIdentifier> {
        self.cache().keys().cloned().collect()
    }

    pub fn objects(&self) -> Vec<Arc<MeshObject<E>>> {
        self.cache().values().cloned().collect()
    }

    pub fn find_by_identifier(&self, identifier: &MeshObjectIdentifier) -> Option<Arc<MeshObject<E>>> {
        self.cache().get(identifier).cloned()
    }

    /// Look up several objects at once; misses are `None`.
    pub fn find_by_identifiers(
        &self,
        identifiers: &[MeshObjectIdentifier],
    ) -> Vec<Option<Arc<MeshObject<E>>>> {
        let cache = self.cache();
        identifiers.iter().map(|id| cache.get(id).cloned()).collect()
    }

    /// Look up several objects, failing if any is missing. The error keeps
    /// whatever was found.
    pub fn find_by_identifiers_or_fail(
        &self,
        identifiers: &[MeshObjectIdentifier],
    ) -> Result<Vec<Arc<MeshObject<E>>>, ObjectsNotFound<Arc<MeshObject<E>>>> {
        let found = self.find_by_identifiers(identifiers);
        let missing: Vec<MeshObjectIdentifier> = identifiers
            .iter()
            .zip(&found)
            .filter(|(_, f)| f.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if missing.is_empty() {
            Ok(found.into_iter().flatten().collect())
        } else {
            Err(ObjectsNotFound { found, missing })
        }
    }

    pub(crate) fn insert(&self, object: Arc<MeshObject<E>>) -> MeshResult<()> {
        let mut cache = self.cache_mut();
        if cache.contains_key(object.identifier()) {
            return Err(MeshError::IdentifierNotUnique(object.identifier().clone()));
        }
        cache.insert(object.identifier().clone(), object);
        Ok(())
    }

    /// Remove a deleted object from the cache, keeping it for a rollback.
    pub(crate) fn forget(&self, identifier: &MeshObjectIdentifier) {
        if let Some(object) = self.cache_mut().remove(identifier) {
            self.deleted
                .lock()
                .expect("lock poisoned")
                .insert(identifier.clone(), object);
        }
    }

    // -- permissions -------------------------------------------------------------

    /// Ask the access manager. A store without one permits everything.
    pub fn is_permitted(
        &self,
        subject: &MeshObjectIdentifier,
        operation: Operation,
        other: Option<&MeshObjectIdentifier>,
    ) -> bool {
        self.access_manager.as_ref().map_or(true, |am| {
            am.is_permitted(&AccessRequest {
                subject,
                operation,
                other,
            })
        })
    }

    /// Permission checks of a master operation on `object`.
    pub(crate) fn check_permission(
        &self,
        object: &MeshObject<E>,
        operation: Operation,
        other: Option<&MeshObjectIdentifier>,
    ) -> MeshResult<()> {
        if !self.is_permitted(object.identifier(), operation, other) {
            return Err(MeshError::NotPermitted {
                object: object.identifier().clone(),
                operation,
            });
        }
        if operation.requires_update_lock() {
            E::check_update_permission(object, operation)?;
        }
        Ok(())
    }

    // -- transactions --------------------------------------------------------------

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Transaction>>> {
        self.transaction.lock().expect("lock poisoned")
    }

    /// The active transaction, whichever thread owns it.
    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.slot().clone()
    }

    fn owned_transaction(&self) -> Option<Arc<Transaction>> {
        self.current_transaction()
            .filter(|tx| tx.is_owned_by_current_thread())
    }

    /// Start a transaction, failing at once if one is active.
    pub fn create_transaction_now(&self) -> MeshResult<Arc<Transaction>> {
        self.ensure_alive()?;
        let tx = {
            let mut slot = self.slot();
            if let Some(active) = slot.as_ref() {
                return Err(MeshError::TransactionActiveAlready {
                    blocking: Arc::clone(active),
                });
            }
            let host: Weak<dyn TransactionHost> = self.me.clone();
            let tx = Arc::new(Transaction::new(self.identifier.clone(), host));
            *slot = Some(Arc::clone(&tx));
            tx
        };
        debug!(store = %self.identifier, tx = %tx.id(), "transaction started");
        self.events.transaction_started(&tx);
        Ok(tx)
    }

    /// Start a transaction, waiting for an active one to finish for up to the
    /// configured number of attempts.
    pub fn create_transaction_asap(&self) -> MeshResult<Arc<Transaction>> {
        self.create_transaction_polling(self.config.asap_attempts, self.config.asap_interval())
    }

    /// Like [`create_transaction_asap`](Self::create_transaction_asap), giving
    /// up after roughly `timeout`.
    pub fn create_transaction_asap_within(&self, timeout: Duration) -> MeshResult<Arc<Transaction>> {
        let interval = self.config.asap_interval();
        let attempts = timeout.as_millis() / interval.as_millis().max(1) + 1;
        self.create_transaction_polling(u32::try_from(attempts).unwrap_or(u32::MAX), interval)
    }

    fn create_transaction_polling(&self, attempts: u32, interval: Duration) -> MeshResult<Arc<Transaction>> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.create_transaction_now() {
                Err(MeshError::TransactionActiveAlready { blocking }) => {
                    // Waiting on a transaction of our own thread cannot succeed.
                    if blocking.is_owned_by_current_thread() {
                        return Err(MeshError::TransactionActiveAlready { blocking });
                    }
                    attempt += 1;
                    if attempt >= attempts {
                        debug!(store = %self.identifier, blocking = %blocking.id(), attempts, "asap transaction timed out");
                        return Err(MeshError::TransactionAsapTimeout { blocking, attempts });
                    }
                    thread::sleep(interval);
                }
                other => return other,
            }
        }
    }

    /// `None` if the calling thread owns the active transaction already,
    /// otherwise as [`create_transaction_now`](Self::create_transaction_now).
    pub fn create_transaction_now_if_needed(&self) -> MeshResult<Option<Arc<Transaction>>> {
        if self.owned_transaction().is_some() {
            return Ok(None);
        }
        self.create_transaction_now().map(Some)
    }

    /// `None` if the calling thread owns the active transaction already,
    /// otherwise as [`create_transaction_asap`](Self::create_transaction_asap).
    pub fn create_transaction_asap_if_needed(&self) -> MeshResult<Option<Arc<Transaction>>> {
        if self.owned_transaction().is_some() {
            return Ok(None);
        }
        self.create_transaction_asap().map(Some)
    }

    /// The active transaction, if the calling thread may use it.
    pub fn check_transaction(&self) -> MeshResult<Arc<Transaction>> {
        let tx = self
            .current_transaction()
            .ok_or(MeshError::NotWithinTransactionBoundaries)?;
        let caller = thread::current().id();
        if tx.owner() != caller {
            return Err(MeshError::IllegalTransactionThread {
                owner: tx.owner(),
                caller,
                transaction: tx,
            });
        }
        Ok(tx)
    }

    fn check_finishing(&self, tx: &Arc<Transaction>) -> MeshResult<()> {
        tx.ensure_active()?;
        let caller = thread::current().id();
        if tx.owner() != caller {
            return Err(MeshError::IllegalTransactionThread {
                transaction: Arc::clone(tx),
                owner: tx.owner(),
                caller,
            });
        }
        match self.slot().as_ref() {
            Some(current) if Arc::ptr_eq(current, tx) => Ok(()),
            _ => Err(MeshError::Internal(format!(
                "{} is not the active transaction of {}",
                tx.id(),
                self.identifier
            ))),
        }
    }

    fn release(&self, tx: &Arc<Transaction>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, tx)) {
            *slot = None;
        }
        self.deleted.lock().expect("lock poisoned").clear();
    }

    /// Undo `changes`, newest first. Nothing is recorded.
    fn undo(&self, changes: &[Change]) {
        for change in changes.iter().rev().filter(|c| c.is_reversible()) {
            match change {
                Change::Created { identifier, .. } => {
                    if let Some(object) = self.cache_mut().remove(identifier) {
                        object.sever();
                    }
                }
                Change::Deleted {
                    identifier,
                    snapshot,
                } => {
                    let buried = self.deleted.lock().expect("lock poisoned").remove(identifier);
                    let object = match buried {
                        Some(object) => {
                            object.revive(self.me.clone());
                            object
                        }
                        None => Arc::new(MeshObject::restored(
                            snapshot,
                            self.me.clone(),
                            E::restore(&self.extension, snapshot.replication.as_ref()),
                        )),
                    };
                    self.cache_mut().insert(identifier.clone(), object);
                }
                other => match self.find_by_identifier(other.identifier()) {
                    Some(object) => object.revert(other),
                    None => warn!(
                        store = %self.identifier,
                        object = %other.identifier(),
                        "cannot undo change to missing object"
                    ),
                },
            }
        }
    }

    /// Record `change` into the calling thread's transaction, or deliver it
    /// to listeners right away if there is none.
    pub fn notify_change(&self, change: Change) {
        match self.owned_transaction() {
            Some(tx) => tx.record(change),
            None => self.events.deliver(&change),
        }
    }

    // -- shutdown --------------------------------------------------------------------

    /// Shut the store down.
    ///
    /// Waits a bounded time for a transaction of another thread to finish,
    /// then proceeds regardless. Afterwards every mutation fails with
    /// [`MeshError::MeshBaseDead`].
    pub fn die(&self, permanent: bool) {
        for _ in 0..self.config.die_attempts {
            match self.current_transaction() {
                Some(tx) if !tx.is_owned_by_current_thread() => {
                    thread::sleep(self.config.die_interval())
                }
                _ => break,
            }
        }
        if let Some(tx) = self.current_transaction() {
            warn!(store = %self.identifier, tx = %tx.id(), "dying with an unfinished transaction");
        }
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.extension.die(permanent);
        self.events.clear();
        info!(store = %self.identifier, permanent, "store died");
    }
}

impl<E: ObjectExtension> TransactionHost for MeshBase<E> {
    fn commit_transaction(&self, tx: &Arc<Transaction>) -> MeshResult<()> {
        self.check_finishing(tx)?;
        tx.finish(TransactionState::Committed)?;
        self.release(tx);
        debug!(store = %self.identifier, tx = %tx.id(), changes = tx.change_count(), "transaction committed");
        self.events.transaction_committed(tx);
        Ok(())
    }

    fn rollback_transaction(&self, tx: &Arc<Transaction>) -> MeshResult<()> {
        self.check_finishing(tx)?;
        self.undo(&tx.changes());
        tx.finish(TransactionState::RolledBack)?;
        self.release(tx);
        debug!(store = %self.identifier, tx = %tx.id(), "transaction rolled back");
        self.events.transaction_rolled_back(tx);
        Ok(())
    }
}

impl<E: ObjectExtension> std::fmt::Debug for MeshBase<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshBase")
            .field("identifier", &self.identifier)
            .field("size", &self.size())
            .field("dead", &self.is_dead())
            .finish()
    }
}
