//! Store-wide replication state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use mesh_store::StoreExtension;
use mesh_types::MeshBaseIdentifier;
use tracing::{debug, info};

use crate::config::ReplicationConfig;
use crate::proxy::Proxy;

/// The proxies of a networked store and its replication policy.
pub struct ReplicationContext {
    config: ReplicationConfig,
    proxies: RwLock<HashMap<MeshBaseIdentifier, Arc<dyn Proxy>>>,
    refuse_lock_requests: AtomicBool,
}

impl ReplicationContext {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            proxies: RwLock::new(HashMap::new()),
            refuse_lock_requests: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Register the proxy towards its partner, replacing any earlier one.
    pub fn register_proxy(&self, proxy: Arc<dyn Proxy>) {
        let partner = proxy.partner_identifier().clone();
        debug!(%partner, "proxy registered");
        self.proxies
            .write()
            .expect("proxy lock poisoned")
            .insert(partner, proxy);
    }

    pub fn unregister_proxy(&self, partner: &MeshBaseIdentifier) -> Option<Arc<dyn Proxy>> {
        self.proxies
            .write()
            .expect("proxy lock poisoned")
            .remove(partner)
    }

    pub fn proxy(&self, partner: &MeshBaseIdentifier) -> Option<Arc<dyn Proxy>> {
        self.proxies
            .read()
            .expect("proxy lock poisoned")
            .get(partner)
            .cloned()
    }

    pub fn partners(&self) -> Vec<MeshBaseIdentifier> {
        self.proxies
            .read()
            .expect("proxy lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// While set, no replica of this store asks a peer for a lock.
    pub fn set_refuse_lock_requests(&self, refuse: bool) {
        self.refuse_lock_requests.store(refuse, Ordering::Release);
    }

    pub fn refuses_lock_requests(&self) -> bool {
        self.refuse_lock_requests.load(Ordering::Acquire)
    }
}

impl StoreExtension for ReplicationContext {
    fn die(&self, permanent: bool) {
        let mut proxies = self.proxies.write().expect("proxy lock poisoned");
        info!(proxies = proxies.len(), permanent, "dropping proxies");
        proxies.clear();
    }
}

impl std::fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("config", &self.config)
            .field("partners", &self.partners())
            .field("refuse_lock_requests", &self.refuses_lock_requests())
            .finish()
    }
}
