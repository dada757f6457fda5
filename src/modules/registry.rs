//! Reference-counted pool/container connection registry.
//!
//! The registry is the only cross-thread mutable state in the daemon. Pools
//! and the containers opened inside them live in a shared table keyed by
//! UUID; entries are created on first connect, retained on every further
//! lookup or open, and removed when the last reference drops. Handles are
//! RAII: [`PoolConnection`] and [`ContainerHandle`] release on drop, so
//! every exit path releases exactly once.
//!
//! No table lock is ever held across a blocking storage call: connects and
//! opens run unlocked, with a re-check on insert for the racing case.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use super::error::StorageError;
use super::storage::StorageClient;

/// Operation table a container handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsKind {
    /// The table serving a single pool's container.
    SinglePool,
    /// The table exposing every reachable pool, used when the pool
    /// identifier is the nil sentinel.
    MultiPool,
}

struct ContainerEntry {
    refs: usize,
    label: Option<String>,
}

struct PoolEntry {
    refs: usize,
    label: Option<String>,
    containers: HashMap<Uuid, ContainerEntry>,
}

struct Inner {
    store: Arc<dyn StorageClient>,
    pools: Mutex<HashMap<Uuid, PoolEntry>>,
}

/// Shared pool/container connection table.
pub struct Registry {
    inner: Arc<Inner>,
}

/// A counted reference to a connected pool. Dropping it releases the
/// reference; the pool disconnects when the last reference drops.
pub struct PoolConnection {
    inner: Arc<Inner>,
    id: Uuid,
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection").field("id", &self.id).finish()
    }
}

/// A counted reference to an open container. The handle retains its pool,
/// so the pool outlives every container opened inside it.
pub struct ContainerHandle {
    pool: PoolConnection,
    id: Uuid,
    ops: OpsKind,
}

impl Registry {
    /// Creates an empty registry over a storage client.
    pub fn new(store: Arc<dyn StorageClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connects to a pool by UUID. The returned handle holds one reference.
    ///
    /// The nil UUID is the all-pools sentinel: it gets a table entry but no
    /// storage connection.
    pub fn pool_connect(&self, id: Uuid) -> Result<PoolConnection, StorageError> {
        self.connect_entry(id, None)
    }

    /// Connects to a pool by label, resolving it through the storage layer.
    pub fn pool_connect_by_label(&self, label: &str) -> Result<PoolConnection, StorageError> {
        let id = self.inner.store.pool_connect_by_label(label)?;
        debug!("Pool {:?} resolved to {}", label, id);
        self.connect_entry(id, Some(label.to_string()))
    }

    fn connect_entry(
        &self,
        id: Uuid,
        label: Option<String>,
    ) -> Result<PoolConnection, StorageError> {
        {
            let mut pools = self.inner.pools.lock();
            if let Some(entry) = pools.get_mut(&id) {
                entry.refs += 1;
                drop(pools);
                // A label connect already opened a storage connection; the
                // existing entry holds one, so release the duplicate.
                if label.is_some() && !id.is_nil() {
                    self.inner.store.pool_disconnect(id);
                }
                return Ok(PoolConnection {
                    inner: self.inner.clone(),
                    id,
                });
            }
        }

        // First connect for this pool; talk to the store without the lock.
        // A label connect has already happened inside the store.
        if !id.is_nil() && label.is_none() {
            self.inner.store.pool_connect(id)?;
        }

        let mut pools = self.inner.pools.lock();
        match pools.get_mut(&id) {
            Some(entry) => {
                // Raced with another connect; keep the existing entry.
                entry.refs += 1;
                drop(pools);
                if !id.is_nil() {
                    self.inner.store.pool_disconnect(id);
                }
            }
            None => {
                pools.insert(
                    id,
                    PoolEntry {
                        refs: 1,
                        label,
                        containers: HashMap::new(),
                    },
                );
            }
        }
        Ok(PoolConnection {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Opens a container by UUID inside a connected pool. The handle
    /// implicitly retains the pool.
    pub fn container_open(
        &self,
        pool: &PoolConnection,
        id: Uuid,
    ) -> Result<ContainerHandle, StorageError> {
        self.open_entry(pool, id, None)
    }

    /// Opens a container by label inside a connected pool.
    pub fn container_open_by_label(
        &self,
        pool: &PoolConnection,
        label: &str,
    ) -> Result<ContainerHandle, StorageError> {
        let id = self.inner.store.container_open_by_label(pool.id, label)?;
        debug!("Container {:?} resolved to {}", label, id);
        self.open_entry(pool, id, Some(label.to_string()))
    }

    fn open_entry(
        &self,
        pool: &PoolConnection,
        id: Uuid,
        label: Option<String>,
    ) -> Result<ContainerHandle, StorageError> {
        let ops = if pool.id.is_nil() {
            OpsKind::MultiPool
        } else {
            OpsKind::SinglePool
        };

        {
            let mut pools = self.inner.pools.lock();
            let entry = pools
                .get_mut(&pool.id)
                .expect("open against a released pool");
            if let Some(container) = entry.containers.get_mut(&id) {
                container.refs += 1;
                drop(pools);
                if label.is_some() && !pool.id.is_nil() {
                    self.inner.store.container_close(pool.id, id);
                }
                return Ok(ContainerHandle {
                    pool: pool.clone(),
                    id,
                    ops,
                });
            }
        }

        if !pool.id.is_nil() && !id.is_nil() && label.is_none() {
            self.inner.store.container_open(pool.id, id)?;
        }

        let mut pools = self.inner.pools.lock();
        let entry = pools
            .get_mut(&pool.id)
            .expect("open against a released pool");
        match entry.containers.get_mut(&id) {
            Some(container) => {
                container.refs += 1;
                drop(pools);
                if !pool.id.is_nil() && !id.is_nil() {
                    self.inner.store.container_close(pool.id, id);
                }
            }
            None => {
                entry.containers.insert(id, ContainerEntry { refs: 1, label });
                // Released before the handle clones the pool reference,
                // which takes this lock again.
                drop(pools);
            }
        }
        Ok(ContainerHandle {
            pool: pool.clone(),
            id,
            ops,
        })
    }

    /// Current reference count of a pool entry, if present.
    pub fn pool_refs(&self, id: Uuid) -> Option<usize> {
        self.inner.pools.lock().get(&id).map(|entry| entry.refs)
    }

    /// Current reference count of a container entry, if present.
    pub fn container_refs(&self, pool: Uuid, id: Uuid) -> Option<usize> {
        self.inner
            .pools
            .lock()
            .get(&pool)
            .and_then(|entry| entry.containers.get(&id))
            .map(|container| container.refs)
    }

    /// Label a pool was connected by, if any.
    pub fn pool_label(&self, id: Uuid) -> Option<String> {
        self.inner
            .pools
            .lock()
            .get(&id)
            .and_then(|entry| entry.label.clone())
    }

    /// Label a container was opened by, if any.
    pub fn container_label(&self, pool: Uuid, id: Uuid) -> Option<String> {
        self.inner
            .pools
            .lock()
            .get(&pool)
            .and_then(|entry| entry.containers.get(&id))
            .and_then(|container| container.label.clone())
    }
}

impl PoolConnection {
    /// UUID of the connected pool.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Clone for PoolConnection {
    fn clone(&self) -> Self {
        let mut pools = self.inner.pools.lock();
        let entry = pools
            .get_mut(&self.id)
            .expect("clone of a released pool connection");
        entry.refs += 1;
        Self {
            inner: self.inner.clone(),
            id: self.id,
        }
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        let last = {
            let mut pools = self.inner.pools.lock();
            let entry = pools
                .get_mut(&self.id)
                .expect("double release of a pool connection");
            entry.refs -= 1;
            if entry.refs == 0 {
                pools.remove(&self.id);
                true
            } else {
                false
            }
        };
        if last {
            debug!("Last reference to pool {} dropped", self.id);
            if !self.id.is_nil() {
                self.inner.store.pool_disconnect(self.id);
            }
        }
    }
}

impl ContainerHandle {
    /// UUID of the open container.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// UUID of the pool the container lives in.
    pub fn pool_id(&self) -> Uuid {
        self.pool.id
    }

    /// Operation table this handle is bound to.
    pub fn ops_kind(&self) -> OpsKind {
        self.ops
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        let last = {
            let mut pools = self.pool.inner.pools.lock();
            let entry = pools
                .get_mut(&self.pool.id)
                .expect("container outlived its pool entry");
            let container = entry
                .containers
                .get_mut(&self.id)
                .expect("double release of a container handle");
            container.refs -= 1;
            if container.refs == 0 {
                entry.containers.remove(&self.id);
                true
            } else {
                false
            }
        };
        if last {
            debug!("Last reference to container {} dropped", self.id);
            if !self.pool.id.is_nil() && !self.id.is_nil() {
                self.pool.inner.store.container_close(self.pool.id, self.id);
            }
        }
        // The held PoolConnection drops afterwards, releasing the pool.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::storage::AttrProbe;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Storage double counting connect/disconnect traffic.
    #[derive(Default)]
    struct CountingStore {
        pool_connects: AtomicUsize,
        pool_disconnects: AtomicUsize,
        container_opens: AtomicUsize,
        container_closes: AtomicUsize,
    }

    impl StorageClient for CountingStore {
        fn init(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn fini(&self) {}
        fn pool_connect(&self, _pool: Uuid) -> Result<(), StorageError> {
            self.pool_connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn pool_connect_by_label(&self, label: &str) -> Result<Uuid, StorageError> {
            if label == "tank" {
                Ok(Uuid::from_u128(0x1001))
            } else {
                Err(StorageError::not_found(format!("pool {label}")))
            }
        }
        fn pool_disconnect(&self, _pool: Uuid) {
            self.pool_disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn container_open(&self, _pool: Uuid, _container: Uuid) -> Result<(), StorageError> {
            self.container_opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn container_open_by_label(&self, _pool: Uuid, label: &str) -> Result<Uuid, StorageError> {
            if label == "scratch" {
                Ok(Uuid::from_u128(0x2002))
            } else {
                Err(StorageError::not_found(format!("container {label}")))
            }
        }
        fn container_close(&self, _pool: Uuid, _container: Uuid) {
            self.container_closes.fetch_add(1, Ordering::SeqCst);
        }
        fn resolve_path(&self, _path: &Path) -> Result<AttrProbe, StorageError> {
            Ok(AttrProbe::NoData)
        }
        fn list_pools(&self) -> Result<Vec<Uuid>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn registry() -> (Arc<CountingStore>, Registry) {
        let store = Arc::new(CountingStore::default());
        (store.clone(), Registry::new(store))
    }

    #[test]
    fn test_pool_connect_counts_references() {
        let (store, registry) = registry();
        let pool_id = Uuid::new_v4();

        let first = registry.pool_connect(pool_id).unwrap();
        assert_eq!(registry.pool_refs(pool_id), Some(1));

        let second = first.clone();
        assert_eq!(registry.pool_refs(pool_id), Some(2));

        drop(second);
        assert_eq!(registry.pool_refs(pool_id), Some(1));

        drop(first);
        assert_eq!(registry.pool_refs(pool_id), None);
        assert_eq!(store.pool_connects.load(Ordering::SeqCst), 1);
        assert_eq!(store.pool_disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_container_retains_pool() {
        let (_store, registry) = registry();
        let pool_id = Uuid::new_v4();
        let cont_id = Uuid::new_v4();

        let pool = registry.pool_connect(pool_id).unwrap();
        let container = registry.container_open(&pool, cont_id).unwrap();

        // The container's reference is now the pool's sole keep-alive.
        drop(pool);
        assert_eq!(registry.pool_refs(pool_id), Some(1));
        assert_eq!(registry.container_refs(pool_id, cont_id), Some(1));

        drop(container);
        assert_eq!(registry.pool_refs(pool_id), None);
    }

    #[test]
    fn test_pool_refs_match_live_containers() {
        let (_store, registry) = registry();
        let pool_id = Uuid::new_v4();

        let pool = registry.pool_connect(pool_id).unwrap();
        let one = registry.container_open(&pool, Uuid::new_v4()).unwrap();
        let two = registry.container_open(&pool, Uuid::new_v4()).unwrap();
        drop(pool);

        assert_eq!(registry.pool_refs(pool_id), Some(2));
        drop(one);
        assert_eq!(registry.pool_refs(pool_id), Some(1));
        drop(two);
        assert_eq!(registry.pool_refs(pool_id), None);
    }

    #[test]
    fn test_repeated_open_shares_the_entry() {
        let (store, registry) = registry();
        let pool_id = Uuid::new_v4();
        let cont_id = Uuid::new_v4();

        let pool = registry.pool_connect(pool_id).unwrap();
        let first = registry.container_open(&pool, cont_id).unwrap();
        let second = registry.container_open(&pool, cont_id).unwrap();
        assert_eq!(registry.container_refs(pool_id, cont_id), Some(2));
        assert_eq!(store.container_opens.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(registry.container_refs(pool_id, cont_id), Some(1));
        drop(second);
        assert_eq!(registry.container_refs(pool_id, cont_id), None);
        assert_eq!(store.container_closes.load(Ordering::SeqCst), 1);
        drop(pool);
    }

    #[test]
    fn test_nil_pool_skips_storage_and_selects_multi_pool_table() {
        let (store, registry) = registry();

        let pool = registry.pool_connect(Uuid::nil()).unwrap();
        let container = registry.container_open(&pool, Uuid::nil()).unwrap();
        drop(pool);

        assert_eq!(container.ops_kind(), OpsKind::MultiPool);
        assert_eq!(store.pool_connects.load(Ordering::SeqCst), 0);
        assert_eq!(store.container_opens.load(Ordering::SeqCst), 0);

        drop(container);
        assert_eq!(store.pool_disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(registry.pool_refs(Uuid::nil()), None);
    }

    #[test]
    fn test_single_pool_table_for_real_pool() {
        let (_store, registry) = registry();
        let pool = registry.pool_connect(Uuid::new_v4()).unwrap();
        let container = registry.container_open(&pool, Uuid::new_v4()).unwrap();
        assert_eq!(container.ops_kind(), OpsKind::SinglePool);
    }

    #[test]
    fn test_connect_by_label_records_label() {
        let (_store, registry) = registry();
        let pool = registry.pool_connect_by_label("tank").unwrap();
        assert_eq!(pool.id(), Uuid::from_u128(0x1001));
        assert_eq!(registry.pool_label(pool.id()), Some("tank".to_string()));

        let container = registry.container_open_by_label(&pool, "scratch").unwrap();
        assert_eq!(container.id(), Uuid::from_u128(0x2002));
        assert_eq!(
            registry.container_label(pool.id(), container.id()),
            Some("scratch".to_string())
        );
    }

    #[test]
    fn test_unknown_label_fails() {
        let (_store, registry) = registry();
        assert!(registry.pool_connect_by_label("missing").unwrap_err().is_not_found());
    }
}
