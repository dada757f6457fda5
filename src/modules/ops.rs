//! Operation tables bound to a mounted session.
//!
//! Request handling proper lives with the storage layer; what this module
//! carries is the structural skeleton the mount needs: a [`RequestContext`]
//! snapshot that workers can own, the [`Operations`] trait the dispatch
//! loop drives, and the two concrete tables. A mount bound to a real pool
//! gets [`ContainerOps`]; a mount bound to the nil all-pools sentinel gets
//! [`MultiPoolOps`], which exposes every reachable pool as a top-level
//! directory.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{FileAttr, FileType, ReplyAttr, ReplyDirectory, ReplyEntry, ReplyStatfs, Request};
use log::warn;
use uuid::Uuid;

use super::config::MountConfig;
use super::constants::{ATTR_TTL, ATTR_TTL_NOCACHE, BLOCK_SIZE, DEFAULT_PERMISSION, FIRST_POOL_INODE, ROOT_INODE};
use super::registry::{ContainerHandle, OpsKind};
use super::storage::StorageClient;

/// Request metadata captured before a request is handed to a worker, so the
/// handling thread owns its data exclusively.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Kernel-assigned request id.
    pub unique: u64,
    /// Requesting user.
    pub uid: u32,
    /// Requesting group.
    pub gid: u32,
    /// Requesting process.
    pub pid: u32,
}

impl RequestContext {
    /// Snapshots a kernel request.
    pub fn from_request(req: &Request<'_>) -> Self {
        Self {
            unique: req.unique(),
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
        }
    }
}

/// Filesystem operations served by a mounted container.
///
/// Implementations must be shareable across worker threads. Operations not
/// provided fall back to a not-supported reply.
pub trait Operations: Send + Sync {
    /// Attribute validity the table hands to the kernel.
    fn attr_ttl(&self) -> Duration;

    /// Looks a name up under a parent directory.
    fn lookup(&self, _ctx: &RequestContext, _parent: u64, _name: &OsStr, reply: ReplyEntry) {
        reply.error(libc::ENOSYS);
    }

    /// Returns the attributes of an inode.
    fn getattr(&self, _ctx: &RequestContext, _ino: u64, reply: ReplyAttr) {
        reply.error(libc::ENOSYS);
    }

    /// Lists a directory.
    fn readdir(&self, _ctx: &RequestContext, _ino: u64, _offset: i64, reply: ReplyDirectory) {
        reply.error(libc::ENOSYS);
    }

    /// Reports filesystem usage.
    fn statfs(&self, _ctx: &RequestContext, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE as u32, 255, BLOCK_SIZE as u32);
    }
}

fn directory_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: DEFAULT_PERMISSION,
        nlink: 2,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE as u32,
    }
}

/// Table serving a single pool's container.
pub struct ContainerOps {
    pool: Uuid,
    container: Uuid,
    attr_ttl: Duration,
}

impl ContainerOps {
    /// Creates the table for one (pool, container) binding.
    pub fn new(pool: Uuid, container: Uuid, attr_ttl: Duration) -> Self {
        Self {
            pool,
            container,
            attr_ttl,
        }
    }

    /// Pool this table serves.
    pub fn pool(&self) -> Uuid {
        self.pool
    }

    /// Container this table serves.
    pub fn container(&self) -> Uuid {
        self.container
    }
}

impl Operations for ContainerOps {
    fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    fn getattr(&self, _ctx: &RequestContext, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INODE {
            reply.attr(&self.attr_ttl, &directory_attr(ROOT_INODE));
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn readdir(&self, _ctx: &RequestContext, ino: u64, offset: i64, mut reply: ReplyDirectory) {
        if ino != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }
        let entries = [(ROOT_INODE, "."), (ROOT_INODE, "..")];
        for (i, (ino, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, FileType::Directory, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Table exposing every reachable pool as a top-level directory, bound when
/// the mount resolves to the nil all-pools sentinel.
pub struct MultiPoolOps {
    store: Arc<dyn StorageClient>,
    attr_ttl: Duration,
}

impl MultiPoolOps {
    /// Creates the all-pools table.
    pub fn new(store: Arc<dyn StorageClient>, attr_ttl: Duration) -> Self {
        Self { store, attr_ttl }
    }

    fn pools(&self) -> Vec<Uuid> {
        match self.store.list_pools() {
            Ok(pools) => pools,
            Err(err) => {
                warn!("Failed to list pools: {}", err);
                Vec::new()
            }
        }
    }
}

impl Operations for MultiPoolOps {
    fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    fn lookup(&self, _ctx: &RequestContext, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }
        let pools = self.pools();
        let found = pools.iter().enumerate().find(|(_, pool)| {
            name.to_str() == Some(pool.to_string().as_str())
        });
        match found {
            Some((index, _)) => {
                let ino = FIRST_POOL_INODE + index as u64;
                reply.entry(&self.attr_ttl, &directory_attr(ino), 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&self, _ctx: &RequestContext, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INODE {
            reply.attr(&self.attr_ttl, &directory_attr(ROOT_INODE));
            return;
        }
        let pools = self.pools();
        match ino.checked_sub(FIRST_POOL_INODE) {
            Some(index) if (index as usize) < pools.len() => {
                reply.attr(&self.attr_ttl, &directory_attr(ino));
            }
            _ => reply.error(libc::ENOENT),
        }
    }

    fn readdir(&self, _ctx: &RequestContext, ino: u64, offset: i64, mut reply: ReplyDirectory) {
        if ino != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }
        let pools = self.pools();
        let mut entries = vec![
            (ROOT_INODE, ".".to_string()),
            (ROOT_INODE, "..".to_string()),
        ];
        for (index, pool) in pools.iter().enumerate() {
            entries.push((FIRST_POOL_INODE + index as u64, pool.to_string()));
        }
        for (i, (ino, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, FileType::Directory, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Attribute validity for a configuration.
pub fn attr_ttl_for(config: &MountConfig) -> Duration {
    if config.caching {
        ATTR_TTL
    } else {
        ATTR_TTL_NOCACHE
    }
}

/// Builds the operation table a container handle is bound to.
pub fn table_for(
    container: &ContainerHandle,
    store: Arc<dyn StorageClient>,
    config: &MountConfig,
) -> Arc<dyn Operations> {
    let ttl = attr_ttl_for(config);
    match container.ops_kind() {
        OpsKind::MultiPool => Arc::new(MultiPoolOps::new(store, ttl)),
        OpsKind::SinglePool => Arc::new(ContainerOps::new(container.pool_id(), container.id(), ttl)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::config::{MountConfig, MountOptions};
    use crate::modules::error::StorageError;
    use crate::modules::registry::Registry;
    use crate::modules::storage::AttrProbe;
    use std::path::{Path, PathBuf};

    struct TwoPoolStore;

    impl StorageClient for TwoPoolStore {
        fn init(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn fini(&self) {}
        fn pool_connect(&self, _pool: Uuid) -> Result<(), StorageError> {
            Ok(())
        }
        fn pool_connect_by_label(&self, label: &str) -> Result<Uuid, StorageError> {
            Err(StorageError::not_found(format!("pool {label}")))
        }
        fn pool_disconnect(&self, _pool: Uuid) {}
        fn container_open(&self, _pool: Uuid, _container: Uuid) -> Result<(), StorageError> {
            Ok(())
        }
        fn container_open_by_label(&self, _pool: Uuid, label: &str) -> Result<Uuid, StorageError> {
            Err(StorageError::not_found(format!("container {label}")))
        }
        fn container_close(&self, _pool: Uuid, _container: Uuid) {}
        fn resolve_path(&self, _path: &Path) -> Result<AttrProbe, StorageError> {
            Ok(AttrProbe::NoData)
        }
        fn list_pools(&self) -> Result<Vec<Uuid>, StorageError> {
            Ok(vec![Uuid::from_u128(1), Uuid::from_u128(2)])
        }
    }

    fn test_config(disable_caching: bool) -> MountConfig {
        let opts = MountOptions {
            mountpoint: PathBuf::from("/mnt/pond"),
            thread_count: Some(2),
            foreground: true,
            disable_caching,
            ..Default::default()
        };
        // Resolution is pure given an explicit thread count.
        MountConfig::resolve(opts).unwrap()
    }

    #[test]
    fn test_attr_ttl_follows_caching_flag() {
        assert_eq!(attr_ttl_for(&test_config(false)), ATTR_TTL);
        assert_eq!(attr_ttl_for(&test_config(true)), ATTR_TTL_NOCACHE);
    }

    #[test]
    fn test_table_selection() {
        let store = Arc::new(TwoPoolStore);
        let registry = Registry::new(store.clone());
        let config = test_config(false);

        let pool = registry.pool_connect(Uuid::nil()).unwrap();
        let container = registry.container_open(&pool, Uuid::nil()).unwrap();
        let table = table_for(&container, store.clone(), &config);
        assert_eq!(table.attr_ttl(), ATTR_TTL);
        assert_eq!(container.ops_kind(), OpsKind::MultiPool);

        let pool = registry.pool_connect(Uuid::from_u128(1)).unwrap();
        let container = registry.container_open(&pool, Uuid::from_u128(7)).unwrap();
        assert_eq!(container.ops_kind(), OpsKind::SinglePool);
        let _table = table_for(&container, store, &config);
    }

    #[test]
    fn test_container_ops_identity() {
        let ops = ContainerOps::new(Uuid::from_u128(3), Uuid::from_u128(4), ATTR_TTL);
        assert_eq!(ops.pool(), Uuid::from_u128(3));
        assert_eq!(ops.container(), Uuid::from_u128(4));
    }
}
