//! Storage layer seam: the client trait and a directory-backed store.
//!
//! The daemon consumes the storage layer through [`StorageClient`], which
//! covers init/fini, pool connects by id or label, container opens by id or
//! label, and the path attribute resolver. [`LocalStore`] implements the
//! trait over a plain directory tree: pools are directories named by UUID
//! under the store root, containers are directories named by UUID inside
//! their pool, and labels live in a `.label` manifest file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::constants::{IDENTITY_XATTR, LABEL_FILE};
use super::error::StorageError;

/// Pool/container identity embedded on a directory, as carried by the
/// identity extended attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathIdentity {
    /// Pool the path is bound to.
    pub pool: Uuid,
    /// Container the path is bound to.
    pub container: Uuid,
}

impl PathIdentity {
    /// Parses an identity attribute payload.
    ///
    /// # Errors
    ///
    /// Returns an `EINVAL` storage error for payloads that are not the
    /// expected JSON document.
    pub fn parse(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes)
            .map_err(|err| StorageError::new(libc::EINVAL, format!("malformed identity attribute: {err}")))
    }
}

/// Outcome of probing a path for embedded identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrProbe {
    /// The path carries a definitive identity.
    Identity(PathIdentity),
    /// The path exists but carries no identity data.
    NoData,
    /// The filesystem under the path does not support identity attributes.
    Unsupported,
}

/// Client interface onto the storage layer.
pub trait StorageClient: Send + Sync {
    /// Brings the client up. Called once, after daemonization.
    fn init(&self) -> Result<(), StorageError>;

    /// Tears the client down. Called once, after the session is destroyed.
    fn fini(&self);

    /// Connects to a pool by UUID.
    fn pool_connect(&self, pool: Uuid) -> Result<(), StorageError>;

    /// Connects to a pool by label, returning its UUID.
    fn pool_connect_by_label(&self, label: &str) -> Result<Uuid, StorageError>;

    /// Drops a pool connection.
    fn pool_disconnect(&self, pool: Uuid);

    /// Opens a container by UUID within a connected pool.
    fn container_open(&self, pool: Uuid, container: Uuid) -> Result<(), StorageError>;

    /// Opens a container by label within a connected pool, returning its
    /// UUID.
    fn container_open_by_label(&self, pool: Uuid, label: &str) -> Result<Uuid, StorageError>;

    /// Closes a container.
    fn container_close(&self, pool: Uuid, container: Uuid);

    /// Probes a path for embedded pool/container identity.
    ///
    /// # Errors
    ///
    /// A missing path is an `ENOENT` storage error; no-data and
    /// not-supported are successful [`AttrProbe`] outcomes, not errors.
    fn resolve_path(&self, path: &Path) -> Result<AttrProbe, StorageError>;

    /// Lists the pools reachable through this client.
    fn list_pools(&self) -> Result<Vec<Uuid>, StorageError>;
}

/// Directory-backed storage client.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens a store rooted at `root`, optionally scoped to a system name
    /// subdirectory.
    pub fn open(root: impl Into<PathBuf>, sys_name: Option<&str>) -> Self {
        let mut root = root.into();
        if let Some(sys) = sys_name {
            root.push(sys);
        }
        Self { root }
    }

    fn pool_dir(&self, pool: Uuid) -> PathBuf {
        self.root.join(pool.to_string())
    }

    fn container_dir(&self, pool: Uuid, container: Uuid) -> PathBuf {
        self.pool_dir(pool).join(container.to_string())
    }

    /// Finds the UUID-named subdirectory of `dir` whose label manifest
    /// matches `label`.
    fn lookup_label(&self, dir: &Path, label: &str, what: &str) -> Result<Uuid, StorageError> {
        let entries = fs::read_dir(dir)
            .map_err(|err| StorageError::from_io(&err, format!("listing {}", dir.display())))?;
        for entry in entries {
            let entry = entry
                .map_err(|err| StorageError::from_io(&err, format!("listing {}", dir.display())))?;
            let Ok(id) = Uuid::parse_str(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            match fs::read_to_string(entry.path().join(LABEL_FILE)) {
                Ok(manifest) if manifest.trim() == label => return Ok(id),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::from_io(
                        &err,
                        format!("reading label of {}", entry.path().display()),
                    ))
                }
            }
        }
        Err(StorageError::not_found(format!("{} labelled {:?}", what, label)))
    }

    fn require_dir(&self, path: &Path, what: &str) -> Result<(), StorageError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::new(libc::ENOTDIR, format!("{what} is not a directory"))),
            Err(err) => Err(StorageError::from_io(&err, what.to_string())),
        }
    }
}

impl StorageClient for LocalStore {
    fn init(&self) -> Result<(), StorageError> {
        self.require_dir(&self.root, "store root")?;
        info!("Local store up at {}", self.root.display());
        Ok(())
    }

    fn fini(&self) {
        debug!("Local store at {} finished", self.root.display());
    }

    fn pool_connect(&self, pool: Uuid) -> Result<(), StorageError> {
        self.require_dir(&self.pool_dir(pool), &format!("pool {pool}"))
    }

    fn pool_connect_by_label(&self, label: &str) -> Result<Uuid, StorageError> {
        self.lookup_label(&self.root, label, "pool")
    }

    fn pool_disconnect(&self, pool: Uuid) {
        debug!("Disconnected from pool {}", pool);
    }

    fn container_open(&self, pool: Uuid, container: Uuid) -> Result<(), StorageError> {
        self.require_dir(
            &self.container_dir(pool, container),
            &format!("container {container}"),
        )
    }

    fn container_open_by_label(&self, pool: Uuid, label: &str) -> Result<Uuid, StorageError> {
        self.lookup_label(&self.pool_dir(pool), label, "container")
    }

    fn container_close(&self, pool: Uuid, container: Uuid) {
        debug!("Closed container {} in pool {}", container, pool);
    }

    fn resolve_path(&self, path: &Path) -> Result<AttrProbe, StorageError> {
        match xattr::get(path, IDENTITY_XATTR) {
            Ok(Some(bytes)) => Ok(AttrProbe::Identity(PathIdentity::parse(&bytes)?)),
            Ok(None) => Ok(AttrProbe::NoData),
            Err(err) => match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) => Ok(AttrProbe::Unsupported),
                _ => Err(StorageError::from_io(
                    &err,
                    format!("resolving attributes of {}", path.display()),
                )),
            },
        }
    }

    fn list_pools(&self) -> Result<Vec<Uuid>, StorageError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| StorageError::from_io(&err, "listing store root"))?;
        let mut pools = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| StorageError::from_io(&err, "listing store root"))?;
            if let Ok(id) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                pools.push(id);
            }
        }
        pools.sort();
        Ok(pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store_with_pool(label: Option<&str>) -> (TempDir, LocalStore, Uuid) {
        let root = tempfile::tempdir().unwrap();
        let pool = Uuid::new_v4();
        fs::create_dir(root.path().join(pool.to_string())).unwrap();
        if let Some(label) = label {
            fs::write(root.path().join(pool.to_string()).join(LABEL_FILE), label).unwrap();
        }
        let store = LocalStore::open(root.path(), None);
        (root, store, pool)
    }

    #[test]
    fn test_init_requires_root() {
        let store = LocalStore::open("/nonexistent/pondfuse-test-root", None);
        assert!(store.init().unwrap_err().is_not_found());
    }

    #[test]
    fn test_pool_connect_by_id() {
        let (_root, store, pool) = store_with_pool(None);
        store.init().unwrap();
        store.pool_connect(pool).unwrap();
        assert!(store.pool_connect(Uuid::new_v4()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_pool_connect_by_label() {
        let (_root, store, pool) = store_with_pool(Some("tank"));
        assert_eq!(store.pool_connect_by_label("tank").unwrap(), pool);
        assert!(store.pool_connect_by_label("no-such").unwrap_err().is_not_found());
    }

    #[test]
    fn test_container_open_by_label() {
        let (root, store, pool) = store_with_pool(None);
        let container = Uuid::new_v4();
        let dir = root.path().join(pool.to_string()).join(container.to_string());
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(LABEL_FILE), "scratch\n").unwrap();

        assert_eq!(store.container_open_by_label(pool, "scratch").unwrap(), container);
        store.container_open(pool, container).unwrap();
        assert!(store
            .container_open(pool, Uuid::new_v4())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_list_pools_skips_foreign_entries() {
        let (root, store, pool) = store_with_pool(None);
        fs::create_dir(root.path().join("not-a-uuid")).unwrap();
        assert_eq!(store.list_pools().unwrap(), vec![pool]);
    }

    #[test]
    fn test_resolve_path_missing_is_not_found() {
        let (_root, store, _pool) = store_with_pool(None);
        let err = store.resolve_path(Path::new("/nonexistent/path")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_path_without_attribute() {
        let (root, store, _pool) = store_with_pool(None);
        // Depending on the filesystem backing the tempdir the probe is
        // either a clean no-data or a not-supported outcome.
        match store.resolve_path(root.path()).unwrap() {
            AttrProbe::NoData | AttrProbe::Unsupported => {}
            AttrProbe::Identity(_) => panic!("unexpected identity"),
        }
    }

    #[test]
    fn test_identity_payload_parsing() {
        let pool = Uuid::new_v4();
        let container = Uuid::new_v4();
        let payload = format!(r#"{{"pool": "{pool}", "container": "{container}"}}"#);
        let identity = PathIdentity::parse(payload.as_bytes()).unwrap();
        assert_eq!(identity, PathIdentity { pool, container });

        assert!(PathIdentity::parse(b"not json").is_err());
        assert!(PathIdentity::parse(br#"{"pool": "xyz"}"#).is_err());
    }
}
