#![doc(html_root_url = "https://docs.rs/pondfuse/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! pondfuse: a FUSE client daemon for pool/container storage
//!
//! pondfuse mounts a dataset from a shared object store as a local
//! filesystem. A mount binds to one (pool, container) pair, resolved from
//! explicit arguments, from attributes embedded on a path, or from the
//! mountpoint itself, and serves requests through a single FUSE session per
//! daemon process.
//!
//! ## Features
//!
//! - Background daemonization with synchronous startup error reporting
//! - Threaded or single-threaded request loops
//! - Identity resolution with strict conflict detection
//! - Reference-counted pool/container connection registry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pondfuse::{LocalStore, Registry};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # fn main() -> Result<(), pondfuse::StartError> {
//! let store = Arc::new(LocalStore::open("/var/lib/pondfuse", None));
//! let registry = Registry::new(store);
//!
//! // Connect a pool and open a container inside it.
//! let pool = registry.pool_connect(Uuid::nil())?;
//! let _container = registry.container_open(&pool, Uuid::nil())?;
//!
//! // The container keeps the pool alive on its own.
//! drop(pool);
//! # Ok(())
//! # }
//! ```
//!
//! ## Identity Sources
//!
//! - `ExplicitArgument`: `--pool`/`--container` values, or the all-pools
//!   view when neither is given
//! - `PathAttributes`: identity loaded from the `--path` argument
//! - `MountpointAttributes`: identity embedded on the mountpoint
//!
//! Exactly one source may be definitive; conflicts abort startup.

pub mod modules;

pub use modules::config::{MountConfig, MountOptions};
pub use modules::daemon::{daemonize, Fork, StartupReporter};
pub use modules::error::{StartError, StorageError};
pub use modules::identity::{resolve, Identity, IdentitySource, StoreRef};
pub use modules::registry::{ContainerHandle, OpsKind, PoolConnection, Registry};
pub use modules::session::launch;
pub use modules::storage::{LocalStore, StorageClient};
