//! Shared constants and default values.

use std::time::Duration;

/// Minimum thread count before the event-queue reservation is taken.
pub const MIN_THREAD_COUNT: usize = 2;

/// Exit status for daemon handshake protocol failures.
pub const EXIT_PROTOCOL_FAILURE: i32 = 2;

/// Base added to storage errno values when mapping them onto an exit status.
/// Keeps storage exits disjoint from 0 (success) and 2 (protocol failure).
pub const EXIT_ERRNO_BASE: i32 = 32;

/// Job-launcher rank variable; when set the daemon stays in the foreground.
pub const RANK_ENV: &str = "PMIX_RANK";

/// Environment override for the local store root directory.
pub const STORE_ROOT_ENV: &str = "PONDFUSE_STORE";

/// Default local store root when [`STORE_ROOT_ENV`] is not set.
pub const DEFAULT_STORE_ROOT: &str = "/var/lib/pondfuse";

/// Extended attribute carrying the pool/container identity of a directory.
pub const IDENTITY_XATTR: &str = "user.pondfuse.id";

/// Manifest file holding the label of a pool or container directory.
pub const LABEL_FILE: &str = ".label";

// File system constants
/// Attribute validity handed to the kernel when caching is enabled.
pub const ATTR_TTL: Duration = Duration::from_secs(1);
/// Attribute validity when caching is disabled.
pub const ATTR_TTL_NOCACHE: Duration = Duration::ZERO;
/// Block size reported in attributes and statfs replies.
pub const BLOCK_SIZE: u64 = 512;
/// Permissions of synthesized directories.
pub const DEFAULT_PERMISSION: u16 = 0o755;
/// Inode of the mount root.
pub const ROOT_INODE: u64 = 1;
/// First inode handed out to pool directories on an all-pools mount.
pub const FIRST_POOL_INODE: u64 = 2;
