//! Pool/container identity resolution.
//!
//! A mount binds to exactly one (pool, container) pair, which can arrive
//! three ways: explicit command line arguments, attributes loaded from a
//! separate path, or attributes found on the mountpoint itself. Exactly one
//! source may be definitive; conflicts are fatal rather than silently
//! overridden, and attribute-derived identity outranks explicit arguments
//! whenever both are present without a conflict.

use std::path::{Path, PathBuf};

use log::info;
use uuid::Uuid;

use super::config::MountConfig;
use super::error::StartError;
use super::storage::{AttrProbe, StorageClient};

/// Which source produced the definitive identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Command line `--pool`/`--container` values (or their absence).
    ExplicitArgument,
    /// Attributes loaded from the `--path` argument.
    PathAttributes,
    /// Attributes found on the mountpoint.
    MountpointAttributes,
}

/// A pool or container reference: a parsed UUID or a label still to be
/// resolved by the registry at connect/open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRef {
    /// Resolved identifier.
    Id(Uuid),
    /// Label to resolve against the store.
    Label(String),
}

impl StoreRef {
    /// Parses a command line name: UUIDs are taken as identifiers, anything
    /// else is treated as a label.
    pub fn parse(name: &str) -> Self {
        match Uuid::parse_str(name) {
            Ok(id) => StoreRef::Id(id),
            Err(_) => StoreRef::Label(name.to_string()),
        }
    }
}

/// The resolved identity of a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Pool to connect; the nil UUID selects the all-pools view.
    pub pool: StoreRef,
    /// Container to open; the nil UUID selects the pool root view.
    pub container: StoreRef,
    /// Source that produced the pair.
    pub source: IdentitySource,
}

/// Resolves the (pool, container) identity for a mount.
///
/// Attribute sources are consulted first: the `--path` argument, then an
/// independent probe of the mountpoint. Explicit arguments are the fallback
/// and must not collide with a definitive attribute source.
///
/// # Errors
///
/// [`StartError::Resolution`] on conflicting sources,
/// [`StartError::Config`] for a container argument without any pool
/// identification, and connection errors for probe failures.
pub fn resolve(config: &MountConfig, store: &dyn StorageClient) -> Result<Identity, StartError> {
    let mut found: Option<(Identity, PathBuf)> = None;

    // A supplied attribute path must unconditionally carry identity.
    if let Some(path) = &config.attr_path {
        if config.pool.is_some() {
            return Err(StartError::Resolution(
                "pool specified multiple ways, by argument and by path".to_string(),
            ));
        }
        match store.resolve_path(path)? {
            AttrProbe::Identity(id) => {
                info!("Using identity from {}: pool {} container {}", path.display(), id.pool, id.container);
                found = Some((
                    Identity {
                        pool: StoreRef::Id(id.pool),
                        container: StoreRef::Id(id.container),
                        source: IdentitySource::PathAttributes,
                    },
                    path.clone(),
                ));
            }
            AttrProbe::NoData | AttrProbe::Unsupported => {
                return Err(StartError::Resolution(format!(
                    "attribute path {} carries no identity",
                    path.display()
                )));
            }
        }
    }

    // Probe the mountpoint independently. Nothing embedded there is fine;
    // a second definitive source is not.
    match store.resolve_path(&config.mountpoint) {
        Ok(AttrProbe::Identity(id)) => {
            if config.pool.is_some() {
                return Err(StartError::Resolution(
                    "pool specified multiple ways, by argument and by mountpoint".to_string(),
                ));
            }
            if let Some((_, attr_path)) = &found {
                if same_path(attr_path, &config.mountpoint) {
                    return Err(StartError::Resolution(
                        "attributes set on both path and mountpoint".to_string(),
                    ));
                }
                return Err(StartError::Resolution(
                    "both the attribute path and the mountpoint carry identity".to_string(),
                ));
            }
            info!("Using identity from mountpoint: pool {} container {}", id.pool, id.container);
            found = Some((
                Identity {
                    pool: StoreRef::Id(id.pool),
                    container: StoreRef::Id(id.container),
                    source: IdentitySource::MountpointAttributes,
                },
                config.mountpoint.clone(),
            ));
        }
        Ok(AttrProbe::NoData) | Ok(AttrProbe::Unsupported) => {}
        Err(err) => return Err(StartError::Connection(err)),
    }

    if let Some((identity, _)) = found {
        return Ok(identity);
    }

    // Fall back to explicit arguments; a container argument alone cannot
    // identify a pool.
    if config.container.is_some() && config.pool.is_none() {
        return Err(StartError::Config(
            "container specified without a pool".to_string(),
        ));
    }

    let pool = config
        .pool
        .as_deref()
        .map(StoreRef::parse)
        .unwrap_or(StoreRef::Id(Uuid::nil()));
    let container = config
        .container
        .as_deref()
        .map(StoreRef::parse)
        .unwrap_or(StoreRef::Id(Uuid::nil()));
    Ok(Identity {
        pool,
        container,
        source: IdentitySource::ExplicitArgument,
    })
}

/// Compares two paths after normalization, so symlinks and trailing slashes
/// do not hide a double specification.
fn same_path(a: &Path, b: &Path) -> bool {
    let norm_a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let norm_b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    norm_a == norm_b
}
