//! Mount configuration: parsing-adjacent validation and defaults.
//!
//! [`MountConfig`] is the immutable result of resolving raw command line
//! values. All configuration errors are raised here, before any fork or
//! storage activity, so they always reach the invoking terminal.

use std::ffi::OsString;
use std::path::PathBuf;

use log::warn;
use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;

use super::constants::MIN_THREAD_COUNT;
use super::error::StartError;

/// Raw values collected from the command line and environment.
///
/// This is the mutable input side; [`MountConfig::resolve`] turns it into an
/// immutable configuration or fails with a configuration error.
#[derive(Debug, Default, Clone)]
pub struct MountOptions {
    /// Mount point path.
    pub mountpoint: PathBuf,
    /// Pool UUID or label, if given.
    pub pool: Option<String>,
    /// Container UUID or label, if given.
    pub container: Option<String>,
    /// Path to load pool/container attributes from, if given.
    pub attr_path: Option<PathBuf>,
    /// Storage system name context, if given.
    pub sys_name: Option<String>,
    /// Run the request loop single threaded.
    pub singlethread: bool,
    /// Explicit thread count, if given.
    pub thread_count: Option<usize>,
    /// Stay in the foreground.
    pub foreground: bool,
    /// Disable all caching.
    pub disable_caching: bool,
    /// Use write-through rather than write-back data caching.
    pub disable_wb_cache: bool,
    /// Value of the job-launcher rank variable, if present.
    pub launcher_rank: Option<OsString>,
}

/// Resolved mount configuration. Immutable after [`MountConfig::resolve`].
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Mount point path.
    pub mountpoint: PathBuf,
    /// Pool UUID or label, if given.
    pub pool: Option<String>,
    /// Container UUID or label, if given.
    pub container: Option<String>,
    /// Path to load pool/container attributes from, if given.
    pub attr_path: Option<PathBuf>,
    /// Storage system name context, if given.
    pub sys_name: Option<String>,
    /// Whether the worker-thread-pool loop is used.
    pub threaded: bool,
    /// Thread count before the event-queue core is reserved. Always at
    /// least [`MIN_THREAD_COUNT`].
    pub thread_count: usize,
    /// Whether the process stays in the foreground.
    pub foreground: bool,
    /// Whether caching is enabled at all.
    pub caching: bool,
    /// Whether data caching runs in write-back mode.
    pub wb_cache: bool,
}

impl MountConfig {
    /// Resolves raw options against the CPUs available to this process.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Config`] when fewer than two threads would be
    /// available, whether requested explicitly or derived from the CPU
    /// affinity mask.
    pub fn resolve(opts: MountOptions) -> Result<Self, StartError> {
        let cpus = available_cpus()?;
        Self::resolve_with_cpus(opts, cpus)
    }

    fn resolve_with_cpus(opts: MountOptions, cpus: usize) -> Result<Self, StartError> {
        let mut foreground = opts.foreground;
        if !foreground && opts.launcher_rank.is_some() {
            warn!("Job launcher rank detected, not running in background");
            foreground = true;
        }

        let threaded = !opts.singlethread;
        let thread_count = match opts.thread_count {
            Some(count) => count,
            // Single threaded still gets one extra for event queue processing.
            None if !threaded => MIN_THREAD_COUNT,
            None => cpus,
        };

        if thread_count < MIN_THREAD_COUNT {
            return Err(StartError::Config(format!(
                "at least {} threads are required, {} available",
                MIN_THREAD_COUNT, thread_count
            )));
        }

        Ok(Self {
            mountpoint: opts.mountpoint,
            pool: opts.pool,
            container: opts.container,
            attr_path: opts.attr_path,
            sys_name: opts.sys_name,
            threaded,
            thread_count,
            foreground,
            caching: !opts.disable_caching,
            wb_cache: !opts.disable_caching && !opts.disable_wb_cache,
        })
    }

    /// Number of request worker threads: the thread count minus the one
    /// core reserved for the storage event-queue thread.
    pub fn worker_threads(&self) -> usize {
        self.thread_count - 1
    }
}

/// Counts the CPUs available to this process, honoring the affinity mask.
fn available_cpus() -> Result<usize, StartError> {
    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|err| StartError::Config(format!("failed to read cpu affinity: {err}")))?;
    let count = (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .count();
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opts() -> MountOptions {
        MountOptions {
            mountpoint: PathBuf::from("/mnt/pond"),
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_count_is_thread_count_minus_one() {
        for count in 2..16 {
            let opts = MountOptions {
                thread_count: Some(count),
                ..base_opts()
            };
            let config = MountConfig::resolve_with_cpus(opts, 8).unwrap();
            assert_eq!(config.worker_threads(), count - 1);
            assert!(config.worker_threads() >= 1);
        }
    }

    #[test]
    fn test_explicit_thread_count_below_minimum_fails() {
        let opts = MountOptions {
            thread_count: Some(1),
            ..base_opts()
        };
        let err = MountConfig::resolve_with_cpus(opts, 8).unwrap_err();
        assert!(matches!(err, StartError::Config(_)));
    }

    #[test]
    fn test_cpu_derived_thread_count_below_minimum_fails() {
        let err = MountConfig::resolve_with_cpus(base_opts(), 1).unwrap_err();
        assert!(matches!(err, StartError::Config(_)));
    }

    #[test]
    fn test_cpu_derived_thread_count() {
        let config = MountConfig::resolve_with_cpus(base_opts(), 6).unwrap();
        assert!(config.threaded);
        assert_eq!(config.thread_count, 6);
        assert_eq!(config.worker_threads(), 5);
    }

    #[test]
    fn test_singlethread_reserves_event_queue_thread() {
        let opts = MountOptions {
            singlethread: true,
            ..base_opts()
        };
        let config = MountConfig::resolve_with_cpus(opts, 8).unwrap();
        assert!(!config.threaded);
        assert_eq!(config.thread_count, MIN_THREAD_COUNT);
    }

    #[test]
    fn test_launcher_rank_forces_foreground() {
        let opts = MountOptions {
            launcher_rank: Some("3".into()),
            ..base_opts()
        };
        let config = MountConfig::resolve_with_cpus(opts, 8).unwrap();
        assert!(config.foreground);
    }

    #[test]
    fn test_disable_caching_implies_write_through() {
        let opts = MountOptions {
            disable_caching: true,
            ..base_opts()
        };
        let config = MountConfig::resolve_with_cpus(opts, 8).unwrap();
        assert!(!config.caching);
        assert!(!config.wb_cache);
    }

    #[test]
    fn test_caching_defaults() {
        let config = MountConfig::resolve_with_cpus(base_opts(), 8).unwrap();
        assert!(config.caching);
        assert!(config.wb_cache);
    }
}
