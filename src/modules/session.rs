//! FUSE session lifecycle: build, mount, loop, unmount, destroy.
//!
//! [`launch`] owns the whole ordered sequence. Each step is a prerequisite
//! for the next and any failure cleans up and returns `false`: the session
//! is built and mounted, startup success is reported to the daemonizer
//! exactly once and strictly before the blocking loop starts, the selected
//! loop runs, and the session is unconditionally unmounted on loop exit
//! before any failure propagates.
//!
//! In threaded mode requests are dispatched as owned jobs onto a queue that
//! a fixed pool of workers drains concurrently; in single-threaded mode
//! they execute inline on the cooperative loop.

use std::ffi::OsStr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fuser::{
    consts::FUSE_WRITEBACK_CACHE, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyDirectory, ReplyEntry, ReplyStatfs, Request,
};
use libc::{SIGINT, SIGTERM};
use log::{debug, error, info};
use parking_lot::Mutex;
use signal_hook::iterator::Signals;

use super::config::MountConfig;
use super::daemon::StartupReporter;
use super::ops::{Operations, RequestContext};

/// Lifecycle states of the one FUSE session a daemon process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No kernel session exists yet.
    Unbound,
    /// Session built and mounted at the configured path.
    Mounted,
    /// Loop exited; the mount is being taken down.
    Unmounting,
    /// Session destroyed and resources released.
    Destroyed,
}

type Job = Box<dyn FnOnce() + Send>;

/// Where dispatched requests execute.
enum Executor {
    /// Execute on the loop thread.
    Inline,
    /// Hand off to the worker pool.
    Pool(Sender<Job>),
}

impl Executor {
    fn submit(&self, job: Job) {
        match self {
            Executor::Inline => job(),
            Executor::Pool(tx) => {
                if tx.send(job).is_err() {
                    // Workers are gone; the loop is shutting down.
                    debug!("Dropping request submitted during shutdown");
                }
            }
        }
    }
}

/// `fuser::Filesystem` adapter that snapshots each request and forwards it
/// to the operation table through the executor.
struct Dispatch {
    ops: Arc<dyn Operations>,
    executor: Executor,
    wb_cache: bool,
}

impl Filesystem for Dispatch {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if self.wb_cache {
            if let Err(unsupported) = config.add_capabilities(FUSE_WRITEBACK_CACHE) {
                debug!("Kernel rejected write-back caching: {:#x}", unsupported);
            }
        }
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ops = self.ops.clone();
        let ctx = RequestContext::from_request(req);
        let name = name.to_owned();
        self.executor
            .submit(Box::new(move || ops.lookup(&ctx, parent, &name, reply)));
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let ops = self.ops.clone();
        let ctx = RequestContext::from_request(req);
        self.executor
            .submit(Box::new(move || ops.getattr(&ctx, ino, reply)));
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let ops = self.ops.clone();
        let ctx = RequestContext::from_request(req);
        self.executor
            .submit(Box::new(move || ops.readdir(&ctx, ino, offset, reply)));
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let ops = self.ops.clone();
        let ctx = RequestContext::from_request(req);
        self.executor
            .submit(Box::new(move || ops.statfs(&ctx, ino, reply)));
    }
}

/// Fixed pool of request workers draining a shared queue.
struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers over the receiving end of the job queue.
    fn spawn(count: usize, rx: Receiver<Job>) -> std::io::Result<Self> {
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("pfuse-worker-{index}"))
                .spawn(move || loop {
                    // Only the pull is serialized; jobs run unlocked.
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self { workers })
    }

    /// Waits for every worker to drain out. The queue sender must already
    /// be dropped.
    fn join(self) {
        for worker in self.workers {
            if worker.join().is_err() {
                error!("Request worker panicked");
            }
        }
    }
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("pondfuse".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
    ]
}

/// Builds, mounts, and runs the FUSE session for a resolved mount.
///
/// Returns `true` when the loop ran and the session came down cleanly,
/// `false` on any failure. Startup success is reported through `reporter`
/// exactly once, after the mount is registered with the kernel and before
/// the loop blocks; failures after that point surface in the loop result,
/// not in the parent's exit status.
pub fn launch(
    config: &MountConfig,
    ops: Arc<dyn Operations>,
    reporter: &mut StartupReporter,
) -> bool {
    let mut state = SessionState::Unbound;
    debug!("Session state {:?}", state);

    let (executor, pool) = if config.threaded {
        let (tx, rx) = channel();
        let pool = match WorkerPool::spawn(config.worker_threads(), rx) {
            Ok(pool) => pool,
            Err(err) => {
                error!("Failed to start request workers: {}", err);
                return false;
            }
        };
        (Executor::Pool(tx), Some(pool))
    } else {
        (Executor::Inline, None)
    };

    let dispatch = Dispatch {
        ops,
        executor,
        wb_cache: config.wb_cache,
    };

    let options = mount_options();
    let mut session = match fuser::Session::new(dispatch, &config.mountpoint, &options) {
        Ok(session) => session,
        Err(err) => {
            error!(
                "Failed to mount at {}: {}",
                config.mountpoint.display(),
                err
            );
            if let Some(pool) = pool {
                pool.join();
            }
            return false;
        }
    };
    // The kernel holds the mount now; the parsed options are done with.
    drop(options);
    state = SessionState::Mounted;
    debug!("Session state {:?}", state);
    info!(
        "Mounted at {} ({} mode)",
        config.mountpoint.display(),
        if config.threaded { "threaded" } else { "single threaded" }
    );

    // Watch for termination signals and translate them into an unmount,
    // which ends the loop.
    let mut unmounter = session.unmount_callable();
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            error!("Failed to install signal watcher: {}", err);
            session.unmount();
            if let Some(pool) = pool {
                drop(session);
                pool.join();
            }
            return false;
        }
    };
    let signals_handle = signals.handle();
    let signal_thread = thread::spawn(move || {
        for signal in signals.forever() {
            info!("Received signal {}, unmounting", signal);
            if let Err(err) = unmounter.unmount() {
                error!("Unmount on signal failed: {}", err);
            }
            break;
        }
    });

    // Success must reach the parent before the loop can block, and before
    // any request failure could corrupt the reported status.
    if reporter.report(0).is_err() {
        error!("Failed to report startup success");
        session.unmount();
        drop(session);
        if let Some(pool) = pool {
            pool.join();
        }
        signals_handle.close();
        let _ = signal_thread.join();
        return false;
    }

    let loop_result = session.run();

    state = SessionState::Unmounting;
    debug!("Session state {:?}", state);
    session.unmount();
    drop(session);
    if let Some(pool) = pool {
        pool.join();
    }
    signals_handle.close();
    let _ = signal_thread.join();
    state = SessionState::Destroyed;
    debug!("Session state {:?}", state);

    match loop_result {
        Ok(()) => true,
        Err(err) => {
            error!("Event loop exited with error: {}", err);
            false
        }
    }
}
