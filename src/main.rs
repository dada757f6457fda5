//! pondfuse daemon entry point.
//!
//! Orchestrates startup: parse and validate configuration, fork into the
//! background unless foregrounded, bring the storage layer up, resolve the
//! mount identity, connect through the registry, and hand the session
//! lifecycle the selected operation table. Log verbosity follows `RUST_LOG`.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{ArgAction, CommandFactory, Parser};
use log::{error, info, LevelFilter};
use pondfuse::modules::config::{MountConfig, MountOptions};
use pondfuse::modules::constants::{DEFAULT_STORE_ROOT, RANK_ENV, STORE_ROOT_ENV};
use pondfuse::modules::daemon::{self, StartupReporter};
use pondfuse::modules::error::StartError;
use pondfuse::modules::identity::{self, StoreRef};
use pondfuse::modules::ops;
use pondfuse::modules::registry::Registry;
use pondfuse::modules::session;
use pondfuse::modules::storage::{LocalStore, StorageClient};

#[derive(Parser)]
#[command(
    name = "pfuse",
    version = concat!(env!("CARGO_PKG_VERSION"), " (fuser 0.15)"),
    about = "Mount a pool/container dataset as a local filesystem",
    disable_version_flag = true,
    after_help = "Specifying pool and container is optional. If neither is set the mount \
exposes every reachable pool, using their ids as leading path components.\n\
Pools and containers can be given as uuids or labels.\n\n\
The path option names a filesystem path whose embedded attributes carry the \
pool and container to use; without it the mount directory itself is also \
checked. Only one way of providing the identity may be used.\n\n\
The default thread count is one per core available to the process, with one \
core reserved for storage event processing, so at least two threads are \
required. Single-threaded mode uses the cooperative loop instead of the \
worker pool.\n\n\
Unless launched under a job scheduler, pfuse stays in the foreground until \
the mount is registered with the kernel so startup errors are reported to \
the terminal. Caching is on by default and can be disabled per mount."
)]
struct Cli {
    /// Mount point to use
    #[arg(short, long)]
    mountpoint: PathBuf,

    /// Pool uuid or label
    #[arg(long)]
    pool: Option<String>,

    /// Container uuid or label
    #[arg(long)]
    container: Option<String>,

    /// Path to load pool/container attributes from
    #[arg(long)]
    path: Option<PathBuf>,

    /// Storage system name context
    #[arg(long)]
    sys_name: Option<String>,

    /// Run the request loop single threaded
    #[arg(short = 'S', long)]
    singlethread: bool,

    /// Number of request threads to use
    #[arg(short = 't', long)]
    thread_count: Option<usize>,

    /// Run in foreground
    #[arg(short, long)]
    foreground: bool,

    /// Disable all caching
    #[arg(long)]
    disable_caching: bool,

    /// Use write-through rather than write-back cache
    #[arg(long)]
    disable_wb_cache: bool,

    /// Print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn main() {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let opts = MountOptions {
        mountpoint: cli.mountpoint,
        pool: cli.pool,
        container: cli.container,
        attr_path: cli.path,
        sys_name: cli.sys_name,
        singlethread: cli.singlethread,
        thread_count: cli.thread_count,
        foreground: cli.foreground,
        disable_caching: cli.disable_caching,
        disable_wb_cache: cli.disable_wb_cache,
        launcher_rank: env::var_os(RANK_ENV),
    };

    // Configuration problems must reach the terminal, so they are raised
    // before any fork.
    let config = match MountConfig::resolve(opts) {
        Ok(config) => config,
        Err(err) => fail(err),
    };

    // The parent waits inside daemonize and never returns from it.
    let mut reporter = match daemon::daemonize(&config) {
        Ok(fork) => fork.into_reporter(),
        Err(err) => fail(err),
    };

    match start(&config, &mut reporter) {
        Ok(()) => {
            info!("Exiting with status 0");
            exit(0);
        }
        Err(err) => {
            error!("{}", err);
            let code = err.exit_code();
            // Re-encode the failure across the handshake so the parent's
            // exit status reflects the true cause. No-op when success was
            // already reported or in foreground mode.
            let _ = reporter.report(code);
            if err.is_usage() {
                let _ = Cli::command().print_help();
            }
            exit(code);
        }
    }
}

/// Runs startup from storage init through session teardown, releasing
/// resources in reverse acquisition order on every path.
fn start(config: &MountConfig, reporter: &mut StartupReporter) -> Result<(), StartError> {
    let root = env::var_os(STORE_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT));
    let store: Arc<dyn StorageClient> = Arc::new(LocalStore::open(root, config.sys_name.as_deref()));
    store.init()?;

    let result = connect_and_serve(config, store.clone(), reporter);

    store.fini();
    result
}

fn connect_and_serve(
    config: &MountConfig,
    store: Arc<dyn StorageClient>,
    reporter: &mut StartupReporter,
) -> Result<(), StartError> {
    let registry = Registry::new(store.clone());
    let identity = identity::resolve(config, store.as_ref())?;

    let pool = match &identity.pool {
        StoreRef::Id(id) => registry.pool_connect(*id)?,
        StoreRef::Label(label) => registry.pool_connect_by_label(label)?,
    };
    let container = match &identity.container {
        StoreRef::Id(id) => registry.container_open(&pool, *id)?,
        StoreRef::Label(label) => registry.container_open_by_label(&pool, label)?,
    };
    info!(
        "Serving pool {} container {} (resolved from {:?})",
        container.pool_id(),
        container.id(),
        identity.source
    );

    // The container holds its own reference on the pool, so the initial
    // connection reference is dropped here.
    drop(pool);

    let table = ops::table_for(&container, store, config);
    if session::launch(config, table, reporter) {
        Ok(())
    } else {
        Err(StartError::Runtime(
            "session did not come down cleanly".to_string(),
        ))
    }
}

/// Prints a startup error, with usage where appropriate, and exits.
fn fail(err: StartError) -> ! {
    eprintln!("{err}");
    if err.is_usage() {
        let _ = Cli::command().print_help();
    }
    exit(err.exit_code());
}
