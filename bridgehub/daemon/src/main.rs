//! Bridgehub Daemon - Hub and Bridge Processes
//!
//! One binary, two modes. The hub reads the configuration, launches one
//! child per worker bridge (re-executing this binary in bridge mode) and
//! answers control requests on its own socket. A bridge serves its slice
//! of the accessory graph to the hub.
//!
//! # Usage
//!
//! ```bash
//! # Start the hub with the default config file
//! bridgehub-daemon hub
//!
//! # Explicit config, in the background
//! bridgehub-daemon --config /etc/bridgehub/config.toml hub --daemonize
//!
//! # Run one bridge by hand (the hub normally does this)
//! bridgehub-daemon bridge living-room 51826
//!
//! # Verbose logging
//! RUST_LOG=debug bridgehub-daemon hub
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (the hub stops every bridge first)
//! - `SIGHUP`: Hub re-reads its configuration file and reconciles

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use bridgehub_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConfigSource, HubConfig,
};

use server::{BridgeDaemon, BridgeExit, HubDaemon};

/// Bridgehub daemon - supervises and runs accessory bridges
#[derive(Parser, Debug)]
#[command(name = "bridgehub-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGEHUB_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "BRIDGEHUB_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the supervising hub
    Hub {
        /// PID file path
        #[arg(long, env = "BRIDGEHUB_PID_FILE", value_name = "PATH")]
        pid_file: Option<PathBuf>,

        /// Run as daemon (fork to background)
        #[arg(short = 'd', long)]
        daemonize: bool,
    },
    /// Run one bridge
    Bridge {
        /// Bridge id from the configuration
        id: String,
        /// Accessory protocol port
        port: u16,
    },
}

/// Resolve the config file path: `--config`, else the platform default
fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| match default_config_path() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "No configuration directory, running without a config file");
            None
        }
    })
}

/// Load the configuration and apply environment overrides
fn load(config_path: Option<&Path>) -> Result<HubConfig> {
    let (config, source) = match config_path {
        Some(path) => load_config_from_path(path)
            .with_context(|| format!("Failed to load config: {path:?}"))?,
        None => (HubConfig::default(), ConfigSource::Defaults),
    };
    if source == ConfigSource::Defaults {
        info!("Using default configuration");
    }
    let config = config.with_overrides(&ConfigOverrides::from_env());
    config
        .validate()
        .context("Environment overrides produced an invalid config")?;
    Ok(config)
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_hub(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    if kill(Pid::from_raw(pid), None).is_ok() {
        anyhow::bail!(
            "Another bridgehub hub is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "bridgehub_daemon={level},bridgehub_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Daemonize the process (fork to background)
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: called before the runtime starts any worker threads.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // SAFETY: as above.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

/// Route SIGTERM/SIGINT to `shutdown` and SIGHUP to `reload`
fn install_signal_handlers(shutdown: Arc<AtomicBool>, reload: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking config for reload");
                    reload.store(true, Ordering::SeqCst);
                }
            }
        }
    });
    Ok(())
}

async fn run_hub(
    config_path: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
) -> Result<()> {
    let config = load(config_path.as_deref())?;
    let pid_path = pid_file.unwrap_or_else(|| config.storage_path.join("hub.pid"));
    info!(pid_path = ?pid_path, storage = ?config.storage_path, "Hub paths");

    check_existing_hub(&pid_path)?;
    write_pid_file(&pid_path)?;

    let result = HubDaemon::new(config, config_path)
        .run(shutdown, reload)
        .await;

    remove_pid_file(&pid_path);
    result
}

async fn run_bridge(
    config_path: Option<PathBuf>,
    id: String,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let config = load(config_path.as_deref())?;
    let daemon = BridgeDaemon::new(config, &id, port);
    match daemon.run(shutdown).await? {
        BridgeExit::Restart => info!(bridge_id = %id, "Exiting for restart"),
        BridgeExit::Shutdown => info!(bridge_id = %id, "Bridge stopped"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    if let Mode::Hub { daemonize: true, .. } = args.mode {
        info!("Daemonizing...");
        daemonize()?;
    }

    info!("Bridgehub daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        install_signal_handlers(Arc::clone(&shutdown), Arc::clone(&reload))?;

        let config_path = resolve_config_path(args.config);
        let result = match args.mode {
            Mode::Hub { pid_file, .. } => run_hub(config_path, pid_file, shutdown, reload).await,
            Mode::Bridge { id, port } => run_bridge(config_path, id, port, shutdown).await,
        };

        match result {
            Ok(()) => {
                info!("Bridgehub daemon stopped cleanly");
                Ok(())
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "Daemon stopped with error");
                Err(e)
            }
        }
    })
}
