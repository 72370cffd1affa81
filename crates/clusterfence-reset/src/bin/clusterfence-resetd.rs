//! Target-side reset watcher daemon.
//!
//! Wraps [`clusterfence_reset::Watcher`] with a real [`LeaseClient`] and a
//! UNIX datagram control socket that `clusterfence-reset reg|end|clear`
//! talks to, grounded on `sanlk_reset.c`'s `update_local_daemon` /
//! `setup_resetd_socket` (one `"<cmd> <lockspace>"` datagram per
//! lockspace, `"clear all"` to drop the whole watch set).

use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use clusterfence_common::{Pidfile, ResetConfig};
use clusterfence_lease::LeaseClient;
use clusterfence_reset::{ResetdConfig, Watcher};

/// Largest control datagram this daemon will read, matching the
/// reference `UPDATE_SIZE` buffer.
const MAX_DATAGRAM_LEN: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "clusterfence-resetd", version, about = "Target-side reset event watcher")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This host's own id, used to recognize events addressed to it.
    #[arg(long)]
    host_id: u64,

    /// Directory for the pidfile lock.
    #[arg(long, default_value = "/run/clusterfence")]
    run_dir: PathBuf,

    /// Run with debug-level logging.
    #[arg(short = 'D', long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = match &args.config {
        Some(path) => ResetConfig::from_file(path)?,
        None => ResetConfig::default(),
    };

    let _pidfile = Pidfile::acquire(&args.run_dir, "clusterfence-resetd")?;

    let engine = LeaseClient::connect(&config.lease_socket_path)
        .map_err(|e| anyhow::anyhow!("connecting to lease daemon at {:?}: {e}", config.lease_socket_path))?;
    let resetd_config = ResetdConfig {
        own_host_id: args.host_id,
        wdm_socket_path: config.wdm_socket_path.clone(),
        sysrq_trigger_path: config.sysrq_trigger_path.clone(),
    };
    let mut watcher = Watcher::new(engine, resetd_config);

    let _ = std::fs::remove_file(&config.resetd_socket_path);
    if let Some(parent) = config.resetd_socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let control = UnixDatagram::bind(&config.resetd_socket_path)?;
    control.set_read_timeout(Some(clusterfence_reset::orchestrator::POLL_PERIOD))?;

    let shutdown = install_shutdown_handler();
    tracing::info!(host_id = args.host_id, socket = ?config.resetd_socket_path, "clusterfence-resetd started");

    let clock = clusterfence_common::time::MonotonicClock::new();
    while !shutdown.load(Ordering::Relaxed) {
        drain_control_commands(&control, &mut watcher);

        match watcher.poll_once(clock.now_secs()) {
            Ok(reactions) => {
                for reaction in reactions {
                    tracing::warn!(?reaction, "reacted to inbound reset event");
                }
            }
            Err(e) => tracing::warn!(error = %e, "poll_once failed"),
        }
    }

    tracing::info!("clusterfence-resetd shutting down");
    let _ = std::fs::remove_file(&config.resetd_socket_path);
    Ok(())
}

fn drain_control_commands(control: &UnixDatagram, watcher: &mut Watcher<LeaseClient>) {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    loop {
        match control.recv(&mut buf) {
            Ok(n) => apply_command(watcher, &buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading control socket");
                break;
            }
        }
    }
}

fn apply_command(watcher: &mut Watcher<LeaseClient>, datagram: &[u8]) {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim_end_matches('\0').trim();
    let mut parts = text.split_whitespace();
    let Some(cmd) = parts.next() else { return };

    let result = match cmd {
        "reg" => parts
            .next()
            .map(|lockspace| watcher.watch(lockspace))
            .unwrap_or(Ok(())),
        "end" => parts
            .next()
            .map(|lockspace| watcher.unwatch(lockspace))
            .unwrap_or(Ok(())),
        "clear" => watcher.clear(),
        other => {
            tracing::warn!(cmd = other, "unknown control command");
            return;
        }
    };
    if let Err(e) = result {
        tracing::warn!(cmd, error = %e, "control command failed");
    } else {
        tracing::info!(cmd, "applied control command");
    }
}

static SIGNALED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_: libc::c_int) {
    SIGNALED.store(true, Ordering::Relaxed);
}

/// Install SIGTERM/SIGINT handlers and relay the process-wide flag they
/// set into a shared `AtomicBool` the main loop polls each tick.
fn install_shutdown_handler() -> Arc<AtomicBool> {
    // SAFETY: on_term only performs an atomic store and is installed once
    // at startup before the control socket is created.
    unsafe {
        libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_term as libc::sighandler_t);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let relay = Arc::clone(&shutdown);
    std::thread::spawn(move || loop {
        if SIGNALED.load(Ordering::Relaxed) {
            relay.store(true, Ordering::Relaxed);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
    shutdown
}
