//! Watchdog multiplexer daemon entry point.
//!
//! Wires together every piece of `clusterfence-watchdog` into the
//! cooperative single-threaded service described in §4.2/§4.3/§5: a
//! sentinel guard against a prior unclean exit, an advisory-locked
//! pidfile, optional real-time scheduling, the hardware watchdog device,
//! the client table, and a `poll(2)`-driven loop over the listening
//! socket and every connected client. Grounded in `wdmd/main.c`'s
//! `main()`/`main_loop()`.

mod diagnostics;
mod signals;

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::{chown, Gid};
use tracing::{debug, error, info, warn};

use clusterfence_common::time::MonotonicClock;
use clusterfence_common::wire::{WireError, WireHeader, WIRE_HEADER_LEN};
use clusterfence_common::{Pidfile, RealtimeConfig, WdmdConfig};
use clusterfence_watchdog::client_table::{WdmOpcode, WdmRequestHeader, WDM_REQUEST_HEADER_LEN};
use clusterfence_watchdog::device::WatchdogDevice;
use clusterfence_watchdog::realtime::init_realtime;
use clusterfence_watchdog::sentinel::Sentinel;
use clusterfence_watchdog::test_loop::{TestLoop, TestLoopConfig};
use clusterfence_watchdog::SlotHandle;

use crate::diagnostics::DaemonSummary;

/// Largest request this daemon will read from a client, matching the
/// reference implementation's fixed per-connection buffer.
const MAX_MESSAGE_LEN: u32 = 4096;

#[derive(Parser, Debug)]
#[command(name = "wdmd", version, about = "Watchdog multiplexer daemon")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in the foreground with debug-level logging (`-D`).
    #[arg(short = 'D', long)]
    debug: bool,

    /// Toggle real-time scheduling and memory locking (`-H 0|1`).
    #[arg(short = 'H', long = "high-priority", value_name = "0|1")]
    high_priority: Option<u8>,

    /// Group name allowed to connect to the client socket (`-G`).
    #[arg(short = 'G', long = "group")]
    group: Option<String>,

    /// Allow script-based liveness tests in addition to file tests (`-S`).
    #[arg(short = 'S', long = "allow-scripts")]
    allow_scripts: bool,

    /// Directory of script tests, used when `-S` is set (`-s`).
    #[arg(short = 's', long = "scripts-dir")]
    scripts_dir: Option<PathBuf>,

    /// Seconds a script may run before it is killed (`-k`).
    #[arg(short = 'k', long = "kill-script-sec")]
    kill_script_sec: Option<u64>,

    /// Preferred watchdog device path, tried before the compiled-in
    /// defaults (`-w`).
    #[arg(short = 'w', long = "watchdog-path")]
    watchdog_path: Option<PathBuf>,

    /// Directory for the pidfile lock and saved watchdog path.
    #[arg(long, default_value = "/run/clusterfence")]
    run_dir: PathBuf,

    /// Open, configure, disarm, and close the watchdog device, print the
    /// path used, then exit without entering the service loop (§4.1
    /// probe mode).
    #[arg(long)]
    probe: bool,

    /// Connect to a running daemon's socket, request `DUMP_DEBUG`, print
    /// the reply, and exit.
    #[arg(long)]
    dump: bool,

    /// Run with no hardware watchdog device at all. Loudly logged: this
    /// is an explicit loss-of-safety test mode (spec Non-goals), never a
    /// silent fallback from a failed `open_first_available`.
    #[arg(long = "test-mode-no-watchdog")]
    test_mode_no_watchdog: bool,
}

fn init_logging(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_target(true)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let mut config = match &args.config {
        Some(path) => WdmdConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path:?}"))?,
        None => WdmdConfig::default(),
    };
    apply_overrides(&mut config, &args);

    if args.probe {
        return run_probe(&config);
    }
    if args.dump {
        return run_dump(&config);
    }
    run_daemon(&config, &args)
}

fn apply_overrides(config: &mut WdmdConfig, args: &Args) {
    if let Some(ref group) = args.group {
        config.socket_group = Some(group.clone());
    }
    if args.allow_scripts {
        config.allow_scripts = true;
    }
    if let Some(ref dir) = args.scripts_dir {
        config.scripts_dir = Some(dir.clone());
    }
    if let Some(secs) = args.kill_script_sec {
        config.kill_script_timeout = Duration::from_secs(secs);
    }
    if let Some(ref path) = args.watchdog_path {
        config.watchdog_path = Some(path.clone());
    }
    if let Some(hp) = args.high_priority {
        config.realtime.enabled = hp != 0;
    }
    if args.debug {
        config.debug = true;
    }
}

/// `wdmd --probe` (§4.1 probe mode, §6.4).
fn run_probe(config: &WdmdConfig) -> Result<()> {
    let saved = clusterfence_watchdog::device::saved_path::read(&PathBuf::from("/run/clusterfence"));
    let path = WatchdogDevice::probe(saved.as_deref(), config.watchdog_path.as_deref(), config.fire_timeout)
        .context("probe failed: no usable watchdog device")?;
    println!("{}", path.display());
    Ok(())
}

/// `wdmd --dump`: a one-shot `DUMP_DEBUG` client against a running
/// daemon's socket.
fn run_dump(config: &WdmdConfig) -> Result<()> {
    let mut stream = UnixStream::connect(&config.socket_path)
        .with_context(|| format!("failed to connect to {:?}", config.socket_path))?;

    let body = WdmRequestHeader {
        name: String::new(),
        renewal: 0,
        expire: 0,
    }
    .to_bytes();
    let request = WireHeader::new(WdmOpcode::DumpDebug as u16, 0, body.len() as u32, 0, 0);
    stream.write_all(&request.to_bytes())?;
    stream.write_all(&body)?;

    let reply = WireHeader::read_from(&mut stream, 256 * 1024)?;
    let mut payload = vec![0u8; reply.payload_len() as usize];
    stream.read_exact(&mut payload)?;
    if reply.data != 0 {
        anyhow::bail!("daemon reported error status {}", reply.data);
    }
    print!("{}", String::from_utf8_lossy(&payload));
    Ok(())
}

fn resolve_group_gid(name: &str) -> Option<libc::gid_t> {
    let cname = std::ffi::CString::new(name).ok()?;
    // SAFETY: `cname` outlives the call; `getgrnam` returns a pointer into
    // static/thread-local storage we only read before the next libc call.
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        None
    } else {
        // SAFETY: non-null `grp` was just returned by `getgrnam`.
        Some(unsafe { (*grp).gr_gid })
    }
}

struct Connection {
    stream: UnixStream,
    handle: Option<SlotHandle>,
}

/// Runs the full service loop: accept, serve client I/O, run test passes,
/// honor shutdown once it is safe (§4.2, §5).
fn run_daemon(config: &WdmdConfig, args: &Args) -> Result<()> {
    let sentinel = Sentinel::create().context(
        "sentinel object /wdmd already exists: refusing to start (see --test-mode-no-watchdog \
         only if you understand this bypasses the safety-of-self guarantee)",
    )?;
    let _pidfile = Pidfile::acquire(&args.run_dir, "wdmd").context("failed to acquire pidfile lock")?;

    let realtime_status = match init_realtime(&config.realtime) {
        Ok(status) => Some(status),
        Err(e) => {
            error!(error = %e, "real-time setup failed under fail_fast");
            sentinel.release();
            return Err(e.into());
        }
    };
    info!(?realtime_status, "real-time setup complete");

    let device = if args.test_mode_no_watchdog {
        warn!(
            "TEST MODE: running with no hardware watchdog device. The safety commitment in \
             §4.2 of the fencing design does not hold. Never use this outside a test harness."
        );
        None
    } else {
        let saved = clusterfence_watchdog::device::saved_path::read(&args.run_dir);
        match WatchdogDevice::open_first_available(
            saved.as_deref(),
            config.watchdog_path.as_deref(),
            config.fire_timeout,
        ) {
            Ok(dev) => {
                if let Some(path) = dev.path() {
                    clusterfence_watchdog::device::saved_path::write(&args.run_dir, path);
                }
                Some(dev)
            }
            Err(e) => {
                error!(error = %e, "no usable watchdog device found; refusing to start");
                sentinel.release();
                anyhow::bail!(e);
            }
        }
    };

    let test_loop_config = TestLoopConfig {
        test_interval: config.test_interval,
        files_dir: config.files_dir.clone(),
        scripts_dir: if config.allow_scripts {
            config.scripts_dir.clone()
        } else {
            None
        },
        kill_script_after: Some(config.kill_script_timeout),
    };
    let mut test_loop = TestLoop::new(test_loop_config, device);

    let listener = bind_socket(config)?;
    listener.set_nonblocking(true)?;

    let signals = signals::SignalHandler::install().context("failed to install signal handlers")?;
    let clock = MonotonicClock::new();
    let start = clock.now_secs();
    let mut last_keepalive = 0u64;
    let mut last_close_unclean = 0u64;

    let mut connections: HashMap<RawFd, Connection> = HashMap::new();

    info!(socket = ?config.socket_path, test_interval = ?config.test_interval, fire_timeout = ?config.fire_timeout, "wdmd started");

    loop {
        if signals.shutdown_requested() {
            if test_loop.can_shut_down() {
                info!("shutdown requested and no active clients remain; exiting cleanly");
                break;
            }
            warn!("shutdown requested but refused: active clients or orphan-armed slots remain");
        }

        let now = clock.now_secs();
        service_readiness(
            &listener,
            &mut connections,
            &mut test_loop,
            config,
            now,
            last_keepalive,
            last_close_unclean,
        )?;

        if let Some(outcome) = test_loop.maybe_run_pass(now) {
            use clusterfence_watchdog::test_loop::DeviceAction;
            match outcome.device_action {
                DeviceAction::Petted | DeviceAction::ReopenedAndPetted => last_keepalive = now,
                DeviceAction::ClosedUnclean => last_close_unclean = now,
                DeviceAction::NoDeviceConfigured => {}
            }
            debug!(?outcome, "test pass");
        }

        if signals.take_rescan_request() {
            info!("SIGHUP: scripts rescan is handled on next daemon restart in this build");
        }
    }

    if let Some(dev) = test_loop.device_mut() {
        let _ = dev.close_clean();
    }
    let _ = std::fs::remove_file(&config.socket_path);
    sentinel.release();

    let _ = (start, realtime_status);
    info!("wdmd shutdown complete");
    Ok(())
}

fn bind_socket(config: &WdmdConfig) -> Result<UnixListener> {
    let _ = std::fs::remove_file(&config.socket_path);
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {parent:?}"))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {:?}", config.socket_path))?;

    std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to chmod {:?}", config.socket_path))?;

    if let Some(ref group) = config.socket_group {
        match resolve_group_gid(group) {
            Some(gid) => {
                if let Err(e) = chown(&config.socket_path, None, Some(Gid::from_raw(gid))) {
                    warn!(error = %e, group, "failed to chown socket to configured group");
                }
            }
            None => warn!(group, "socket group name did not resolve; leaving gid 0"),
        }
    }

    Ok(listener)
}

/// One pass of readiness-driven I/O: accept new connections, service
/// pending reads on existing ones, drop closed ones per §4.3 disconnect
/// semantics. Blocks for at most `test_loop.sleep_budget(now)` (§4.2 step
/// c).
#[allow(clippy::too_many_arguments)]
fn service_readiness(
    listener: &UnixListener,
    connections: &mut HashMap<RawFd, Connection>,
    test_loop: &mut TestLoop,
    config: &WdmdConfig,
    now: u64,
    last_keepalive: u64,
    last_close_unclean: u64,
) -> Result<()> {
    let mut fds: Vec<PollFd> = Vec::with_capacity(1 + connections.len());
    fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
    let conn_fds: Vec<RawFd> = connections.keys().copied().collect();
    for &fd in &conn_fds {
        // SAFETY: the fd stays open and owned by `connections` for the
        // duration of this poll call.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
    }

    let budget = test_loop.sleep_budget(now);
    let millis = budget.as_millis().min(u128::from(u16::MAX)) as u16;
    let timeout = PollTimeout::from(millis);
    match poll(&mut fds, timeout) {
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "poll failed");
            return Ok(());
        }
    }

    if let Some(revents) = fds[0].revents() {
        if revents.contains(PollFlags::POLLIN) {
            accept_new_connections(listener, connections, test_loop);
        }
    }

    for (i, &fd) in conn_fds.iter().enumerate() {
        let Some(revents) = fds[i + 1].revents() else {
            continue;
        };
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            service_one_connection(
                fd,
                connections,
                test_loop,
                config,
                now,
                last_keepalive,
                last_close_unclean,
            );
        }
    }
    Ok(())
}

fn accept_new_connections(
    listener: &UnixListener,
    connections: &mut HashMap<RawFd, Connection>,
    _test_loop: &mut TestLoop,
) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let fd = stream.as_raw_fd();
                debug!(fd, "accepted wdmd client connection");
                connections.insert(fd, Connection { stream, handle: None });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn peer_pid(stream: &UnixStream) -> libc::pid_t {
    getsockopt(stream, PeerCredentials)
        .map(|cred| cred.pid())
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn service_one_connection(
    fd: RawFd,
    connections: &mut HashMap<RawFd, Connection>,
    test_loop: &mut TestLoop,
    config: &WdmdConfig,
    now: u64,
    last_keepalive: u64,
    last_close_unclean: u64,
) {
    let Some(conn) = connections.get_mut(&fd) else {
        return;
    };

    match read_request(&mut conn.stream) {
        Ok(Some((header, body))) => {
            handle_request(
                fd,
                connections,
                test_loop,
                config,
                now,
                last_keepalive,
                last_close_unclean,
                header,
                body,
            );
        }
        Ok(None) => {
            // Peer closed the connection: §4.3 disconnect semantics.
            if let Some(conn) = connections.remove(&fd) {
                if let Some(handle) = conn.handle {
                    test_loop.clients_mut().disconnect(handle);
                }
            }
        }
        Err(e) => {
            warn!(fd, error = %e, "client protocol error; dropping connection");
            if let Some(conn) = connections.remove(&fd) {
                if let Some(handle) = conn.handle {
                    test_loop.clients_mut().disconnect(handle);
                }
            }
        }
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Option<(WireHeader, WdmRequestHeader)>, WireError> {
    let mut header_buf = [0u8; WIRE_HEADER_LEN];
    match stream.read(&mut header_buf) {
        Ok(0) => return Ok(None),
        Ok(n) if n < WIRE_HEADER_LEN => {
            stream.read_exact(&mut header_buf[n..])?;
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = WireHeader::from_bytes(&header_buf, MAX_MESSAGE_LEN)?;

    let mut body_buf = [0u8; WDM_REQUEST_HEADER_LEN];
    let want = header.payload_len() as usize;
    if want != WDM_REQUEST_HEADER_LEN {
        return Err(WireError::LengthTooShort { declared: header.length });
    }
    stream.read_exact(&mut body_buf)?;
    Ok(Some((header, WdmRequestHeader::from_bytes(&body_buf))))
}

#[allow(clippy::too_many_arguments)]
fn handle_request(
    fd: RawFd,
    connections: &mut HashMap<RawFd, Connection>,
    test_loop: &mut TestLoop,
    config: &WdmdConfig,
    now: u64,
    last_keepalive: u64,
    last_close_unclean: u64,
    header: WireHeader,
    body: WdmRequestHeader,
) {
    let Some(opcode) = WdmOpcode::from_u16(header.cmd) else {
        reply(connections, fd, header.cmd, 1, &[]);
        return;
    };

    let status_and_payload: (u32, Vec<u8>) = match opcode {
        WdmOpcode::Register => {
            let pid = connections
                .get(&fd)
                .map(|c| peer_pid(&c.stream))
                .unwrap_or(0);
            match test_loop.clients_mut().register(pid, &body.name) {
                Ok(handle) => {
                    if let Some(conn) = connections.get_mut(&fd) {
                        conn.handle = Some(handle);
                    }
                    (0, Vec::new())
                }
                Err(e) => {
                    warn!(fd, error = %e, "register failed");
                    (1, Vec::new())
                }
            }
        }
        WdmOpcode::TestLive => match connections.get(&fd).and_then(|c| c.handle) {
            Some(handle) => match test_loop.clients_mut().test_live(handle, body.renewal, body.expire) {
                Ok(()) => (0, Vec::new()),
                Err(e) => {
                    warn!(fd, error = %e, "test_live rejected");
                    (1, Vec::new())
                }
            },
            None => (2, Vec::new()),
        },
        WdmOpcode::RefcountSet | WdmOpcode::RefcountClear => {
            match connections.get(&fd).and_then(|c| c.handle) {
                Some(handle) => {
                    let on = matches!(opcode, WdmOpcode::RefcountSet);
                    match test_loop.clients_mut().set_refcount(handle, on) {
                        Ok(()) => (0, Vec::new()),
                        Err(_) => (1, Vec::new()),
                    }
                }
                None => (2, Vec::new()),
            }
        }
        WdmOpcode::Status => match connections.get(&fd).and_then(|c| c.handle) {
            Some(handle) => match test_loop.clients().get(handle) {
                Some(slot) => {
                    let reply_body = WdmRequestHeader {
                        name: slot.name.clone(),
                        renewal: slot.renewal,
                        expire: slot.expire,
                    };
                    (0, reply_body.to_bytes().to_vec())
                }
                None => (2, Vec::new()),
            },
            None => (2, Vec::new()),
        },
        WdmOpcode::DumpDebug => {
            let summary = DaemonSummary {
                pid: std::process::id() as libc::pid_t,
                socket_gid: config
                    .socket_group
                    .as_deref()
                    .and_then(resolve_group_gid)
                    .unwrap_or(0),
                high_priority: config.realtime.enabled,
                now,
                last_keepalive,
                last_close_unclean,
                allow_scripts: config.allow_scripts,
                kill_script_sec: config.kill_script_timeout.as_secs(),
            };
            let body_text = diagnostics::build(&summary, None, test_loop.clients());
            (0, body_text.into_bytes())
        }
    };

    let (status, payload) = status_and_payload;
    reply(connections, fd, header.cmd, status, &payload);
}

fn reply(connections: &mut HashMap<RawFd, Connection>, fd: RawFd, cmd: u16, status: u32, payload: &[u8]) {
    let Some(conn) = connections.get_mut(&fd) else {
        return;
    };
    let header = WireHeader::new(cmd, 0, payload.len() as u32, status, 0);
    if let Err(e) = conn.stream.write_all(&header.to_bytes()) {
        warn!(fd, error = %e, "failed to write reply header");
        return;
    }
    if !payload.is_empty() {
        if let Err(e) = conn.stream.write_all(payload) {
            warn!(fd, error = %e, "failed to write reply payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_defaults() {
        let args = Args::parse_from(["wdmd"]);
        assert!(!args.debug);
        assert!(!args.probe);
        assert!(!args.test_mode_no_watchdog);
    }

    #[test]
    fn args_parse_probe_and_overrides() {
        let args = Args::parse_from(["wdmd", "--probe", "-D", "-G", "sanlock", "-S", "-k", "5"]);
        assert!(args.probe);
        assert!(args.debug);
        assert_eq!(args.group.as_deref(), Some("sanlock"));
        assert!(args.allow_scripts);
        assert_eq!(args.kill_script_sec, Some(5));
    }

    #[test]
    fn apply_overrides_merges_cli_onto_config() {
        let mut config = WdmdConfig::default();
        let args = Args::parse_from(["wdmd", "-S", "-s", "/etc/clusterfence/scripts", "-k", "7"]);
        apply_overrides(&mut config, &args);
        assert!(config.allow_scripts);
        assert_eq!(config.scripts_dir, Some(PathBuf::from("/etc/clusterfence/scripts")));
        assert_eq!(config.kill_script_timeout, Duration::from_secs(7));
    }
}
