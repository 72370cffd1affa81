//! Orchestrator CLI (§6.4): `reg`/`end`/`clear` maintain the local
//! `clusterfence-resetd` watch set; `reset` drives a full reset
//! operation to DONE or FAILED.
//!
//! Flag defaults (`watchdog` on, `sysrq_reboot` off, `resource_mode`
//! off, `native_timeout` on) mirror `sanlk_reset.c`'s static defaults.

use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clusterfence_common::ResetConfig;
use clusterfence_lease::LeaseClient;
use clusterfence_reset::{res_to_str, str_to_res, Orchestrator, ResetFlags, ResetOutcome};

#[derive(Parser, Debug)]
#[command(name = "clusterfence-reset", version, about = "Cluster fencing reset orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML config file. Falls back to built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tell the local clusterfence-resetd to watch these lockspaces for reset events.
    Reg { lockspaces: Vec<String> },

    /// Tell the local clusterfence-resetd to stop watching these lockspaces.
    End { lockspaces: Vec<String> },

    /// Tell the local clusterfence-resetd to stop watching every lockspace.
    Clear,

    /// Reset another host through one or more lockspaces it is watching.
    Reset {
        /// `lockspace_name[:host_id]` tokens (max one lockspace per target).
        targets: Vec<String>,

        /// Target host id to reset, used for any target that omits its own `:host_id`.
        #[arg(short = 'i', long = "host-id")]
        host_id: Option<u64>,

        /// This host's own id in the targeted lockspaces, stamped as the
        /// event's `from_host_id` and used by the target's ack to address
        /// its RESETTING/REBOOTING reply back to us. Distinct from `-i`,
        /// which names the host being reset, not the requester.
        #[arg(long = "own-host-id")]
        own_host_id: u64,

        /// Enable (1) or disable (0) use of wdmd/watchdog.
        #[arg(short = 'w', long = "watchdog", default_value_t = 1)]
        watchdog: u8,

        /// Enable (1) or disable (0) use of /proc/sysrq-trigger to reboot.
        #[arg(short = 'b', long = "sysrq-reboot", default_value_t = 0)]
        sysrq_reboot: u8,

        /// Resource leases are used (1) or not used (0) to protect storage.
        #[arg(short = 'R', long = "resource-mode", default_value_t = 0)]
        resource_mode: u8,

        /// Enable (1) or disable (0) the native-timeout path. This is a
        /// toggle, not a seconds value: the derivation fixes T=90s/R=70s
        /// (§4.6) and there is no safe meaning for a shorter operator-
        /// supplied window, so one is never accepted.
        #[arg(short = 't', long = "native-timeout", default_value_t = 1)]
        native_timeout: u8,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ResetConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error loading config {path:?}: {e}");
                return ExitCode::from(2);
            }
        },
        None => ResetConfig::default(),
    };

    match cli.command {
        Command::Reg { lockspaces } => update_local_daemon(&config, "reg", &lockspaces),
        Command::End { lockspaces } => update_local_daemon(&config, "end", &lockspaces),
        Command::Clear => update_local_daemon(&config, "clear", &[]),
        Command::Reset {
            targets,
            host_id,
            own_host_id,
            watchdog,
            sysrq_reboot,
            resource_mode,
            native_timeout,
        } => run_reset(
            &config,
            &targets,
            host_id,
            own_host_id,
            watchdog,
            sysrq_reboot,
            resource_mode,
            native_timeout,
        ),
    }
}

/// `reg`/`end`/`clear`: one datagram per lockspace (or a single bare
/// `"clear"` datagram), grounded on `sanlk_reset.c::update_local_daemon`.
fn update_local_daemon(config: &ResetConfig, cmd: &str, lockspaces: &[String]) -> ExitCode {
    let socket = match UnixDatagram::unbound() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to create socket: {e}");
            return ExitCode::from(1);
        }
    };

    let targets: Vec<String> = if lockspaces.is_empty() {
        vec![String::new()]
    } else {
        lockspaces.to_vec()
    };

    for lockspace in &targets {
        let datagram = if lockspace.is_empty() {
            cmd.to_string()
        } else {
            format!("{cmd} {lockspace}")
        };
        match socket.send_to(datagram.as_bytes(), &config.resetd_socket_path) {
            Ok(_) => println!("Updated {datagram}"),
            Err(e) => {
                eprintln!("Failed to update local clusterfence-resetd: {e}");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::SUCCESS
}

#[allow(clippy::too_many_arguments)]
fn run_reset(
    config: &ResetConfig,
    targets: &[String],
    host_id: Option<u64>,
    own_host_id: u64,
    watchdog: u8,
    sysrq_reboot: u8,
    resource_mode: u8,
    native_timeout: u8,
) -> ExitCode {
    if targets.is_empty() {
        eprintln!("lockspace_name is required");
        return ExitCode::from(2);
    }
    if targets.len() > 1 && host_id.is_some() {
        eprintln!("-i is only allowed with a single lockspace_name");
        return ExitCode::from(2);
    }

    let mut parsed = Vec::with_capacity(targets.len());
    for raw in targets {
        match str_to_res(raw) {
            Ok(mut target) => {
                if target.host_id.is_none() {
                    target.host_id = host_id;
                }
                if target.host_id.is_none() {
                    eprintln!("invalid host_id for target {}", res_to_str(&target));
                    return ExitCode::from(2);
                }
                parsed.push(target);
            }
            Err(e) => {
                eprintln!("invalid target {raw:?}: {e}");
                return ExitCode::from(2);
            }
        }
    }

    let engine = match LeaseClient::connect(&config.lease_socket_path) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to connect to lease daemon at {:?}: {e}", config.lease_socket_path);
            return ExitCode::from(1);
        }
    };

    let flags = ResetFlags {
        use_watchdog: watchdog != 0,
        use_reboot: sysrq_reboot != 0,
        resource_mode: resource_mode != 0,
        native_timeout: native_timeout != 0,
    };

    let mut orchestrator = match Orchestrator::reset(engine, &parsed, own_host_id, flags, 0) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("No lockspaces could be registered: {e}");
            return ExitCode::from(1);
        }
    };

    let outcome = orchestrator.run();
    orchestrator.close();

    match outcome {
        ResetOutcome::Done { reason } => {
            println!("reset done: {reason}");
            ExitCode::SUCCESS
        }
        ResetOutcome::Failed { reason } => {
            eprintln!("reset failed: {reason}");
            ExitCode::from(1)
        }
    }
}
