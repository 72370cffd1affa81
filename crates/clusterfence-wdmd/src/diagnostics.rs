//! `DUMP_DEBUG` response body (§6.4 `wdmd --dump`).
//!
//! Grounded in `wdmd/main.c::dump_debug`: one daemon-summary line, then
//! one line per script slot, then one line per client slot, each a
//! fixed-format string terminated with `\n`. The response is built
//! fresh on every request rather than cached, since it only runs on an
//! operator's explicit `--dump` request.

use std::fmt::Write as _;

use clusterfence_watchdog::client_table::ClientTable;
use clusterfence_watchdog::scripts::ScriptRunner;

/// Upper bound on the dump body size, mirroring `DEBUG_SIZE` in the
/// reference daemon: callers stop appending lines once this would be
/// exceeded rather than growing the reply without bound.
pub const DUMP_DEBUG_MAX_LEN: usize = 64 * 1024;

pub struct DaemonSummary {
    pub pid: libc::pid_t,
    pub socket_gid: libc::gid_t,
    pub high_priority: bool,
    pub now: u64,
    pub last_keepalive: u64,
    pub last_close_unclean: u64,
    pub allow_scripts: bool,
    pub kill_script_sec: u64,
}

/// Build the full `DUMP_DEBUG` payload: summary line, script lines,
/// client lines, truncated to [`DUMP_DEBUG_MAX_LEN`] if needed.
#[must_use]
pub fn build(summary: &DaemonSummary, scripts: Option<&ScriptRunner>, clients: &ClientTable) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "wdmd {} socket_gid {} high_priority {} now {} last_keepalive {} last_closeunclean {} allow_scripts {} kill_script_sec {}",
        summary.pid,
        summary.socket_gid,
        u8::from(summary.high_priority),
        summary.now,
        summary.last_keepalive,
        summary.last_close_unclean,
        u8::from(summary.allow_scripts),
        summary.kill_script_sec,
    );

    if let Some(scripts) = scripts {
        for (i, slot) in scripts.slots().iter().enumerate() {
            let mut line = String::new();
            let _ = writeln!(
                line,
                "script {i} name {} pid {} now {} start {} last_result {} run {} fail {} good {} kill {} long {}",
                slot.path.display(),
                slot.child.as_ref().map_or(0, |c| c.id() as i64),
                summary.now,
                slot.start_time.unwrap_or(0),
                slot.last_result as u8,
                slot.counters.run,
                slot.counters.fail,
                slot.counters.good,
                slot.counters.killed,
                slot.counters.long,
            );
            if out.len() + line.len() >= DUMP_DEBUG_MAX_LEN {
                return out;
            }
            out.push_str(&line);
        }
    }

    for (i, (_, slot)) in clients.iter().enumerate() {
        let mut line = String::new();
        let _ = writeln!(
            line,
            "client {i} name {} pid {} dead {} ref {} now {} renewal {} expire {}",
            slot.name,
            slot.pid,
            u8::from(slot.pid_dead),
            u8::from(slot.refcount),
            summary.now,
            slot.renewal,
            slot.expire,
        );
        if out.len() + line.len() >= DUMP_DEBUG_MAX_LEN {
            return out;
        }
        out.push_str(&line);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> DaemonSummary {
        DaemonSummary {
            pid: 123,
            socket_gid: 0,
            high_priority: true,
            now: 1000,
            last_keepalive: 990,
            last_close_unclean: 0,
            allow_scripts: false,
            kill_script_sec: 10,
        }
    }

    #[test]
    fn summary_line_matches_reference_shape() {
        let clients = ClientTable::new();
        let body = build(&summary(), None, &clients);
        assert!(body.starts_with("wdmd 123 socket_gid 0 high_priority 1 now 1000"));
        assert!(body.contains("kill_script_sec 10"));
    }

    #[test]
    fn client_lines_are_appended_in_order() {
        let mut clients = ClientTable::new();
        let h = clients.register(42, "sanlock").unwrap();
        clients.test_live(h, 5, 200).unwrap();

        let body = build(&summary(), None, &clients);
        assert!(body.contains("client 0 name sanlock pid 42"));
        assert!(body.contains("renewal 5 expire 200"));
    }
}
