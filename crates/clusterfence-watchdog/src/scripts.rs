//! Cross-host script tests (§3 "Cross-host script", §4.2 step 2).
//!
//! Each registered script gets a slot tracking the currently-running
//! child (if any), its last result, and run/fail/good/kill/long counters.
//! A non-zero exit, a signal termination, or a child still running at the
//! wait deadline each count as one test-pass failure, equivalent to a
//! client expiration for the purpose of the pet/no-pet decision.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

/// Upper bound on the number of scripts a single daemon will run,
/// matching the reference implementation's static table size.
pub const MAX_SCRIPTS: usize = 8;

/// Outcome of a script's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptResult {
    /// Never run yet.
    #[default]
    None,
    /// Exited zero.
    Good,
    /// Exited non-zero, killed by a signal, or timed out.
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCounters {
    pub run: u64,
    pub fail: u64,
    pub good: u64,
    pub killed: u64,
    pub long: u64,
}

/// One registered script test (§3).
#[derive(Debug)]
pub struct ScriptSlot {
    pub path: PathBuf,
    pub child: Option<Child>,
    pub last_result: ScriptResult,
    pub counters: ScriptCounters,
    /// Monotonic second the currently-running (or last-run) child started.
    pub start_time: Option<u64>,
}

impl ScriptSlot {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            child: None,
            last_result: ScriptResult::None,
            counters: ScriptCounters::default(),
            start_time: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

/// Directory scan results: every executable regular file becomes a
/// script slot, created once and never destroyed while the daemon runs
/// (§3 "Lifecycle summary").
pub struct ScriptRunner {
    slots: Vec<ScriptSlot>,
}

impl ScriptRunner {
    /// Scan `dir` for executable files, up to [`MAX_SCRIPTS`].
    #[must_use]
    pub fn scan(dir: &Path) -> Self {
        let mut slots = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if slots.len() >= MAX_SCRIPTS {
                    warn!(dir = ?dir, "more than MAX_SCRIPTS executables found, ignoring the rest");
                    break;
                }
                let path = entry.path();
                if is_executable(&path) {
                    slots.push(ScriptSlot::new(path));
                }
            }
        }
        Self { slots }
    }

    #[must_use]
    pub fn slots(&self) -> &[ScriptSlot] {
        &self.slots
    }

    /// Step 2 of a test pass: spawn any script that isn't running and is
    /// due, then reap whatever has finished within `budget`, killing
    /// stragglers after `kill_after` if configured. Returns the number of
    /// failures observed this pass.
    pub fn run_pass(&mut self, now: u64, test_interval: u64, budget: Duration, kill_after: Option<Duration>) -> usize {
        let due_threshold = test_interval.saturating_sub(1);

        for slot in &mut self.slots {
            if slot.is_running() {
                continue;
            }
            let due = slot.last_result == ScriptResult::Failed
                || slot
                    .start_time
                    .map_or(true, |start| now.saturating_sub(start) >= due_threshold);
            if !due {
                continue;
            }
            match Command::new(&slot.path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => {
                    slot.child = Some(child);
                    slot.start_time = Some(now);
                    slot.counters.run += 1;
                    debug!(path = ?slot.path, "script test started");
                }
                Err(e) => {
                    warn!(path = ?slot.path, error = %e, "failed to spawn script test");
                    slot.last_result = ScriptResult::Failed;
                    slot.counters.fail += 1;
                }
            }
        }

        let deadline = std::time::Instant::now() + budget;
        let mut failures = 0;

        loop {
            let mut any_running = false;
            for slot in &mut self.slots {
                let Some(child) = slot.child.as_mut() else {
                    continue;
                };
                any_running = true;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.child = None;
                        if status.success() {
                            slot.last_result = ScriptResult::Good;
                            slot.counters.good += 1;
                        } else {
                            slot.last_result = ScriptResult::Failed;
                            slot.counters.fail += 1;
                            failures += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = ?slot.path, error = %e, "error waiting for script child");
                        slot.child = None;
                        slot.last_result = ScriptResult::Failed;
                        slot.counters.fail += 1;
                        failures += 1;
                    }
                }
            }
            if !any_running || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Anything still running at the wait deadline counts as one
        // failure each (§4.2 step 2) and is optionally killed.
        for slot in &mut self.slots {
            if slot.child.is_none() {
                continue;
            }
            slot.last_result = ScriptResult::Failed;
            slot.counters.fail += 1;
            slot.counters.long += 1;
            failures += 1;

            if let Some(kill_after) = kill_after {
                let overdue = slot
                    .start_time
                    .is_some_and(|start| now.saturating_sub(start) >= kill_after.as_secs());
                if overdue {
                    if let Some(child) = slot.child.as_mut() {
                        if child.kill().is_ok() {
                            slot.counters.killed += 1;
                            warn!(path = ?slot.path, "script test exceeded kill_script_sec, SIGKILLed");
                        }
                        let _ = child.wait();
                        slot.child = None;
                    }
                }
            }
        }

        failures
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = path.metadata() else {
        return false;
    };
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn scan_finds_only_executables() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "good.sh", "#!/bin/sh\nexit 0\n");
        fs::write(dir.path().join("not_executable"), "hello").unwrap();

        let runner = ScriptRunner::scan(dir.path());
        assert_eq!(runner.slots().len(), 1);
        assert!(runner.slots()[0].path.ends_with("good.sh"));
    }

    #[test]
    fn successful_script_counts_as_good_with_no_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "good.sh", "#!/bin/sh\nexit 0\n");
        let mut runner = ScriptRunner::scan(dir.path());

        let failures = runner.run_pass(0, 10, Duration::from_secs(5), None);
        assert_eq!(failures, 0);
        assert_eq!(runner.slots()[0].last_result, ScriptResult::Good);
        assert_eq!(runner.slots()[0].counters.good, 1);
    }

    #[test]
    fn nonzero_exit_counts_as_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "bad.sh", "#!/bin/sh\nexit 1\n");
        let mut runner = ScriptRunner::scan(dir.path());

        let failures = runner.run_pass(0, 10, Duration::from_secs(5), None);
        assert_eq!(failures, 1);
        assert_eq!(runner.slots()[0].last_result, ScriptResult::Failed);
    }

    #[test]
    fn failed_script_is_rerun_before_its_next_due_tick() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "bad.sh", "#!/bin/sh\nexit 1\n");
        let mut runner = ScriptRunner::scan(dir.path());

        runner.run_pass(0, 10, Duration::from_secs(5), None);
        assert_eq!(runner.slots()[0].counters.run, 1);

        // Not due on time alone (only 1s elapsed of a 10s interval), but
        // last_result == Failed forces an immediate rerun.
        runner.run_pass(1, 10, Duration::from_secs(5), None);
        assert_eq!(runner.slots()[0].counters.run, 2);
    }
}
