//! WDM test loop (§4.2).
//!
//! Runs a TEST PASS at most once per `test_interval`: tallies failures
//! from file tests, script tests, and client tests, then either pets the
//! watchdog (zero failures) or performs an unclean close (one or more
//! failures) and shortens the interval to `RECOVER_TEST_INTERVAL` so a
//! subsequent recovery can reopen the device in time.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::client_table::ClientTable;
use crate::device::{DeviceState, WatchdogDevice};
use crate::file_tests::{self, FileTest};
use crate::scripts::ScriptRunner;

/// Default period between test passes (§4.2).
pub const DEFAULT_TEST_INTERVAL_SECS: u64 = 10;

/// Shortened period used after a failure, so a subsequent recovery can
/// reopen the device before `fire_timeout` elapses (§4.2).
pub const RECOVER_TEST_INTERVAL_SECS: u64 = 1;

/// Floor under the computed sleep between ticks (§4.2 step c).
pub const MIN_SLEEP: Duration = Duration::from_millis(500);

/// Configuration the test loop needs beyond the watchdog device itself.
#[derive(Debug, Clone)]
pub struct TestLoopConfig {
    pub test_interval: Duration,
    pub files_dir: Option<PathBuf>,
    pub scripts_dir: Option<PathBuf>,
    pub kill_script_after: Option<Duration>,
}

impl Default for TestLoopConfig {
    fn default() -> Self {
        Self {
            test_interval: Duration::from_secs(DEFAULT_TEST_INTERVAL_SECS),
            files_dir: None,
            scripts_dir: None,
            kill_script_after: None,
        }
    }
}

/// Outcome of a single test pass, returned for logging and metrics.
#[derive(Debug, Clone)]
pub struct TestPassOutcome {
    pub file_failures: usize,
    pub script_failures: usize,
    pub client_failures: usize,
    pub total_failures: usize,
    pub device_action: DeviceAction,
    pub next_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Petted,
    ClosedUnclean,
    ReopenedAndPetted,
    NoDeviceConfigured,
}

/// Drives client, file, and script tests against the configured watchdog
/// device. Owns the [`ClientTable`] and (optionally) a [`ScriptRunner`];
/// the caller (the socket server in `clusterfence-wdmd`) owns I/O and
/// calls [`TestLoop::maybe_run_pass`] once per tick.
pub struct TestLoop {
    config: TestLoopConfig,
    clients: ClientTable,
    scripts: Option<ScriptRunner>,
    device: Option<WatchdogDevice>,
    last_test_time: u64,
    current_interval: Duration,
}

impl TestLoop {
    #[must_use]
    pub fn new(config: TestLoopConfig, device: Option<WatchdogDevice>) -> Self {
        let scripts = config.scripts_dir.as_deref().map(ScriptRunner::scan);
        let current_interval = config.test_interval;
        Self {
            config,
            clients: ClientTable::new(),
            scripts,
            device,
            last_test_time: 0,
            current_interval,
        }
    }

    #[must_use]
    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut ClientTable {
        &mut self.clients
    }

    #[must_use]
    pub fn device(&self) -> Option<&WatchdogDevice> {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut WatchdogDevice> {
        self.device.as_mut()
    }

    /// Whether a clean shutdown is currently permitted (§5 "The WDM
    /// honors [signals] ONLY when `active_clients()` is false").
    #[must_use]
    pub fn can_shut_down(&self) -> bool {
        !self.clients.active_clients()
    }

    /// Run a test pass if `now >= last_test_time + current_interval`
    /// (§4.2 step b); otherwise do nothing. Returns the outcome when a
    /// pass ran.
    pub fn maybe_run_pass(&mut self, now: u64) -> Option<TestPassOutcome> {
        if now < self.last_test_time + self.current_interval.as_secs() {
            return None;
        }
        Some(self.run_pass(now))
    }

    /// Compute how long to sleep until the next test boundary, bounded
    /// below by [`MIN_SLEEP`] (§4.2 step c).
    #[must_use]
    pub fn sleep_budget(&self, now: u64) -> Duration {
        let next_boundary = self.last_test_time + self.current_interval.as_secs();
        let remaining = next_boundary.saturating_sub(now);
        Duration::from_secs(remaining).max(MIN_SLEEP)
    }

    fn run_pass(&mut self, now: u64) -> TestPassOutcome {
        let test_interval_secs = self.config.test_interval.as_secs();

        let file_failures = self.run_file_tests(now);
        let script_failures = self.run_script_tests(now, test_interval_secs);
        let client_failures = self.run_client_tests(now, test_interval_secs);
        let total_failures = file_failures + script_failures + client_failures;

        let device_action = if total_failures == 0 {
            self.on_pass_clean()
        } else {
            self.on_pass_failed(total_failures)
        };

        self.last_test_time = now;
        let outcome = TestPassOutcome {
            file_failures,
            script_failures,
            client_failures,
            total_failures,
            device_action,
            next_interval: self.current_interval,
        };
        info!(?outcome, "test pass complete");
        outcome
    }

    fn run_file_tests(&self, now: u64) -> usize {
        let Some(dir) = &self.config.files_dir else {
            return 0;
        };
        let (tests, errors) = file_tests::scan(dir);
        for e in &errors {
            warn!(error = %e, "file test scan error");
        }
        tests.iter().filter(|t: &&FileTest| file_tests::has_failed(t, now)).count()
    }

    fn run_script_tests(&mut self, now: u64, test_interval: u64) -> usize {
        let Some(scripts) = self.scripts.as_mut() else {
            return 0;
        };
        let budget = self.config.test_interval.saturating_sub(Duration::from_secs(1));
        scripts.run_pass(now, test_interval, budget, self.config.kill_script_after)
    }

    /// §4.2 step 3: client tests, including the mandatory EARLY failure
    /// one interval before the true expire.
    fn run_client_tests(&self, now: u64, test_interval: u64) -> usize {
        self.clients
            .clients_with_expire()
            .filter(|(_, slot)| {
                now >= slot.expire || now >= slot.expire.saturating_sub(test_interval)
            })
            .count()
    }

    fn on_pass_clean(&mut self) -> DeviceAction {
        self.current_interval = self.config.test_interval;
        match self.device.as_mut() {
            None => DeviceAction::NoDeviceConfigured,
            Some(dev) if dev.state() == DeviceState::ArmedUnclean => {
                match dev.reopen() {
                    Ok(()) => match dev.keepalive() {
                        Ok(()) => DeviceAction::ReopenedAndPetted,
                        Err(e) => {
                            warn!(error = %e, "keepalive failed right after reopen");
                            DeviceAction::ClosedUnclean
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to reopen watchdog device during recovery");
                        DeviceAction::ClosedUnclean
                    }
                }
            }
            Some(dev) => match dev.keepalive() {
                Ok(()) => DeviceAction::Petted,
                Err(e) => {
                    warn!(error = %e, "keepalive failed, treating as a failed pass");
                    dev.close_unclean();
                    self.current_interval = Duration::from_secs(RECOVER_TEST_INTERVAL_SECS);
                    DeviceAction::ClosedUnclean
                }
            },
        }
    }

    fn on_pass_failed(&mut self, failure_count: usize) -> DeviceAction {
        warn!(failure_count, "test pass failed, not petting watchdog");
        self.current_interval = Duration::from_secs(RECOVER_TEST_INTERVAL_SECS);
        match self.device.as_mut() {
            None => DeviceAction::NoDeviceConfigured,
            Some(dev) => {
                if dev.state() != DeviceState::Closed {
                    dev.close_unclean();
                }
                DeviceAction::ClosedUnclean
            }
        }
    }
}
