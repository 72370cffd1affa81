//! Real-time scheduling and memory locking for the watchdog multiplexer.
//!
//! §5 asks for these "advisory" on startup: `SCHED_RR` at the maximum
//! allowed priority with `SCHED_RESET_ON_FORK`, and `mlockall` to keep the
//! daemon's pages resident. Neither is required for correctness — the
//! safety commitment in §4.2/§4.3 holds regardless — but both reduce the
//! odds that the daemon itself is the reason a test pass runs late.
//! Failure to obtain either is logged and the daemon continues, unless
//! `fail_fast` is set.

#![allow(unused_imports)] // platform-specific code may not use every import

use clusterfence_common::{CpuAffinity, RealtimeConfig, SchedPolicy};
use tracing::{debug, info, warn};

/// Errors from real-time setup. Only returned when `fail_fast` is set;
/// otherwise these are logged as warnings and setup continues.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("{0}")]
    Unmet(String),
}

/// Result of attempting real-time initialization.
#[derive(Debug, Clone, Default)]
pub struct RealtimeStatus {
    pub memory_locked: bool,
    pub stack_prefaulted: usize,
    pub scheduler_policy: Option<SchedPolicy>,
    pub scheduler_priority: Option<i32>,
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply `config` to the calling thread/process. Degrades gracefully
/// (§5: "These are advisory; they must degrade gracefully") unless
/// `config.fail_fast` is set, in which case unmet requirements are an
/// error the daemon should refuse to start on.
pub fn init_realtime(config: &RealtimeConfig) -> Result<RealtimeStatus, RealtimeError> {
    if !config.enabled {
        info!("real-time scheduling disabled (-H 0)");
        return Ok(RealtimeStatus::default());
    }

    if config.fail_fast {
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory()
    } else {
        false
    };
    let stack_prefaulted = prefault_stack(config.prefault_stack_size);
    let (scheduler_policy, scheduler_priority) = set_scheduler(config);
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity);

    let status = RealtimeStatus {
        memory_locked,
        stack_prefaulted,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "real-time setup complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> bool {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("mlockall succeeded");
            true
        }
        Err(e) => {
            warn!("mlockall failed ({e}), continuing without memory locking");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> bool {
    warn!("mlockall not available on this platform");
    false
}

/// Touch `size` bytes of stack so the first real test pass (§4.2) doesn't
/// take a page fault on the way to an unclean close.
fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    prefault_stack_recursive(size, 0)
}

#[inline(never)]
fn prefault_stack_recursive(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 4096;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut buffer = [0u8; FRAME_SIZE];
    // SAFETY: writing into our own stack allocation.
    unsafe {
        std::ptr::write_volatile(buffer.as_mut_ptr(), 0xAA);
        std::ptr::write_volatile(buffer.as_mut_ptr().add(FRAME_SIZE - 1), 0xBB);
    }
    std::hint::black_box(&buffer);

    FRAME_SIZE + prefault_stack_recursive(remaining - FRAME_SIZE, depth + 1)
}

#[cfg(target_os = "linux")]
fn set_scheduler(config: &RealtimeConfig) -> (Option<SchedPolicy>, Option<i32>) {
    let linux_policy = match config.policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => {
            debug!("SCHED_OTHER requested, nothing to set");
            return (Some(SchedPolicy::Other), None);
        }
    };

    let priority = if config.use_max_priority {
        // SAFETY: no preconditions; sched_get_priority_max is a pure query.
        let max = unsafe { libc::sched_get_priority_max(linux_policy) };
        if max < 0 {
            warn!("sched_get_priority_max failed, falling back to configured priority");
            i32::from(config.priority)
        } else {
            max
        }
    } else {
        i32::from(config.priority)
    };

    let mut runtime_policy = linux_policy;
    if config.reset_on_fork {
        runtime_policy |= libc::SCHED_RESET_ON_FORK;
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: valid pid (0 = self) and a stack-local sched_param.
    let rv = unsafe { libc::sched_setscheduler(0, runtime_policy, &param) };
    if rv != 0 {
        warn!(
            "sched_setscheduler({:?}, priority {priority}) failed: {}",
            config.policy,
            std::io::Error::last_os_error()
        );
        return (None, None);
    }

    info!(?config.policy, priority, "real-time scheduler applied");
    (Some(config.policy), Some(priority))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(config: &RealtimeConfig) -> (Option<SchedPolicy>, Option<i32>) {
    warn!("real-time scheduling not available on this platform");
    let _ = config;
    (None, None)
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> Option<Vec<usize>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity {
        CpuAffinity::None => return None,
        CpuAffinity::Single(cpu) => vec![*cpu],
        CpuAffinity::Set(cpus) => cpus.clone(),
    };
    if cpus.is_empty() {
        return None;
    }

    let mut set = CpuSet::new();
    for &cpu in &cpus {
        if set.set(cpu).is_err() {
            warn!(cpu, "invalid CPU index in affinity set, skipping");
            return None;
        }
    }

    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => Some(cpus),
        Err(e) => {
            warn!("sched_setaffinity failed: {e}");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: &CpuAffinity) -> Option<Vec<usize>> {
    if !matches!(affinity, CpuAffinity::None) {
        warn!("CPU affinity not available on this platform");
    }
    None
}

/// Snapshot of what the kernel will currently grant us, used by
/// `validate_rt_capabilities` and by `wdmd --dump` diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub is_root: bool,
    pub rtprio_limit: Option<u64>,
    pub memlock_limit: Option<u64>,
}

#[cfg(target_os = "linux")]
pub fn check_rt_capabilities() -> RtCapabilities {
    let mut caps = RtCapabilities {
        // SAFETY: geteuid takes no arguments and cannot fail.
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid stack-local out parameter.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: rlim is a valid stack-local out parameter.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }
    caps
}

#[cfg(not(target_os = "linux"))]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

impl RtCapabilities {
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }
        #[cfg(target_family = "unix")]
        {
            self.memlock_limit
                .is_some_and(|l| l == libc::RLIM_INFINITY)
        }
        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

fn validate_rt_capabilities(config: &RealtimeConfig) -> Result<(), RealtimeError> {
    let caps = check_rt_capabilities();
    let mut issues = Vec::new();

    if config.policy != SchedPolicy::Other && !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "cannot use RT scheduling (SCHED_{:?}): rtprio_limit={:?}, is_root={}",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }
    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "cannot lock memory: memlock_limit={:?}, is_root={}",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(RealtimeError::Unmet(format!(
            "real-time requirements not met (fail_fast=true):\n  - {}",
            issues.join("\n  - ")
        )))
    }
}
