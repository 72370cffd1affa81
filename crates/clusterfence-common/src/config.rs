//! Configuration structures shared by the watchdog multiplexer and the
//! reset orchestrator.
//!
//! Supports TOML deserialization with sensible defaults for development and
//! explicit values for production deployment, following the same
//! `serde(default)` + `humantime` convention throughout.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the watchdog multiplexer daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WdmdConfig {
    /// How often each client's liveness test runs.
    #[serde(with = "humantime_serde")]
    pub test_interval: Duration,

    /// How long the hardware watchdog is armed to fire after the last
    /// successful pet, once every client has failed its early-fail check.
    #[serde(with = "humantime_serde")]
    pub fire_timeout: Duration,

    /// Preferred `/dev/watchdog*` device path. `None` means probe for one.
    pub watchdog_path: Option<PathBuf>,

    /// UNIX socket path clients connect to for registration and renewal.
    pub socket_path: PathBuf,

    /// Group name allowed to connect to `socket_path` (in addition to root).
    /// Falls back to gid 0 with a warning if the name doesn't resolve.
    pub socket_group: Option<String>,

    /// Allow clients to register script-based liveness tests in addition to
    /// file-based ones.
    pub allow_scripts: bool,

    /// Directory scripts are resolved relative to, when `allow_scripts` is
    /// set.
    pub scripts_dir: Option<PathBuf>,

    /// Directory of external FILE tests (§4.2 step 1). `None` means this
    /// build runs with FILE tests compiled out, matching
    /// `wdmd/main.c`'s `#if TEST_FILES` stub.
    pub files_dir: Option<PathBuf>,

    /// Seconds a script is allowed to run before it is killed and its
    /// client treated as failed.
    #[serde(with = "humantime_serde")]
    pub kill_script_timeout: Duration,

    /// Real-time scheduling configuration for the daemon's poll loop.
    pub realtime: RealtimeConfig,

    /// Run in the foreground with debug logging instead of daemonizing.
    pub debug: bool,
}

impl Default for WdmdConfig {
    fn default() -> Self {
        Self {
            test_interval: Duration::from_secs(10),
            fire_timeout: Duration::from_secs(60),
            watchdog_path: None,
            socket_path: PathBuf::from("/run/clusterfence/wdmd.sock"),
            socket_group: None,
            allow_scripts: false,
            scripts_dir: None,
            files_dir: None,
            kill_script_timeout: Duration::from_secs(10),
            realtime: RealtimeConfig::default(),
            debug: false,
        }
    }
}

/// Configuration for the reset orchestrator (`clusterfence-reset` /
/// `clusterfence-resetd`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Renewal interval used by the lockspaces this orchestrator manages,
    /// needed to derive the native reset timeout.
    #[serde(with = "humantime_serde")]
    pub renewal_interval: Duration,

    /// `io_timeout` of the managed lockspaces.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Ceiling on how long to wait on the slower host-status path before
    /// giving up on a reset.
    #[serde(with = "humantime_serde")]
    pub host_status_timeout: Duration,

    /// Number of consecutive renewals with no RESETTING/REBOOTING echo
    /// before a reset is declared failed.
    pub max_unanswered_renewals: u32,

    /// UNIX datagram socket the `clusterfence-resetd` watcher listens on for
    /// `reg`/`end`/`clear` control messages from the CLI.
    pub resetd_socket_path: PathBuf,

    /// Path to the sysrq trigger file used to honor an inbound REBOOT
    /// event (normally `/proc/sysrq-trigger`).
    pub sysrq_trigger_path: PathBuf,

    /// UNIX socket of the lease daemon `clusterfence-resetd` and
    /// `clusterfence-reset` connect to for `reg_event`/`set_event`/etc
    /// (§6.1). The lease daemon itself is out of scope for this
    /// workspace; this is only where its control socket is expected to
    /// live.
    pub lease_socket_path: PathBuf,

    /// UNIX socket of the local watchdog multiplexer, used by
    /// `clusterfence-resetd` to arm an un-renewable client entry on an
    /// inbound RESET (§4.2 "The WDM at the TARGET of a reset").
    pub wdm_socket_path: PathBuf,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(20),
            io_timeout: Duration::from_secs(10),
            host_status_timeout: Duration::from_secs(300),
            max_unanswered_renewals: 4,
            resetd_socket_path: PathBuf::from("/run/clusterfence/resetd.sock"),
            sysrq_trigger_path: PathBuf::from("/proc/sysrq-trigger"),
            lease_socket_path: PathBuf::from("/run/clusterfence/lease.sock"),
            wdm_socket_path: PathBuf::from("/run/clusterfence/wdmd.sock"),
        }
    }
}

/// Real-time scheduling configuration, shared by any daemon in this
/// workspace whose poll loop must not be preempted behind the watchdog's
/// fire deadline.
///
/// Defaults mirror `wdmd`'s own `-H` "high priority features" setup:
/// `SCHED_RR` at the maximum allowed priority with `SCHED_RESET_ON_FORK`
/// set (so a forked script test inherits normal scheduling, not the
/// daemon's RT class), plus `mlockall(MCL_CURRENT|MCL_FUTURE)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling and memory locking (the `-H` flag;
    /// requires `CAP_SYS_NICE` / `CAP_IPC_LOCK` to fully take effect).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" (round-robin), or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority. Ignored (the maximum allowed priority for
    /// `policy` is requested instead) when `use_max_priority` is set.
    pub priority: u8,

    /// Request `sched_get_priority_max(policy)` instead of `priority`.
    pub use_max_priority: bool,

    /// Set `SCHED_RESET_ON_FORK` so forked script-test children (§4.2)
    /// drop back to normal scheduling instead of inheriting the daemon's
    /// real-time class.
    pub reset_on_fork: bool,

    /// CPU affinity for the daemon thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (`mlockall`) so the daemon can't be paged out
    /// from under its own fire deadline.
    pub lock_memory: bool,

    /// Bytes of stack to pre-fault at startup so the first real test pass
    /// doesn't take a page fault on the way to closing the watchdog.
    pub prefault_stack_size: usize,

    /// If true, fail to start when RT scheduling or memory locking cannot
    /// be obtained instead of degrading silently. `wdmd` itself only logs
    /// and continues; this is an opt-in stricter mode for deployments that
    /// want setup failures to be loud rather than advisory.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Rr,
            priority: 1,
            use_max_priority: true,
            reset_on_fork: true,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
            prefault_stack_size: 128 * 1024,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// `SCHED_FIFO`: first-in-first-out real-time.
    #[default]
    Fifo,
    /// `SCHED_RR`: round-robin real-time.
    Rr,
    /// `SCHED_OTHER`: normal time-sharing (non-RT).
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl WdmdConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

impl ResetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wdmd_defaults_match_reference_constants() {
        let config = WdmdConfig::default();
        assert_eq!(config.test_interval, Duration::from_secs(10));
        assert_eq!(config.fire_timeout, Duration::from_secs(60));
    }

    #[test]
    fn reset_defaults_match_reference_constants() {
        let config = ResetConfig::default();
        assert_eq!(config.renewal_interval, Duration::from_secs(20));
        assert_eq!(config.io_timeout, Duration::from_secs(10));
        assert_eq!(config.host_status_timeout, Duration::from_secs(300));
        assert_eq!(config.max_unanswered_renewals, 4);
    }

    #[test]
    fn wdmd_parse_toml() {
        let toml = r#"
            test_interval = "10s"
            fire_timeout = "60s"
            socket_path = "/run/clusterfence/wdmd.sock"
            allow_scripts = true
            scripts_dir = "/etc/clusterfence/scripts"

            [realtime]
            enabled = true
            priority = 5
            policy = "fifo"
        "#;
        let config: WdmdConfig = toml::from_str(toml).unwrap();
        assert!(config.allow_scripts);
        assert_eq!(config.realtime.priority, 5);
    }

    #[test]
    fn cpu_affinity_variants() {
        let single: CpuAffinity = serde_json::from_str("3").unwrap();
        assert_eq!(single, CpuAffinity::Single(3));

        let set: CpuAffinity = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(set, CpuAffinity::Set(vec![1, 2, 3]));
    }

    #[test]
    fn wdmd_roundtrip_toml() {
        let config = WdmdConfig::default();
        let toml = config.to_toml().unwrap();
        let reparsed: WdmdConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.test_interval, reparsed.test_interval);
    }
}
