#![doc = "Reset orchestrator state machine, native-timeout derivation, host-status decision, and the target-side reset watcher."]

pub mod host_status;
pub mod native_timeout;
pub mod orchestrator;
pub mod resetd;
pub mod target;

pub use host_status::{evaluate_channel, ChannelObservation, ChannelVerdict};
pub use native_timeout::{
    native_timeout_eligible, NativeTimeoutState, NativeTimeoutVerdict, NATIVE_RENEWAL_SECONDS,
    NATIVE_TIMEOUT_SECONDS, REFERENCE_IO_TIMEOUT_SECONDS,
};
pub use orchestrator::{Orchestrator, OrchestratorError, ResetFlags, ResetOutcome};
pub use resetd::{Reaction, ResetdConfig, ResetdError, Watcher};
pub use target::{res_to_str, str_to_res, LockspaceTarget, TargetParseError};
