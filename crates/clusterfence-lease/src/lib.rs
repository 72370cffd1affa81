#![doc = "Reset event codec and lease-engine abstraction consumed by the reset orchestrator and the target-side reset watcher."]

pub mod client;
pub mod engine;
pub mod event;

pub use client::{LeaseClient, LeaseClientError, LeaseCmd, LOCKSPACE_NAME_SIZE};
pub use engine::{
    HostInfo, HostStatus, LeaseEngine, LeaseError, SimChannel, SimulatedLeaseEngine,
    SimulatedStorage,
};
pub use event::{
    bits, compose_reset_event, decode, encode, EventCodecError, EventRecord, SetEventFlags,
    EVENT_RECORD_LEN,
};
