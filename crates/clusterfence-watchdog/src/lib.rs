#![doc = "Hardware watchdog shim, client table, test loop, and real-time setup for the watchdog multiplexer (wdmd)."]

pub mod client_table;
pub mod device;
pub mod realtime;
pub mod scripts;
pub mod sentinel;
pub mod test_loop;
pub mod wdm_client;

pub use client_table::{ClientTable, ClientTableError, SlotHandle, WdmOpcode};
pub use device::{DeviceState, WatchdogDevice, WatchdogError};
pub use realtime::{init_realtime, RealtimeError, RealtimeStatus};
pub use sentinel::{Sentinel, SentinelError};
pub use test_loop::{DeviceAction, TestLoop, TestLoopConfig, TestPassOutcome};
pub use wdm_client::{WdmClient, WdmClientError};
