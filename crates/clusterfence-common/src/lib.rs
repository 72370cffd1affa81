#![doc = "Common types shared across the clusterfence workspace."]

pub mod config;
pub mod pidfile;
pub mod time;
pub mod wire;

pub use config::*;
pub use pidfile::{Pidfile, PidfileError};
pub use time::*;
pub use wire::*;
