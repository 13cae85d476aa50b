//! The background mounting daemon: its process and its control endpoint

pub mod client;
pub mod process;

pub use client::{ControlApi, DaemonHealth, DaemonStats, MountOptions, RcClient};
pub use process::Daemon;
