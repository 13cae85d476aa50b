//! csi-rclone: volume orchestration core for an rclone-backed storage driver
//!
//! This library turns storage-platform lifecycle calls into operations on a
//! long-running rclone remote-control daemon, which does the actual mounting.
//!
//! # Architecture
//!
//! - **Parameter resolution** (`params`, `crypto`): merges connection settings
//!   from defaults, volume attributes and claim secrets, and decrypts saved
//!   backend credentials into the remote's config section.
//! - **Daemon** (`daemon`): spawns and supervises the daemon process and talks
//!   to its JSON-over-HTTP control endpoint.
//! - **Registry** (`registry`, `cluster`): tracks provisioned volumes and
//!   rebuilds them from persisted cluster records after a restart.
//! - **Lifecycle services** (`controller`, `node`, `identity`): Create/Delete,
//!   Publish/Unpublish with drain-before-unmount, and health probing.
//! - **Driver** (`driver`): owns all of the above between `start` and
//!   `shutdown`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use csi_rclone::cluster::MemoryClusterStore;
//! use csi_rclone::config::Config;
//! use csi_rclone::driver::Driver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(&"config.yaml".into())?;
//! let driver = Driver::start(config, Arc::new(MemoryClusterStore::new())).await?;
//!
//! // Serve lifecycle calls through driver.controller() and driver.node()
//!
//! driver.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod daemon;
pub mod drain;
pub mod driver;
pub mod env;
pub mod error;
pub mod identity;
pub mod mount;
pub mod node;
pub mod params;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DriverError, Result};
