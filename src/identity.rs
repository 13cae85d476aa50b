//! Plugin discovery and health probing

use std::sync::Arc;

use crate::daemon::DaemonHealth;
use crate::types::{PluginCapability, PluginInfo};

pub const PLUGIN_NAME: &str = "csi-rclone";

pub struct IdentityService {
    health: Arc<dyn DaemonHealth>,
}

impl IdentityService {
    pub fn new(health: Arc<dyn DaemonHealth>) -> Self {
        Self { health }
    }

    pub fn get_plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Healthy while the mounting daemon is running
    pub fn probe(&self) -> bool {
        self.health.is_available()
    }

    pub fn get_plugin_capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::ControllerService]
    }
}
