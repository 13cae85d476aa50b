//! Driver root: owns the daemon and every lifecycle service

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::ClusterStore;
use crate::config::Config;
use crate::controller::ControllerService;
use crate::daemon::{ControlApi, Daemon, RcClient};
use crate::error::Result;
use crate::identity::IdentityService;
use crate::mount::{MountTable, ProcMountTable};
use crate::node::NodeService;
use crate::registry::VolumeRegistry;
use crate::types::NodeUnpublishVolumeRequest;

pub struct Driver {
    daemon: Arc<Daemon>,
    identity: IdentityService,
    controller: ControllerService,
    node: NodeService,
    shutdown: CancellationToken,
}

impl Driver {
    /// Start the mounting daemon and wire the services to it
    pub async fn start(config: Config, cluster: Arc<dyn ClusterStore>) -> Result<Self> {
        config.validate()?;
        info!("Starting {} on node {}", crate::identity::PLUGIN_NAME, config.node_id);

        let daemon = Arc::new(Daemon::new(config.daemon.clone()));
        let client = RcClient::new(&config.daemon)?.with_health(daemon.clone());
        daemon.start().await?;

        Ok(Self::assemble(
            &config,
            daemon,
            Arc::new(client),
            cluster,
            Arc::new(ProcMountTable::new()),
        ))
    }

    fn assemble(
        config: &Config,
        daemon: Arc<Daemon>,
        api: Arc<dyn ControlApi>,
        cluster: Arc<dyn ClusterStore>,
        table: Arc<dyn MountTable>,
    ) -> Self {
        let registry = Arc::new(VolumeRegistry::new(cluster.clone()));

        let identity = IdentityService::new(daemon.clone());
        let controller = ControllerService::new(
            config.controller.clone(),
            api.clone(),
            registry.clone(),
            cluster.clone(),
        );
        let node = NodeService::new(config, api, registry, cluster, table);

        Self {
            daemon,
            identity,
            controller,
            node,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn controller(&self) -> &ControllerService {
        &self.controller
    }

    pub fn node(&self) -> &NodeService {
        &self.node
    }

    /// Unpublish a volume; a shutdown cuts its drain short
    pub async fn unpublish(&self, req: NodeUnpublishVolumeRequest) -> Result<()> {
        self.node.unpublish(req, &self.shutdown.child_token()).await
    }

    /// Cut short pending drains and stop the daemon
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down");
        self.shutdown.cancel();

        let targets = self.node.mounts().targets();
        if !targets.is_empty() {
            warn!(
                "{} mount(s) still published, daemon exit will detach them: {:?}",
                targets.len(),
                targets
            );
        }

        self.daemon.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::cluster::MemoryClusterStore;
    use crate::daemon::DaemonStats;
    use crate::testing::FakeControlApi;
    use crate::types::{NodePublishVolumeRequest, VolumeCapability};

    #[tokio::test]
    async fn test_start_fails_without_daemon_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::from_str("node_id: node-a\n").unwrap();
        config.daemon.binary = tmp.path().join("missing-rclone").to_string_lossy().into_owned();
        config.daemon.cache_dir = tmp.path().join("cache");

        let result = Driver::start(config, Arc::new(MemoryClusterStore::new())).await;
        assert!(matches!(result, Err(crate::DriverError::DaemonUnavailable(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = Config::from_str("node_id: node-a\n").unwrap();
        config.daemon.address = "not-an-address".to_string();

        let result = Driver::start(config, Arc::new(MemoryClusterStore::new())).await;
        assert!(matches!(result, Err(crate::DriverError::Config(_))));
    }

    #[tokio::test]
    async fn test_unpublish_after_shutdown_skips_drain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::from_str("node_id: node-a\n").unwrap();
        config.daemon.cache_dir = tmp.path().join("cache");

        let store = Arc::new(MemoryClusterStore::new());
        store.put_secret(
            "ns",
            "claim",
            HashMap::from([
                ("remote".to_string(), "my-s3".to_string()),
                ("remotePath".to_string(), "giab".to_string()),
                ("configData".to_string(), "[my-s3]\ntype = s3\n".to_string()),
            ]),
        );
        let api = Arc::new(FakeControlApi::new());
        let table = Arc::new(api.mount_table());
        let daemon = Arc::new(Daemon::new(config.daemon.clone()));
        let driver = Driver::assemble(&config, daemon, api.clone(), store, table);

        let target = tmp.path().join("target").to_string_lossy().into_owned();
        driver
            .node()
            .publish(NodePublishVolumeRequest {
                volume_id: "pvc-1".into(),
                target_path: target.clone(),
                volume_capability: Some(VolumeCapability::default()),
                volume_context: HashMap::from([
                    ("secretName".to_string(), "claim".to_string()),
                    ("namespace".to_string(), "ns".to_string()),
                ]),
                ..Default::default()
            })
            .await
            .unwrap();

        // Uploads never finish; only the shutdown lets unpublish return
        api.set_default_stats(DaemonStats {
            uploads_in_progress: 1,
            ..Default::default()
        });
        driver.shutdown().await.unwrap();

        driver
            .unpublish(NodeUnpublishVolumeRequest {
                volume_id: "pvc-1".into(),
                target_path: target,
            })
            .await
            .unwrap();
        assert_eq!(api.calls("stats"), 0);
        assert_eq!(api.calls("unmount"), 1);
    }
}
