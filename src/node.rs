//! Node-side lifecycle: publishing volumes at target paths and tearing them
//! down again.
//!
//! Publish resolves the volume's connection parameters, registers a daemon
//! profile named after the volume and asks the daemon to mount it. Unpublish
//! drains pending writes, unmounts, drops the profile and cleans up the
//! target. Both calls are idempotent: a healthy mount is left alone and an
//! unknown volume only has its target cleaned up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::DirBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{self, ClusterStore};
use crate::config::{Config, DrainConfig, MountDefaults};
use crate::crypto::{self, BackendSection};
use crate::daemon::{ControlApi, MountOptions};
use crate::drain::{drain, DrainOutcome};
use crate::error::{DriverError, Result};
use crate::mount::{
    cleanup_mount_point, probe_target, profile_name, MountContext, MountContextStore,
    MountTable, TargetState,
};
use crate::params::{self, ParameterSources, KEY_NAMESPACE, KEY_SECRET_NAME};
use crate::registry::VolumeRegistry;
use crate::types::{NodePublishVolumeRequest, NodeUnpublishVolumeRequest, ResolvedVolume};

/// Mode of target directories created on publish
const TARGET_DIR_MODE: u32 = 0o750;

/// Subdirectories of the daemon cache holding per-profile VFS state
const VFS_CACHE_DIRS: &[&str] = &["vfs", "vfsMeta"];

pub struct NodeService {
    api: Arc<dyn ControlApi>,
    registry: Arc<VolumeRegistry>,
    cluster: Arc<dyn ClusterStore>,
    table: Arc<dyn MountTable>,
    mounts: MountContextStore,
    mount_defaults: MountDefaults,
    drain: DrainConfig,
    cache_dir: PathBuf,
}

impl NodeService {
    pub fn new(
        config: &Config,
        api: Arc<dyn ControlApi>,
        registry: Arc<VolumeRegistry>,
        cluster: Arc<dyn ClusterStore>,
        table: Arc<dyn MountTable>,
    ) -> Self {
        Self {
            api,
            registry,
            cluster,
            table,
            mounts: MountContextStore::new(),
            mount_defaults: config.mount.clone(),
            drain: config.drain.clone(),
            cache_dir: config.daemon.cache_dir.clone(),
        }
    }

    /// Live mounts made by this node
    pub fn mounts(&self) -> &MountContextStore {
        &self.mounts
    }

    /// Mount a volume at the request's target path
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    pub async fn publish(&self, req: NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume id missing in request".into(),
            ));
        }
        if req.target_path.is_empty() {
            return Err(DriverError::InvalidArgument(
                "target path missing in request".into(),
            ));
        }
        if req.volume_capability.is_none() {
            return Err(DriverError::InvalidArgument(
                "volume capability missing in request".into(),
            ));
        }

        let target = Path::new(&req.target_path);
        match probe_target(self.table.as_ref(), target).map_err(DriverError::classify_mount_failure)? {
            TargetState::Healthy => {
                info!("Target already mounted");
                return Ok(());
            }
            TargetState::Stale => {
                warn!("Target is a stale mount, detaching before remount");
                self.table
                    .unmount(target)
                    .map_err(DriverError::classify_mount_failure)?;
            }
            TargetState::Unmounted => {}
        }

        let namespace = context_value(&req, KEY_NAMESPACE);
        let secret_name = context_value(&req, KEY_SECRET_NAME);
        let secrets =
            cluster::claim_secrets(self.cluster.as_ref(), &namespace, &secret_name).await?;

        let parameters = params::resolve(ParameterSources {
            defaults: req.secrets,
            volume_context: req.volume_context,
            claim_secret: secrets.claim_secret,
            saved_secret: secrets.saved_secret,
            claim: None,
        })?;

        let section = crypto::backend_section(&parameters.config_data)?;
        let options = MountOptions::from_flags(&self.mount_defaults, req.read_only, &parameters.flags)?;

        let profile = profile_name(&req.volume_id);
        let fs = format!("{}:{}", profile, parameters.remote_path);

        self.mount(target, &profile, &fs, &section, &options)
            .await
            .map_err(|e| {
                error!("Mount failed: {}", e);
                e.classify_mount_failure()
            })?;

        self.mounts.insert(MountContext {
            target_path: req.target_path.clone(),
            volume_id: req.volume_id.clone(),
            profile,
            fs,
        });
        self.registry
            .remember(ResolvedVolume::new(req.volume_id, parameters));

        info!("Volume published");
        Ok(())
    }

    async fn mount(
        &self,
        target: &Path,
        profile: &str,
        fs: &str,
        section: &BackendSection,
        options: &MountOptions,
    ) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(TARGET_DIR_MODE)
            .create(target)
            .await?;

        self.api
            .create_config(profile, &section.backend_type, &section.parameters)
            .await?;

        self.api
            .mount(fs, &target.to_string_lossy(), options)
            .await
    }

    /// Drain, unmount and forget the mount at the request's target path.
    ///
    /// Cancelling `cancel` cuts the drain short; the unmount still happens.
    #[instrument(skip(self, req, cancel), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    pub async fn unpublish(
        &self,
        req: NodeUnpublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume id missing in request".into(),
            ));
        }
        if req.target_path.is_empty() {
            return Err(DriverError::InvalidArgument(
                "target path missing in request".into(),
            ));
        }

        let target = Path::new(&req.target_path);
        let profile = profile_name(&req.volume_id);
        let context_fs = self.mounts.get(&req.target_path).map(|c| c.fs);
        let fs = match self.registry.lookup_by_id(&req.volume_id).await {
            Ok(volume) => Some(
                context_fs.unwrap_or_else(|| format!("{}:{}", profile, volume.remote_path)),
            ),
            Err(DriverError::VolumeNotFound(_)) => {
                warn!("Volume is unknown, cleaning up target only");
                cleanup_mount_point(self.table.as_ref(), target)?;
                self.mounts.remove(&req.target_path);
                return Ok(());
            }
            Err(e) => {
                // Teardown only needs the volume id and target
                warn!("Cannot resolve volume, unmounting without its parameters: {}", e);
                context_fs
            }
        };

        let outcome = drain(self.api.as_ref(), fs.as_deref(), &self.drain, cancel).await;
        if outcome != DrainOutcome::Idle {
            debug!("Unmounting with writes possibly pending");
        }

        self.api
            .unmount(&req.target_path)
            .await
            .map_err(|e| DriverError::Internal(e.to_string()))?;

        self.remove_vfs_cache(&profile).await;

        if let Err(e) = self.api.delete_config(&profile).await {
            error!("Deleting config {} failed: {}", profile, e);
        }

        if let Err(e) = cleanup_mount_point(self.table.as_ref(), target) {
            warn!("Cannot clean up mount point: {}", e);
        }

        self.mounts.remove(&req.target_path);
        info!("Volume unpublished");
        Ok(())
    }

    /// Best-effort removal of the daemon's on-disk cache for a profile
    async fn remove_vfs_cache(&self, profile: &str) {
        for dir in VFS_CACHE_DIRS {
            let path = self.cache_dir.join(dir).join(profile);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => debug!("Removed VFS cache {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove VFS cache {:?}: {}", path, e),
            }
        }
    }
}

fn context_value(req: &NodePublishVolumeRequest, key: &str) -> String {
    req.volume_context.get(key).cloned().unwrap_or_default()
}
