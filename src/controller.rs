//! Controller-side lifecycle: provisioning and deprovisioning volumes

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{self, ClaimSecrets, ClusterStore};
use crate::config::ControllerConfig;
use crate::crypto::{self, BackendSection};
use crate::daemon::ControlApi;
use crate::error::{DriverError, Result};
use crate::mount::{scoped_profile_name, PROVISION_PROFILE_PREFIX};
use crate::params::{
    self, ParameterSources, ResolvedParameters, KEY_NAMESPACE, KEY_REMOTE, KEY_REMOTE_PATH,
    KEY_REMOTE_PATH_SUFFIX, KEY_SECRET_NAME,
};
use crate::registry::{RecordOutcome, VolumeRegistry};
use crate::types::{
    ConfirmedCapabilities, CreateVolumeRequest, DeleteVolumeRequest, ProvisionedVolume,
    ResolvedVolume, ValidateVolumeCapabilitiesRequest,
};

/// Parameters the platform injects to name the claim behind a CreateVolume
pub const PARAM_CLAIM_NAME: &str = "csi.storage.k8s.io/pvc/name";
pub const PARAM_CLAIM_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";

/// Flag carried into the volume context so node mounts honour it
const KEY_UMASK: &str = "umask";

pub struct ControllerService {
    api: Arc<dyn ControlApi>,
    registry: Arc<VolumeRegistry>,
    cluster: Arc<dyn ClusterStore>,
    config: ControllerConfig,
}

impl ControllerService {
    pub fn new(
        config: ControllerConfig,
        api: Arc<dyn ControlApi>,
        registry: Arc<VolumeRegistry>,
        cluster: Arc<dyn ClusterStore>,
    ) -> Self {
        Self {
            api,
            registry,
            cluster,
            config,
        }
    }

    /// Provision a volume named after the request
    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<ProvisionedVolume> {
        if req.name.is_empty() {
            return Err(DriverError::InvalidArgument("name missing in request".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }

        let inserted = match self.registry.record_active(&req.name, req.capacity_bytes) {
            RecordOutcome::Inserted => true,
            RecordOutcome::AlreadyRecorded => false,
            RecordOutcome::Conflict { existing_size } => {
                warn!(
                    "Volume exists with size {}, requested {}",
                    existing_size, req.capacity_bytes
                );
                return Err(DriverError::AlreadyExists(req.name));
            }
        };

        let claim_name = req.parameters.get(PARAM_CLAIM_NAME).cloned();
        let claim_namespace = req.parameters.get(PARAM_CLAIM_NAMESPACE).cloned();

        let resolved = match self
            .resolve(&req, claim_name.as_deref(), claim_namespace.as_deref())
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                // A retry must not release a volume an earlier call provisioned
                if inserted {
                    self.registry.forget(&req.name);
                }
                return Err(match e {
                    DriverError::MissingParameter(_) | DriverError::MalformedConfig(_) => {
                        DriverError::InvalidArgument(e.to_string())
                    }
                    other => other,
                });
            }
        };

        self.registry
            .remember(ResolvedVolume::new(req.name.clone(), resolved.clone()));

        if self.config.create_remote_dir {
            self.create_remote_dir(&req.name, &resolved).await;
        }

        let mut volume_context = HashMap::from([
            (KEY_REMOTE.to_string(), resolved.remote.clone()),
            (KEY_REMOTE_PATH.to_string(), resolved.base_remote_path.clone()),
        ]);
        if let Some(name) = claim_name {
            volume_context.insert(KEY_SECRET_NAME.to_string(), name);
        }
        if let Some(namespace) = claim_namespace {
            volume_context.insert(KEY_NAMESPACE.to_string(), namespace);
        }
        if let Some(suffix) = &resolved.remote_path_suffix {
            volume_context.insert(KEY_REMOTE_PATH_SUFFIX.to_string(), suffix.clone());
        }
        if let Some(umask) = resolved.flags.get(KEY_UMASK) {
            volume_context.insert(KEY_UMASK.to_string(), umask.clone());
        }

        info!("Volume provisioned at {}:{}", resolved.remote, resolved.remote_path);
        Ok(ProvisionedVolume {
            volume_id: req.name,
            capacity_bytes: req.capacity_bytes,
            remote: resolved.remote,
            remote_path: resolved.remote_path,
            volume_context,
        })
    }

    async fn resolve(
        &self,
        req: &CreateVolumeRequest,
        claim_name: Option<&str>,
        claim_namespace: Option<&str>,
    ) -> Result<ResolvedParameters> {
        let (secrets, claim) = match (claim_namespace, claim_name) {
            (Some(namespace), Some(name)) => {
                let secrets = cluster::claim_secrets(self.cluster.as_ref(), namespace, name).await?;
                let claim = self.cluster.get_claim(namespace, name).await?;
                if claim.is_none() {
                    debug!("Claim {}/{} not found, path patterns expand empty", namespace, name);
                }
                (secrets, claim)
            }
            _ => (ClaimSecrets::default(), None),
        };

        params::resolve(ParameterSources {
            defaults: req.secrets.clone(),
            volume_context: req.parameters.clone(),
            claim_secret: secrets.claim_secret,
            saved_secret: secrets.saved_secret,
            claim,
        })
    }

    /// Best-effort creation of the volume's directory on the remote
    async fn create_remote_dir(&self, volume_id: &str, resolved: &ResolvedParameters) {
        let section = match crypto::backend_section(&resolved.config_data) {
            Ok(section) => section,
            Err(e) => {
                debug!("Skipping remote mkdir: {}", e);
                return;
            }
        };

        let result = self
            .with_provision_profile(volume_id, &section, |api, fs| async move {
                api.mkdir(&fs, &resolved.remote_path).await
            })
            .await;
        if let Err(e) = result {
            warn!("Cannot create remote path {}: {}", resolved.remote_path, e);
        }
    }

    /// Run `op` against a short-lived profile for the volume's backend
    async fn with_provision_profile<F, Fut>(
        &self,
        volume_id: &str,
        section: &BackendSection,
        op: F,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn ControlApi>, String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let profile = scoped_profile_name(PROVISION_PROFILE_PREFIX, volume_id);
        self.api
            .create_config(&profile, &section.backend_type, &section.parameters)
            .await?;

        let result = op(self.api.clone(), format!("{}:", profile)).await;

        if let Err(e) = self.api.delete_config(&profile).await {
            warn!("Deleting config {} failed: {}", profile, e);
        }
        result
    }

    /// Deprovision a volume, purging its remote path when configured to
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume id missing in request".into(),
            ));
        }

        let resolved = match self.registry.resolve_by_id(&req.volume_id).await {
            Ok(resolved) => Some(resolved),
            Err(DriverError::VolumeNotFound(_)) => {
                info!("Volume unknown, nothing to purge");
                None
            }
            Err(e) => {
                warn!("Cannot resolve volume, remote data kept: {}", e);
                None
            }
        };

        self.registry.forget(&req.volume_id);

        let Some(resolved) = resolved else {
            return Ok(());
        };
        if !self.config.purge_on_delete {
            info!("Volume forgotten, remote data kept");
            return Ok(());
        }

        let section = match crypto::backend_section(&resolved.parameters.config_data) {
            Ok(section) => section,
            Err(e) => {
                warn!("No usable backend config, remote data kept: {}", e);
                return Ok(());
            }
        };

        let remote_path = resolved.volume.remote_path.clone();
        let result = self
            .with_provision_profile(&req.volume_id, &section, |api, fs| async move {
                api.purge(&fs, &remote_path).await
            })
            .await;

        match result {
            Ok(()) => {
                info!("Purged {}:{}", resolved.volume.remote, resolved.volume.remote_path);
                Ok(())
            }
            Err(e) if is_remote_not_found(&e) => {
                info!("Remote path already gone");
                Ok(())
            }
            Err(DriverError::DaemonUnavailable(message)) => Err(DriverError::Internal(message)),
            Err(e) if e.to_string().to_lowercase().contains("invalid argument") => {
                Err(DriverError::InvalidArgument(e.to_string()))
            }
            Err(e) => {
                error!("Purge failed, remote data may remain: {}", e);
                Ok(())
            }
        }
    }

    /// Confirm a volume supports the requested capabilities
    pub fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ConfirmedCapabilities> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume id missing in request".into(),
            ));
        }
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::InvalidArgument(format!(
                "volume capabilities missing for volume {}",
                req.volume_id
            )));
        }
        if !self.registry.is_active(&req.volume_id) {
            return Err(DriverError::NotFound(format!(
                "volume {} does not exist",
                req.volume_id
            )));
        }

        Ok(ConfirmedCapabilities {
            volume_capabilities: req.volume_capabilities,
            volume_context: req.volume_context,
            parameters: req.parameters,
        })
    }
}

fn is_remote_not_found(err: &DriverError) -> bool {
    match err {
        DriverError::Daemon { body, .. } => body.to_lowercase().contains("not found"),
        _ => false,
    }
}
