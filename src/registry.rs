//! Volume identity and provisioning bookkeeping
//!
//! The registry remembers which volume names are active (and with which
//! requested size, for CreateVolume idempotency) and caches the resolved
//! parameters of volumes it has seen. When a lookup misses the cache, for
//! example after a restart, the volume is reconstructed from the platform's
//! persisted volume records.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cluster::{self, ClusterStore, PersistedVolumeRecord};
use crate::error::{DriverError, Result};
use crate::params::{self, ParameterSources, KEY_NAMESPACE, KEY_SECRET_NAME};
use crate::types::{ResolvedVolume, Volume};

/// Result of recording an active volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Newly recorded by this call
    Inserted,
    /// Already recorded with the same size
    AlreadyRecorded,
    /// Already recorded with a different size; nothing changed
    Conflict { existing_size: i64 },
}

/// Concurrency-safe volume bookkeeping
pub struct VolumeRegistry {
    /// Active volume name -> requested size in bytes
    active: RwLock<HashMap<String, i64>>,
    /// Volume id -> resolved volume
    resolved: RwLock<HashMap<String, ResolvedVolume>>,
    cluster: Arc<dyn ClusterStore>,
}

impl VolumeRegistry {
    pub fn new(cluster: Arc<dyn ClusterStore>) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            cluster,
        }
    }

    /// Record `name` as active with the requested size
    pub fn record_active(&self, name: &str, size_bytes: i64) -> RecordOutcome {
        let mut active = self.active.write();
        match active.get(name) {
            Some(&existing) if existing != size_bytes => RecordOutcome::Conflict {
                existing_size: existing,
            },
            Some(_) => RecordOutcome::AlreadyRecorded,
            None => {
                active.insert(name.to_string(), size_bytes);
                RecordOutcome::Inserted
            }
        }
    }

    /// Forget a volume. Removing an unknown name is a no-op.
    pub fn forget(&self, name: &str) {
        self.active.write().remove(name);
        self.resolved.write().remove(name);
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.read().contains_key(name)
    }

    /// Cache a resolved volume for later lookups by id
    pub fn remember(&self, resolved: ResolvedVolume) {
        self.resolved
            .write()
            .insert(resolved.volume.id.clone(), resolved);
    }

    /// Look up a volume's identity
    pub async fn lookup_by_id(&self, volume_id: &str) -> Result<Volume> {
        self.resolve_by_id(volume_id).await.map(|r| r.volume)
    }

    /// Look up a volume with its full parameter set.
    ///
    /// Fails with `VolumeNotFound` when neither the cache nor the persisted
    /// records know the id.
    pub async fn resolve_by_id(&self, volume_id: &str) -> Result<ResolvedVolume> {
        let cached = self.resolved.read().get(volume_id).cloned();
        if let Some(resolved) = cached {
            return Ok(resolved);
        }

        debug!("Volume {} not cached, scanning persisted volume records", volume_id);
        let record = self
            .cluster
            .list_volume_records()
            .await?
            .into_iter()
            .find(|r| r.handle == volume_id)
            .ok_or_else(|| DriverError::VolumeNotFound(volume_id.to_string()))?;

        let resolved = self.reconstruct(record).await?;
        info!("Reconstructed volume {}", resolved.volume);
        self.remember(resolved.clone());
        Ok(resolved)
    }

    async fn reconstruct(&self, record: PersistedVolumeRecord) -> Result<ResolvedVolume> {
        let store = self.cluster.as_ref();

        let defaults = match &record.node_publish_secret_ref {
            Some(r) => cluster::optional_secret(store, &r.namespace, &r.name)
                .await?
                .unwrap_or_default(),
            None => HashMap::new(),
        };

        // The claim secret is named in the volume attributes; fall back to the
        // bound claim for volumes provisioned without them
        let attr = |key: &str| record.attributes.get(key).filter(|v| !v.is_empty()).cloned();
        let claim_secret = match (attr(KEY_NAMESPACE), attr(KEY_SECRET_NAME)) {
            (Some(namespace), Some(name)) => Some((namespace, name)),
            _ => record
                .claim_ref
                .as_ref()
                .map(|c| (c.namespace.clone(), c.name.clone())),
        };

        let secrets = match claim_secret {
            Some((namespace, name)) => cluster::claim_secrets(store, &namespace, &name).await?,
            None => Default::default(),
        };

        let parameters = params::resolve(ParameterSources {
            defaults,
            volume_context: record.attributes,
            claim_secret: secrets.claim_secret,
            saved_secret: secrets.saved_secret,
            claim: None,
        })?;

        Ok(ResolvedVolume::new(record.handle, parameters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryClusterStore, ObjectRef};

    fn registry() -> (VolumeRegistry, Arc<MemoryClusterStore>) {
        let store = Arc::new(MemoryClusterStore::new());
        (VolumeRegistry::new(store.clone()), store)
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_record_active_idempotent_and_conflict() {
        let (registry, _) = registry();
        assert_eq!(registry.record_active("v1", 100), RecordOutcome::Inserted);
        assert_eq!(
            registry.record_active("v1", 100),
            RecordOutcome::AlreadyRecorded
        );
        assert_eq!(
            registry.record_active("v1", 200),
            RecordOutcome::Conflict { existing_size: 100 }
        );
        // Conflict leaves the original size in place
        assert_eq!(
            registry.record_active("v1", 100),
            RecordOutcome::AlreadyRecorded
        );
    }

    #[test]
    fn test_forget_idempotent() {
        let (registry, _) = registry();
        registry.record_active("v1", 1);
        registry.forget("v1");
        registry.forget("v1");
        assert!(!registry.is_active("v1"));
        assert_eq!(registry.record_active("v1", 2), RecordOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_lookup_from_cache() {
        let (registry, _) = registry();
        let parameters = params::resolve(ParameterSources {
            volume_context: map(&[("remote", "r"), ("remotePath", "p")]),
            ..Default::default()
        })
        .unwrap();
        registry.remember(ResolvedVolume::new("v1", parameters));

        let volume = registry.lookup_by_id("v1").await.unwrap();
        assert_eq!(volume.remote, "r");
        assert_eq!(volume.remote_path, "p");
    }

    #[tokio::test]
    async fn test_lookup_reconstructs_from_records() {
        let (registry, store) = registry();
        store.put_secret(
            "ns",
            "claim",
            map(&[("remote", "my-s3"), ("remotePath", "giab")]),
        );
        store.put_volume_record(PersistedVolumeRecord {
            handle: "pvc-123".into(),
            attributes: map(&[("secretName", "claim"), ("namespace", "ns")]),
            claim_ref: Some(ObjectRef::new("ns", "claim")),
            node_publish_secret_ref: None,
        });

        let volume = registry.lookup_by_id("pvc-123").await.unwrap();
        assert_eq!(volume.id, "pvc-123");
        assert_eq!(volume.remote, "my-s3");
        assert_eq!(volume.remote_path, "giab");

        // Cached afterwards
        store.remove_volume_record("pvc-123");
        assert!(registry.lookup_by_id("pvc-123").await.is_ok());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_claim_ref() {
        let (registry, store) = registry();
        store.put_secret("ns", "bound", map(&[("remote", "r"), ("remotePath", "p")]));
        store.put_volume_record(PersistedVolumeRecord {
            handle: "v2".into(),
            claim_ref: Some(ObjectRef::new("ns", "bound")),
            ..Default::default()
        });

        assert_eq!(registry.lookup_by_id("v2").await.unwrap().remote, "r");
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.lookup_by_id("ghost").await,
            Err(DriverError::VolumeNotFound(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_forget_drops_cached_volume() {
        let (registry, _) = registry();
        let parameters = params::resolve(ParameterSources {
            volume_context: map(&[("remote", "r"), ("remotePath", "p")]),
            ..Default::default()
        })
        .unwrap();
        registry.remember(ResolvedVolume::new("v1", parameters));
        registry.forget("v1");
        assert!(registry.lookup_by_id("v1").await.is_err());
    }
}
