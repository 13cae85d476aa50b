//! Cluster state consumed by the driver
//!
//! The orchestration platform owns secrets, claims and persisted volume
//! records. The driver only reads them, through [`ClusterStore`].
//! [`MemoryClusterStore`] keeps everything in process and backs tests as well
//! as standalone runs without a platform client.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::Result;
use crate::params::{ClaimMetadata, SAVED_SECRET_SUFFIX};

/// Namespaced reference to a cluster object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// A persisted volume as recorded by the platform
#[derive(Debug, Clone, Default)]
pub struct PersistedVolumeRecord {
    /// Volume handle, equal to the driver's volume id
    pub handle: String,
    /// Volume attributes returned by CreateVolume
    pub attributes: HashMap<String, String>,
    /// Claim the volume is bound to
    pub claim_ref: Option<ObjectRef>,
    /// Secret the platform passes on node publish
    pub node_publish_secret_ref: Option<ObjectRef>,
}

/// Read access to platform state
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a secret's data; `None` when it does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>>;

    /// Fetch a claim's metadata; `None` when it does not exist
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimMetadata>>;

    /// List every persisted volume record
    async fn list_volume_records(&self) -> Result<Vec<PersistedVolumeRecord>>;
}

/// In-process cluster state
#[derive(Default)]
pub struct MemoryClusterStore {
    secrets: RwLock<HashMap<ObjectRef, HashMap<String, String>>>,
    claims: RwLock<HashMap<ObjectRef, ClaimMetadata>>,
    records: RwLock<Vec<PersistedVolumeRecord>>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: HashMap<String, String>) {
        self.secrets
            .write()
            .insert(ObjectRef::new(namespace, name), data);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.secrets.write().remove(&ObjectRef::new(namespace, name));
    }

    pub fn put_claim(&self, claim: ClaimMetadata) {
        let key = ObjectRef::new(claim.namespace.clone(), claim.name.clone());
        self.claims.write().insert(key, claim);
    }

    /// Add a record, replacing any existing record with the same handle
    pub fn put_volume_record(&self, record: PersistedVolumeRecord) {
        let mut records = self.records.write();
        records.retain(|r| r.handle != record.handle);
        records.push(record);
    }

    pub fn remove_volume_record(&self, handle: &str) {
        self.records.write().retain(|r| r.handle != handle);
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        Ok(self
            .secrets
            .read()
            .get(&ObjectRef::new(namespace, name))
            .cloned())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimMetadata>> {
        Ok(self
            .claims
            .read()
            .get(&ObjectRef::new(namespace, name))
            .cloned())
    }

    async fn list_volume_records(&self) -> Result<Vec<PersistedVolumeRecord>> {
        Ok(self.records.read().clone())
    }
}

/// Fetch a secret, treating an empty name or namespace as "no secret"
pub async fn optional_secret(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
) -> Result<Option<HashMap<String, String>>> {
    if namespace.is_empty() || name.is_empty() {
        return Ok(None);
    }
    store.get_secret(namespace, name).await
}

/// The secrets attached to a claim: the plain claim secret and the
/// encrypted saved secret stored beside it
#[derive(Debug, Clone, Default)]
pub struct ClaimSecrets {
    pub claim_secret: Option<HashMap<String, String>>,
    pub saved_secret: Option<HashMap<String, String>>,
}

/// Fetch the claim secret `name` and its saved companion `<name>-secrets`.
///
/// Failing to read the saved secret is not fatal; it is logged and skipped.
pub async fn claim_secrets(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
) -> Result<ClaimSecrets> {
    let claim_secret = optional_secret(store, namespace, name).await?;
    if claim_secret.is_none() && !name.is_empty() {
        warn!("Claim secret {}/{} not found", namespace, name);
    }

    let saved_name = format!("{}{}", name, SAVED_SECRET_SUFFIX);
    let saved_secret = match optional_secret(store, namespace, &saved_name).await {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Cannot read saved secret {}/{}: {}", namespace, saved_name, e);
            None
        }
    };

    Ok(ClaimSecrets {
        claim_secret,
        saved_secret,
    })
}
