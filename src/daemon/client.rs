//! Remote-control client for the mounting daemon.
//!
//! Every call is an HTTP POST with a JSON body to `http://<address>/<endpoint>`.
//! Transport problems surface as [`DriverError::DaemonUnavailable`]; non-2xx
//! replies surface as [`DriverError::Daemon`] with the raw body attached so
//! callers can classify them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, MountDefaults};
use crate::error::{DriverError, Result};

/// Error string the daemon returns when unmounting an unknown mount point
const MOUNT_NOT_FOUND: &str = "mount not found";

/// Reports whether the daemon process is up
pub trait DaemonHealth: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Operations the orchestrator needs from the daemon
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Create (or replace) a named backend profile
    async fn create_config(
        &self,
        name: &str,
        backend_type: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete a named backend profile
    async fn delete_config(&self, name: &str) -> Result<()>;

    /// Mount `fs` (`profile:path`) at `mount_point`
    async fn mount(&self, fs: &str, mount_point: &str, options: &MountOptions) -> Result<()>;

    /// Unmount `mount_point`. Unknown mount points are not an error.
    async fn unmount(&self, mount_point: &str) -> Result<()>;

    /// Transfer and upload-queue counters, optionally scoped to one VFS
    async fn stats(&self, fs: Option<&str>) -> Result<DaemonStats>;

    /// Create a directory on the remote
    async fn mkdir(&self, fs: &str, path: &str) -> Result<()>;

    /// Remove a directory and everything under it on the remote
    async fn purge(&self, fs: &str, path: &str) -> Result<()>;
}

// =============================================================================
// Mount options
// =============================================================================

/// Options for a single `mount/mount` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub cache_mode: String,
    pub dir_cache_time: Duration,
    pub read_only: bool,
    pub allow_other: bool,
    pub allow_non_empty: bool,
    pub umask: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Flags without a typed counterpart, forwarded opaquely
    pub extra: HashMap<String, String>,
}

impl MountOptions {
    pub fn new(defaults: &MountDefaults, read_only: bool) -> Self {
        Self {
            cache_mode: defaults.cache_mode.clone(),
            dir_cache_time: defaults.dir_cache_time,
            read_only,
            allow_other: defaults.allow_other,
            allow_non_empty: defaults.allow_non_empty,
            umask: None,
            uid: None,
            gid: None,
            extra: HashMap::new(),
        }
    }

    /// Build options from defaults and the resolved extra flags.
    ///
    /// Flag names are matched with leading dashes stripped and `_` treated as
    /// `-`. A request for read-only access cannot be relaxed by a flag.
    pub fn from_flags(
        defaults: &MountDefaults,
        read_only: bool,
        flags: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut options = Self::new(defaults, read_only);

        for (key, value) in flags {
            let name = key.trim_start_matches('-').replace('_', "-");
            match name.as_str() {
                "umask" => options.umask = Some(parse_octal(key, value)?),
                "uid" => options.uid = Some(parse_value(key, value)?),
                "gid" => options.gid = Some(parse_value(key, value)?),
                "vfs-cache-mode" => options.cache_mode = value.clone(),
                "dir-cache-time" => {
                    options.dir_cache_time = humantime_serde::re::humantime::parse_duration(value)
                        .map_err(|e| invalid_flag(key, value, e))?
                }
                "read-only" => options.read_only |= parse_value::<bool>(key, value)?,
                "allow-other" => options.allow_other = parse_value(key, value)?,
                "allow-non-empty" => options.allow_non_empty = parse_value(key, value)?,
                _ => {
                    options.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(options)
    }
}

fn parse_octal(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value.trim_start_matches("0o"), 8).map_err(|e| invalid_flag(key, value, e))
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| invalid_flag(key, value, e))
}

fn invalid_flag(key: &str, value: &str, e: impl std::fmt::Display) -> DriverError {
    DriverError::InvalidArgument(format!("invalid value {:?} for {}: {}", value, key, e))
}

// =============================================================================
// Stats
// =============================================================================

/// Activity counters used to decide when a mount is drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub transferring: u64,
    pub uploads_queued: u64,
    pub uploads_in_progress: u64,
}

impl DaemonStats {
    pub fn is_idle(&self) -> bool {
        self.transferring == 0 && self.uploads_queued == 0 && self.uploads_in_progress == 0
    }

    fn from_responses(core: &Value, vfs: &Value) -> Self {
        // `transferring` is a list of transfers, older daemons report a map
        let transferring = match core.get("transferring") {
            Some(Value::Array(items)) => items.len() as u64,
            Some(Value::Object(items)) => items.len() as u64,
            _ => 0,
        };

        let disk_cache = vfs.get("diskCache");
        let counter = |name: &str| {
            disk_cache
                .and_then(|c| c.get(name))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };

        Self {
            transferring,
            uploads_queued: counter("uploadsQueued"),
            uploads_in_progress: counter("uploadsInProgress"),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct ConfigCreateRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    backend_type: &'a str,
    parameters: &'a BTreeMap<String, String>,
    opt: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MountRequest<'a> {
    fs: &'a str,
    mount_point: &'a str,
    vfs_opt: VfsOpt<'a>,
    mount_opt: MountOpt,
    #[serde(rename = "_config", skip_serializing_if = "Option::is_none")]
    config: Option<&'a HashMap<String, String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VfsOpt<'a> {
    cache_mode: &'a str,
    /// Nanoseconds
    dir_cache_time: u64,
    read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    umask: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MountOpt {
    allow_non_empty: bool,
    allow_other: bool,
}

impl<'a> MountRequest<'a> {
    fn new(fs: &'a str, mount_point: &'a str, options: &'a MountOptions) -> Self {
        Self {
            fs,
            mount_point,
            vfs_opt: VfsOpt {
                cache_mode: &options.cache_mode,
                dir_cache_time: u64::try_from(options.dir_cache_time.as_nanos())
                    .unwrap_or(u64::MAX),
                read_only: options.read_only,
                umask: options.umask,
                uid: options.uid,
                gid: options.gid,
            },
            mount_opt: MountOpt {
                allow_non_empty: options.allow_non_empty,
                allow_other: options.allow_other,
            },
            config: (!options.extra.is_empty()).then_some(&options.extra),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the daemon's remote-control endpoint
pub struct RcClient {
    base_url: String,
    client: reqwest::Client,
    health: Option<Arc<dyn DaemonHealth>>,
}

impl RcClient {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DriverError::Internal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("http://{}", config.address),
            client,
            health: None,
        })
    }

    /// Consult `health` before every call
    pub fn with_health(mut self, health: Arc<dyn DaemonHealth>) -> Self {
        self.health = Some(health);
        self
    }

    async fn call<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<Value> {
        if let Some(health) = &self.health {
            if !health.is_available() {
                return Err(DriverError::DaemonUnavailable(format!(
                    "{}: daemon is not running",
                    endpoint
                )));
            }
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::DaemonUnavailable(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DriverError::DaemonUnavailable(format!("{}: {}", endpoint, e)))?;

        if !status.is_success() {
            return Err(DriverError::Daemon {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            DriverError::DaemonUnavailable(format!("{}: invalid JSON response: {}", endpoint, e))
        })
    }
}

/// Extract the `error` field of a daemon error body
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("error")?.as_str().map(str::to_string)
}

#[async_trait]
impl ControlApi for RcClient {
    async fn create_config(
        &self,
        name: &str,
        backend_type: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<()> {
        let request = ConfigCreateRequest {
            name,
            backend_type,
            parameters,
            opt: json!({ "obscure": true }),
        };
        self.call("config/create", &request).await?;
        info!("Created config {} ({})", name, backend_type);
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<()> {
        self.call("config/delete", &json!({ "name": name })).await?;
        info!("Deleted config {}", name);
        Ok(())
    }

    async fn mount(&self, fs: &str, mount_point: &str, options: &MountOptions) -> Result<()> {
        let request = MountRequest::new(fs, mount_point, options);
        self.call("mount/mount", &request).await?;
        info!("Mounted {} at {}", fs, mount_point);
        Ok(())
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        match self
            .call("mount/unmount", &json!({ "mountPoint": mount_point }))
            .await
        {
            Ok(_) => {
                info!("Unmounted {}", mount_point);
                Ok(())
            }
            Err(DriverError::Daemon { ref body, .. })
                if error_message(body).as_deref() == Some(MOUNT_NOT_FOUND) =>
            {
                warn!("Daemon has no mount at {}, treating as unmounted", mount_point);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, fs: Option<&str>) -> Result<DaemonStats> {
        let core = self.call("core/stats", &json!({})).await?;
        let vfs_request = match fs {
            Some(fs) => json!({ "fs": fs }),
            None => json!({}),
        };
        let vfs = self.call("vfs/stats", &vfs_request).await?;
        Ok(DaemonStats::from_responses(&core, &vfs))
    }

    async fn mkdir(&self, fs: &str, path: &str) -> Result<()> {
        self.call("operations/mkdir", &json!({ "fs": fs, "remote": path }))
            .await?;
        Ok(())
    }

    async fn purge(&self, fs: &str, path: &str) -> Result<()> {
        self.call("operations/purge", &json!({ "fs": fs, "remote": path }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_mount_options_defaults() {
        let options = MountOptions::from_flags(&MountDefaults::default(), true, &HashMap::new())
            .unwrap();
        assert_eq!(options.cache_mode, "writes");
        assert_eq!(options.dir_cache_time, Duration::from_secs(60));
        assert!(options.read_only);
        assert!(options.allow_other);
        assert!(options.allow_non_empty);
        assert!(options.extra.is_empty());
    }

    #[test]
    fn test_mount_options_known_flags() {
        let options = MountOptions::from_flags(
            &MountDefaults::default(),
            false,
            &flags(&[
                ("umask", "022"),
                ("uid", "1000"),
                ("--gid", "100"),
                ("vfs_cache_mode", "full"),
                ("dir-cache-time", "5m"),
                ("allow-other", "false"),
                ("buffer-size", "32M"),
            ]),
        )
        .unwrap();
        assert_eq!(options.umask, Some(0o022));
        assert_eq!(options.uid, Some(1000));
        assert_eq!(options.gid, Some(100));
        assert_eq!(options.cache_mode, "full");
        assert_eq!(options.dir_cache_time, Duration::from_secs(300));
        assert!(!options.allow_other);
        assert_eq!(options.extra, flags(&[("buffer-size", "32M")]));
    }

    #[test]
    fn test_mount_options_read_only_not_relaxed() {
        let options = MountOptions::from_flags(
            &MountDefaults::default(),
            true,
            &flags(&[("read-only", "false")]),
        )
        .unwrap();
        assert!(options.read_only);
    }

    #[test]
    fn test_mount_options_invalid_umask() {
        let result = MountOptions::from_flags(
            &MountDefaults::default(),
            false,
            &flags(&[("umask", "999")]),
        );
        assert!(matches!(result, Err(DriverError::InvalidArgument(_))));
    }

    #[test]
    fn test_mount_request_wire_format() {
        let mut options = MountOptions::new(&MountDefaults::default(), false);
        options.umask = Some(0o022);
        options.extra = flags(&[("buffer-size", "32M")]);

        let body = serde_json::to_value(MountRequest::new("p:data", "/mnt/t", &options)).unwrap();
        assert_eq!(body["fs"], "p:data");
        assert_eq!(body["mountPoint"], "/mnt/t");
        assert_eq!(body["vfsOpt"]["cacheMode"], "writes");
        assert_eq!(body["vfsOpt"]["dirCacheTime"], 60_000_000_000u64);
        assert_eq!(body["vfsOpt"]["readOnly"], false);
        assert_eq!(body["vfsOpt"]["umask"], 18);
        assert!(body["vfsOpt"].get("uid").is_none());
        assert_eq!(body["mountOpt"]["allowNonEmpty"], true);
        assert_eq!(body["mountOpt"]["allowOther"], true);
        assert_eq!(body["_config"]["buffer-size"], "32M");
    }

    #[test]
    fn test_mount_request_omits_empty_config() {
        let options = MountOptions::new(&MountDefaults::default(), false);
        let body = serde_json::to_value(MountRequest::new("p:", "/mnt", &options)).unwrap();
        assert!(body.get("_config").is_none());
    }

    #[test]
    fn test_stats_transferring_array_or_map() {
        let vfs = json!({ "diskCache": { "uploadsQueued": 2, "uploadsInProgress": 1 } });
        let array = DaemonStats::from_responses(&json!({ "transferring": [{}, {}] }), &vfs);
        assert_eq!(array.transferring, 2);
        assert_eq!(array.uploads_queued, 2);
        assert_eq!(array.uploads_in_progress, 1);
        assert!(!array.is_idle());

        let map = DaemonStats::from_responses(&json!({ "transferring": { "a": {} } }), &json!({}));
        assert_eq!(map.transferring, 1);
        assert_eq!(map.uploads_queued, 0);
    }

    #[test]
    fn test_stats_missing_disk_cache_is_idle() {
        let stats = DaemonStats::from_responses(&json!({ "bytes": 0 }), &json!({ "fs": "x" }));
        assert!(stats.is_idle());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"error":"mount not found","status":500}"#).as_deref(),
            Some(MOUNT_NOT_FOUND)
        );
        assert_eq!(error_message("not json"), None);
    }

    struct Down;

    impl DaemonHealth for Down {
        fn is_available(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_unavailable_daemon_short_circuits() {
        // Nothing listens on the address; the health check must answer first
        let config = DaemonConfig {
            address: "127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let client = RcClient::new(&config).unwrap().with_health(Arc::new(Down));
        let err = client.delete_config("p").await.unwrap_err();
        assert!(matches!(err, DriverError::DaemonUnavailable(ref m) if m.contains("not running")));
    }
}
