//! Connection parameter resolution
//!
//! Parameters for a volume arrive from several places. They are merged with a
//! fixed precedence, each later source overwriting keys of the earlier ones:
//!
//! 1. the cluster-wide defaults secret attached to the request
//! 2. volume context attributes (platform-reserved keys dropped)
//! 3. the claim secret named by the volume context
//!
//! A fourth source, the saved secret, holds encrypted backend credentials. Its
//! fields are decrypted with the `secretKey` parameter and merged into the
//! backend section of `configData` instead of the flag set.
//!
//! Reserved keys are pulled out of the merged map; whatever remains is passed
//! to the daemon as opaque extra flags.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use crate::crypto;
use crate::error::{DriverError, Result};

pub const KEY_REMOTE: &str = "remote";
pub const KEY_REMOTE_PATH: &str = "remotePath";
pub const KEY_REMOTE_PATH_SUFFIX: &str = "remotePathSuffix";
pub const KEY_CONFIG_DATA: &str = "configData";
pub const KEY_SECRET_KEY: &str = "secretKey";
pub const KEY_SECRET_NAME: &str = "secretName";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_PATH_PATTERN: &str = "pathPattern";

/// Volume context keys with these prefixes are platform metadata
const RESERVED_PREFIXES: &[&str] = &["storage.kubernetes.io/", "csi.storage.k8s.io/"];

/// Claim annotations under this prefix may override selected flags
pub const ANNOTATION_PREFIX: &str = "csi-rclone/";

/// Annotation overrides a claim owner is allowed to set
const ANNOTATION_ALLOW_LIST: &[&str] = &["umask"];

/// Suffix appended to the claim secret name to find the saved secret
pub const SAVED_SECRET_SUFFIX: &str = "-secrets";

/// `${.PVC.labels.x}`, `${.PVC.annotations.x}`, `${.PVC.name}`, `${.PVC.namespace}`
static PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\.PVC\.((labels|annotations)\.(.*?)|.*?)\}").unwrap());

/// Metadata of the claim a volume was requested through
#[derive(Debug, Clone, Default)]
pub struct ClaimMetadata {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl ClaimMetadata {
    /// Expand `${.PVC.*}` references against this claim.
    ///
    /// Unknown labels, annotations or fields expand to the empty string.
    pub fn expand(&self, pattern: &str) -> String {
        PATH_PATTERN
            .replace_all(pattern, |caps: &regex::Captures| {
                let value = match caps.get(2).map(|m| m.as_str()) {
                    Some("labels") => self.labels.get(&caps[3]),
                    Some("annotations") => self.annotations.get(&caps[3]),
                    _ => match &caps[1] {
                        "name" => Some(&self.name),
                        "namespace" => Some(&self.namespace),
                        _ => None,
                    },
                };
                value.cloned().unwrap_or_default()
            })
            .into_owned()
    }

    /// Allow-listed flag overrides carried as claim annotations
    pub fn allowed_overrides(&self) -> HashMap<String, String> {
        self.annotations
            .iter()
            .filter_map(|(key, value)| {
                let key = key.strip_prefix(ANNOTATION_PREFIX)?;
                ANNOTATION_ALLOW_LIST
                    .contains(&key)
                    .then(|| (key.to_string(), value.clone()))
            })
            .collect()
    }
}

/// Everything the resolver merges
#[derive(Debug, Clone, Default)]
pub struct ParameterSources {
    pub defaults: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
    pub claim_secret: Option<HashMap<String, String>>,
    pub saved_secret: Option<HashMap<String, String>>,
    pub claim: Option<ClaimMetadata>,
}

/// Outcome of parameter resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParameters {
    pub remote: String,
    /// Remote path including any suffix
    pub remote_path: String,
    /// Remote path as configured, before the suffix was applied
    pub base_remote_path: String,
    /// Suffix that was applied, if any
    pub remote_path_suffix: Option<String>,
    pub config_data: String,
    /// Extra flags forwarded to the daemon
    pub flags: HashMap<String, String>,
}

/// Merge all parameter sources into a validated parameter set
pub fn resolve(sources: ParameterSources) -> Result<ResolvedParameters> {
    let ParameterSources {
        defaults,
        volume_context,
        claim_secret,
        saved_secret,
        claim,
    } = sources;

    let mut flags = defaults;
    if flags.is_empty() {
        debug!("No connection defaults secret supplied");
    }

    flags.extend(
        volume_context
            .into_iter()
            .filter(|(key, _)| !RESERVED_PREFIXES.iter().any(|p| key.starts_with(p))),
    );

    if let Some(secret) = claim_secret {
        flags.extend(secret);
    }

    let remote = take_required(&mut flags, KEY_REMOTE)?;
    let base_remote_path = take_required(&mut flags, KEY_REMOTE_PATH)?;

    let pattern = flags.remove(KEY_PATH_PATTERN);
    let suffix = match flags.remove(KEY_REMOTE_PATH_SUFFIX) {
        Some(suffix) if !suffix.is_empty() => Some(suffix),
        _ => match (&claim, pattern) {
            (Some(claim), Some(pattern)) if !pattern.is_empty() => {
                let expanded = claim.expand(&pattern);
                (!expanded.is_empty()).then(|| with_leading_separator(expanded))
            }
            _ => None,
        },
    };

    if let Some(claim) = &claim {
        flags.extend(claim.allowed_overrides());
    }

    let remote_path = match &suffix {
        Some(suffix) => format!("{}{}", base_remote_path, suffix),
        None => base_remote_path.clone(),
    };

    let mut config_data = flags.remove(KEY_CONFIG_DATA).unwrap_or_default();
    let secret_key = flags.remove(KEY_SECRET_KEY);
    flags.remove(KEY_SECRET_NAME);
    flags.remove(KEY_NAMESPACE);

    if let Some(saved) = saved_secret.filter(|s| !s.is_empty()) {
        match merge_saved_secret(&remote, &config_data, secret_key.as_deref(), &saved) {
            Ok(updated) => {
                info!("Merged {} saved secret field(s) into remote {}", saved.len(), remote);
                config_data = updated;
            }
            Err(e) => error!("cannot recover saved storage secrets: {}", e),
        }
    }

    Ok(ResolvedParameters {
        remote,
        remote_path,
        base_remote_path,
        remote_path_suffix: suffix,
        config_data,
        flags,
    })
}

fn take_required(flags: &mut HashMap<String, String>, key: &str) -> Result<String> {
    flags
        .remove(key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DriverError::MissingParameter(key.to_string()))
}

fn with_leading_separator(suffix: String) -> String {
    if suffix.starts_with('/') {
        suffix
    } else {
        format!("/{}", suffix)
    }
}

fn merge_saved_secret(
    remote: &str,
    config_data: &str,
    secret_key: Option<&str>,
    saved: &HashMap<String, String>,
) -> Result<String> {
    let key = secret_key
        .ok_or_else(|| DriverError::InvalidKey("missing user secret key".to_string()))?;
    let plain = crypto::decrypt_secrets(key, saved)?;
    crypto::update_config(remote, config_data, &plain)
}
