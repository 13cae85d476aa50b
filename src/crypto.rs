//! Saved secret recovery and backend config manipulation
//!
//! Per-volume secrets may be persisted in encrypted form next to the claim.
//! They are Fernet tokens (AES-128-CBC with an HMAC-SHA256 tag) produced with
//! a key the user distributes out-of-band as URL-safe base64. Token age is
//! never enforced.
//!
//! The backend configuration itself is an INI blob holding a single section
//! named after the remote. Decrypted fields are merged into that section
//! before the blob is handed to the daemon.

use std::collections::{BTreeMap, HashMap};

use fernet::Fernet;
use ini::{EscapePolicy, Ini, ParseOption, WriteOption};

use crate::error::{DriverError, Result};

/// Key inside a backend section naming the backend kind
pub const BACKEND_TYPE_KEY: &str = "type";

/// Decrypt one token with the user-supplied key
pub fn decrypt(user_key: &str, blob: &[u8]) -> Result<Vec<u8>> {
    let fernet = cipher(user_key)?;
    decrypt_with(&fernet, blob)
}

/// Decrypt every field of a saved secret.
///
/// The first field that fails to decrypt aborts the whole operation.
pub fn decrypt_secrets(
    user_key: &str,
    fields: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let fernet = cipher(user_key)?;

    fields
        .iter()
        .map(|(key, token)| {
            let plaintext = decrypt_with(&fernet, token.as_bytes())?;
            let value = String::from_utf8(plaintext).map_err(|_| {
                DriverError::DecryptionFailed(format!("field {} is not valid UTF-8", key))
            })?;
            Ok((key.clone(), value))
        })
        .collect()
}

fn cipher(user_key: &str) -> Result<Fernet> {
    Fernet::new(user_key.trim()).ok_or_else(|| {
        DriverError::InvalidKey("expected 32 bytes of URL-safe base64".to_string())
    })
}

fn decrypt_with(fernet: &Fernet, blob: &[u8]) -> Result<Vec<u8>> {
    let token = std::str::from_utf8(blob)
        .map_err(|_| DriverError::DecryptionFailed("token is not valid UTF-8".to_string()))?;
    fernet
        .decrypt(token.trim())
        .map_err(|e| DriverError::DecryptionFailed(e.to_string()))
}

/// Set or overwrite keys in the `remote` section of an INI config blob.
///
/// The section is created when missing. All other sections and keys are
/// preserved.
pub fn update_config(
    remote: &str,
    config_data: &str,
    fields: &HashMap<String, String>,
) -> Result<String> {
    let mut ini = load(config_data)?;

    // Sorted for stable output
    let sorted: BTreeMap<&String, &String> = fields.iter().collect();
    for (key, value) in sorted {
        ini.with_section(Some(remote)).set(key.as_str(), value.as_str());
    }

    serialize(&ini)
}

/// The single backend profile described by a config blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSection {
    /// Section name, normally the remote name
    pub name: String,
    /// Backend kind (`s3`, `sftp`, ...)
    pub backend_type: String,
    /// Remaining settings, without `type`
    pub parameters: BTreeMap<String, String>,
}

/// Extract the single non-default section of a config blob
pub fn backend_section(config_data: &str) -> Result<BackendSection> {
    let ini = load(config_data)?;

    let named: Vec<_> = ini
        .iter()
        .filter_map(|(name, props)| name.map(|n| (n, props)))
        .collect();

    let (name, props) = match named.as_slice() {
        [] => {
            return Err(DriverError::MalformedConfig(
                "no backend section found".to_string(),
            ))
        }
        [single] => *single,
        many => {
            let names: Vec<&str> = many.iter().map(|(n, _)| *n).collect();
            return Err(DriverError::MalformedConfig(format!(
                "expected only one config section, found {:?}",
                names
            )));
        }
    };

    let backend_type = props
        .get(BACKEND_TYPE_KEY)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            DriverError::MalformedConfig(format!("section [{}] has no type", name))
        })?
        .to_string();

    let parameters = props
        .iter()
        .filter(|(key, _)| *key != BACKEND_TYPE_KEY)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    Ok(BackendSection {
        name: name.to_string(),
        backend_type,
        parameters,
    })
}

fn load(config_data: &str) -> Result<Ini> {
    let opt = ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    };
    Ini::load_from_str_opt(config_data, opt)
        .map_err(|e| DriverError::MalformedConfig(format!("cannot load ini config data: {}", e)))
}

fn serialize(ini: &Ini) -> Result<String> {
    let opt = WriteOption {
        escape_policy: EscapePolicy::Nothing,
        ..WriteOption::default()
    };
    let mut buf = Vec::new();
    ini.write_to_opt(&mut buf, opt)?;
    String::from_utf8(buf).map_err(|e| DriverError::Internal(e.to_string()))
}
