//! Environment handling for configuration values and daemon flags
//!
//! Configuration strings may reference environment variables with the
//! `${VAR_NAME}` syntax. In the other direction, flags destined for the
//! mounting daemon are exported as environment variables at spawn time
//! following the daemon's own convention: `--foo-bar` becomes
//! `RCLONE_FOO_BAR`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::env;

use crate::config::ConfigError;

/// Namespace prefix the daemon reads its flags from
pub const DAEMON_ENV_PREFIX: &str = "RCLONE";

/// Regex pattern for matching environment variable references: ${VAR_NAME}
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Substitute environment variable references in a string.
///
/// Variables are referenced using the `${VAR_NAME}` syntax.
/// Returns an error listing all missing variables if any are not set.
///
/// Claim path patterns such as `${.PVC.name}` do not match the variable
/// syntax and pass through untouched.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing_vars = Vec::new();
    let mut result = input.to_string();

    for caps in ENV_VAR_PATTERN.captures_iter(input) {
        let full_match = caps.get(0).map_or("", |m| m.as_str());
        let var_name = caps.get(1).map_or("", |m| m.as_str());

        match env::var(var_name) {
            Ok(value) => {
                result = result.replace(full_match, &value);
            }
            Err(_) => {
                if !missing_vars.contains(&var_name.to_string()) {
                    missing_vars.push(var_name.to_string());
                }
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

/// Environment variable name the daemon reads for a flag.
///
/// Leading dashes are stripped, `-` becomes `_`, the result is uppercased
/// and prefixed with [`DAEMON_ENV_PREFIX`].
pub fn flag_env_name(flag: &str) -> String {
    let name = flag.trim_start_matches('-').replace('-', "_").to_uppercase();
    format!("{}_{}", DAEMON_ENV_PREFIX, name)
}

/// Convert a flag map into the environment passed to the daemon process.
pub fn flags_to_env<'a, I>(flags: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    flags
        .into_iter()
        .map(|(flag, value)| (flag_env_name(flag), value.clone()))
        .collect()
}
