//! Configuration resolution for Folio services
//!
//! Settings resolve in priority order:
//! 1. Environment variable (highest priority)
//! 2. TOML config file (path from `FOLIO_CONFIG`, default `folio.toml`)
//! 3. Compiled default (fallback)

use crate::{Error, Result};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Load the optional TOML config file
///
/// A missing file is not an error; an unreadable or malformed file is.
pub fn load_config_file(path: &Path) -> Result<Option<toml::Value>> {
    if !path.exists() {
        debug!("No config file at {}, using environment and defaults", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value = toml::from_str::<toml::Value>(&content)
        .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    debug!("Loaded config file {}", path.display());
    Ok(Some(value))
}

/// Resolve a string setting: env var, then config file key, then default
pub fn resolve_string(
    env_var: &str,
    file: Option<&toml::Value>,
    file_key: &str,
    default: &str,
) -> String {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return value;
        }
    }
    if let Some(config) = file {
        if let Some(value) = config.get(file_key).and_then(|v| v.as_str()) {
            return value.to_string();
        }
    }
    default.to_string()
}

/// Resolve an optional string setting: env var, then config file key
pub fn resolve_optional(env_var: &str, file: Option<&toml::Value>, file_key: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    file.and_then(|config| config.get(file_key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Resolve a parseable setting (ports, counts, durations)
///
/// A present-but-unparseable value is a configuration error, not a silent
/// fallback to the default.
pub fn resolve_parse<T: FromStr>(
    env_var: &str,
    file: Option<&toml::Value>,
    file_key: &str,
    default: T,
) -> Result<T> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return value
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{} has invalid value: {}", env_var, value)));
        }
    }
    if let Some(config) = file {
        if let Some(raw) = config.get(file_key) {
            let text = match raw.as_str() {
                Some(s) => s.to_string(),
                None => raw.to_string(),
            };
            return text
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{} has invalid value: {}", file_key, text)));
        }
    }
    Ok(default)
}

/// Resolve a boolean flag; accepts true/false, 1/0, yes/no (case-insensitive)
pub fn resolve_flag(
    env_var: &str,
    file: Option<&toml::Value>,
    file_key: &str,
    default: bool,
) -> Result<bool> {
    let raw = if let Ok(value) = std::env::var(env_var) {
        if value.is_empty() {
            return Ok(default);
        }
        value
    } else if let Some(value) = file
        .and_then(|config| config.get(file_key))
        .and_then(|v| v.as_bool())
    {
        return Ok(value);
    } else {
        return Ok(default);
    };

    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got: {}",
            env_var, other
        ))),
    }
}
