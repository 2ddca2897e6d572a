//! Configuration file discovery and loading.
//!
//! The discovery order is:
//! 1. `SWITCHYARD_CONFIG` environment variable (path to a JSON file).
//! 2. `~/.switchyard/config.json`
//! 3. If none found, [`Config::default`].
//!
//! JSON keys are normalized from camelCase to snake_case before
//! deserialization so hand-written files may use either style.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use super::Config;
use crate::error::Result;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";

/// Discover the config file path.
///
/// Returns `None` when neither the environment variable is set nor the
/// home-directory file exists.
pub fn discover_config_path(home_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    let path = home_dir?.join(".switchyard").join("config.json");
    path.exists().then_some(path)
}

/// Load the configuration using the discovery chain and validate it.
pub fn load_config() -> Result<Config> {
    #[cfg(feature = "native")]
    let home = dirs::home_dir();
    #[cfg(not(feature = "native"))]
    let home: Option<PathBuf> = None;

    match discover_config_path(home) {
        Some(path) => load_config_from(&path),
        None => {
            info!("no config file found, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Load and validate the configuration at an explicit path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    debug!(path = %path.display(), "loading config file");
    let contents = std::fs::read_to_string(path)?;
    let raw: Value = serde_json::from_str(&contents)?;
    let config: Config = serde_json::from_value(normalize_keys(raw))?;
    config.validate()?;
    Ok(config)
}

/// Convert camelCase JSON keys to snake_case recursively.
///
/// Keys inside `headers` maps are left alone since they are HTTP header
/// names, not field names.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut new_map = serde_json::Map::new();
            for (key, val) in map {
                let snake_key = camel_to_snake(&key);
                let val = if snake_key == "headers" {
                    val
                } else {
                    normalize_keys(val)
                };
                new_map.insert(snake_key, val);
            }
            Value::Object(new_map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Convert a single camelCase string to snake_case.
///
/// A run of uppercase letters (an acronym) stays together; an underscore
/// goes before its last letter only when a lowercase letter follows.
///
/// ```
/// # use switchyard_types::config::loader::camel_to_snake;
/// assert_eq!(camel_to_snake("maxFanout"), "max_fanout");
/// assert_eq!(camel_to_snake("already_snake"), "already_snake");
/// assert_eq!(camel_to_snake("baseURL"), "base_url");
/// ```
pub fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut result = String::with_capacity(name.len() + 4);

    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();
            if prev.is_lowercase()
                || (prev.is_uppercase() && next.is_some_and(|c| c.is_lowercase()))
            {
                result.push('_');
            }
        }
        result.push(ch.to_ascii_lowercase());
    }
    result
}
