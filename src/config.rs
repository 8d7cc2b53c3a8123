use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::db::DatabaseConfig;

const DEFAULT_PROVIDER_TIMEOUT_SECONDS: u64 = 10;

/// Service configuration, read from `identity.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub identity_provider: IdentityProviderConfig,
    /// Initial migration phase: `true` makes the internal store authoritative.
    #[serde(default)]
    pub migration_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IdentityProviderConfig {
    #[default]
    Memory,
    Http {
        base_url: String,
        #[serde(default)]
        api_token: Option<String>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECONDS
}

impl IdentityProviderConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Memory => Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECONDS),
            Self::Http {
                timeout_seconds, ..
            } => Duration::from_secs(*timeout_seconds),
        }
    }
}

/// Locate the config file. `None` means run with defaults.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("IDENTITY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("identity").join("identity.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("identity.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Expand `${VAR}` in every string value of a JSON document.
fn expand_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_env_vars(&s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(expand_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k, expand_value(v))).collect(),
        ),
        other => other,
    }
}

pub fn load_config_from(path: &Path) -> anyhow::Result<IdentityConfig> {
    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    Ok(serde_json::from_value(expand_value(value))?)
}

/// Load the config file if one is found, otherwise defaults.
pub fn load_config() -> anyhow::Result<IdentityConfig> {
    match resolve_config_path() {
        Some(path) => load_config_from(&path),
        None => Ok(IdentityConfig::default()),
    }
}
