use anyhow::{Context, Result};
use reply_stream::StreamSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Client settings loaded from ~/.config/reply-stream/settings.json
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub endpoint: Option<String>,
    /// Bearer token, may reference environment variables as `${VAR}`
    pub auth_token: Option<String>,
    pub stream: StreamSettings,
}

pub fn config_dir() -> Result<PathBuf> {
    if let Ok(custom_dir) = std::env::var("REPLY_STREAM_CONFIG_DIR") {
        return Ok(PathBuf::from(custom_dir));
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg_config).join("reply-stream"));
    }

    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".config").join("reply-stream"))
}

/// Load settings from `path`, or from the config directory when not given.
/// A missing default file yields defaults; a missing explicit file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let settings_path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default_path = config_dir()?.join("settings.json");
            if !default_path.exists() {
                debug!("No settings at {}, using defaults", default_path.display());
                return Ok(ClientSettings::default());
            }
            default_path
        }
    };

    load_settings_from(&settings_path)
}

fn load_settings_from(settings_path: &Path) -> Result<ClientSettings> {
    let contents = std::fs::read_to_string(settings_path)
        .with_context(|| format!("Failed to read settings from {}", settings_path.display()))?;

    let mut settings: ClientSettings = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings from {}", settings_path.display()))?;

    if let Some(token) = &settings.auth_token {
        let resolved = expand_env_refs(token).with_context(|| {
            format!("Invalid auth_token in {}", settings_path.display())
        })?;
        settings.auth_token = Some(resolved);
    }

    Ok(settings)
}

/// Expand `${VAR}` references from the environment. Expanded values are
/// taken literally, even if they contain `${` themselves.
fn expand_env_refs(input: &str) -> Result<String> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("Unclosed variable reference in \"{input}\""))?;
        let var_name = &after[..end];
        let value = std::env::var(var_name)
            .with_context(|| format!("Environment variable not set: {var_name}"))?;
        expanded.push_str(&value);
        rest = &after[end + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}
