use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::PathBuf;

/// User configuration, read from the platform config dir
/// (e.g. `~/.config/gloop/config.toml`). Every field has a default so a
/// missing file just means defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_provider: String,
    pub default_model: String,
    pub api_key: Option<String>,
    /// Upstream routing hint passed through to providers that support one.
    pub provider_routing: Option<String>,
    /// Directory the agent works in; `.gloop/` state lives under it.
    pub workspace: String,
    /// Tool-call count at which the conversation is pruned.
    pub context_prune_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: "openrouter".into(),
            default_model: "anthropic/claude-sonnet-4".into(),
            api_key: None,
            provider_routing: None,
            workspace: ".".into(),
            context_prune_threshold: 50,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let Some(dirs) = ProjectDirs::from("", "", "gloop") else {
            return Self::default();
        };
        let path = dirs.config_dir().join("config.toml");
        match Self::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    tracing::warn!("ignoring unreadable config {}: {e:#}", path.display());
                }
                Self::default()
            }
        }
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.workspace).into_owned())
    }

    /// API key resolution: explicit config value, then the provider's
    /// conventional environment variable.
    pub fn resolved_api_key(&self, provider: &str) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }
        let var = match provider {
            "openrouter" => "OPENROUTER_API_KEY",
            _ => return None,
        };
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }
}
