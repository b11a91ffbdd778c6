//! Runtime configuration
//!
//! Loaded from `~/.persona/config.toml`; every field has a default, so a missing file or
//! a partial one is fine. Environment overrides are applied after the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PersonaError, Result};
use crate::evolution::EvolutionSettings;
use crate::sync::SyncSettings;

/// Overrides the directory holding the store file
pub const ENV_HOME: &str = "PERSONA_HOME";
/// Overrides `sync.path`
pub const ENV_SYNC_PATH: &str = "PERSONA_SYNC_PATH";
/// Overrides `sync.enabled` (`1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`)
pub const ENV_SYNC_ENABLED: &str = "PERSONA_SYNC_ENABLED";

const STORE_FILE: &str = "profiles.json";
const CONFIG_FILE: &str = "config.toml";
const SYNC_FILE: &str = ".persona-sync.json";

/// Home directory from `HOME`, then `USERPROFILE`, else the working directory
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var_os("USERPROFILE").filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.persona`
pub fn persona_dir() -> PathBuf {
    home_dir().join(".persona")
}

pub fn default_config_path() -> PathBuf {
    persona_dir().join(CONFIG_FILE)
}

pub fn default_storage_path() -> PathBuf {
    persona_dir().join(STORE_FILE)
}

pub fn default_sync_path() -> PathBuf {
    home_dir().join(SYNC_FILE)
}

/// Expand a leading `~` or `~/`
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(PersonaError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Profile store file
    pub storage_path: PathBuf,

    pub sync: SyncSettings,

    pub evolution: EvolutionSettings,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            sync: SyncSettings::default(),
            evolution: EvolutionSettings::default(),
        }
    }
}

impl PersonaConfig {
    /// Read `path` (defaults when it does not exist) and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map_err(|e| e.context(format!(
                "Loading configuration from {}",
                path.display()
            )))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No configuration file, using defaults");
                Self::default()
            }
            Err(e) => return Err(PersonaError::Io(e)),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Parse TOML text; `~` in paths is expanded
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| PersonaError::Config(format!("Invalid configuration: {}", e)))?;
        Ok(config.expanded())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PersonaError::Config(format!("Serializing configuration: {}", e)))
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(home) = lookup(ENV_HOME).filter(|v| !v.is_empty()) {
            self.storage_path = expand_home(Path::new(&home)).join(STORE_FILE);
        }
        if let Some(path) = lookup(ENV_SYNC_PATH).filter(|v| !v.is_empty()) {
            self.sync.path = expand_home(Path::new(&path));
        }
        if let Some(flag) = lookup(ENV_SYNC_ENABLED) {
            self.sync.enabled = parse_flag(ENV_SYNC_ENABLED, &flag)?;
        }
        Ok(self)
    }

    /// Sync settings with the topic cap taken from the evolution settings
    pub fn sync_settings(&self) -> SyncSettings {
        self.sync.clone().with_topic_cap(self.evolution.topic_cap)
    }

    fn expanded(mut self) -> Self {
        self.storage_path = expand_home(&self.storage_path);
        self.sync.path = expand_home(&self.sync.path);
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_sync_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sync.path = path.into();
        self
    }

    pub fn with_evolution(mut self, evolution: EvolutionSettings) -> Self {
        self.evolution = evolution;
        self
    }
}
