use crate::core::error::{Error, Result, ResultExt};
use crate::core::identity::Identity;
use crate::core::ruleset::{DEFAULT_PROVIDER_KEY, DEFAULT_SUBLAYER_KEY, DEFAULT_SUBLAYER_WEIGHT};
use crate::utils::{ensure_dir, get_config_dir};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Overrides [`ControllerConfig::engine_library`] when set.
pub const ENGINE_LIBRARY_ENV: &str = "WFPCTL_ENGINE_LIBRARY";

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Controller configuration: where the engine lives and how the block-all
/// ruleset is labelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Path of the engine library; `None` means "not configured"
    #[serde(default)]
    pub engine_library: Option<PathBuf>,
    /// Objects added through a dynamic session vanish when it closes
    #[serde(default)]
    pub dynamic_session: bool,
    /// Install the ruleset so it survives restarts (adds boot-time filters)
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_provider_key")]
    pub provider_key: Identity,
    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    #[serde(default)]
    pub provider_description: String,
    #[serde(default = "default_sublayer_key")]
    pub sublayer_key: Identity,
    #[serde(default = "default_sublayer_name")]
    pub sublayer_name: String,
    #[serde(default)]
    pub sublayer_description: String,
    #[serde(default = "default_sublayer_weight")]
    pub sublayer_weight: u16,
    #[serde(default = "default_filter_name")]
    pub filter_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            engine_library: None,
            dynamic_session: false,
            persistent: false,
            provider_key: default_provider_key(),
            provider_name: default_provider_name(),
            provider_description: String::new(),
            sublayer_key: default_sublayer_key(),
            sublayer_name: default_sublayer_name(),
            sublayer_description: String::new(),
            sublayer_weight: default_sublayer_weight(),
            filter_name: default_filter_name(),
        }
    }
}

fn default_provider_key() -> Identity {
    DEFAULT_PROVIDER_KEY
}

fn default_sublayer_key() -> Identity {
    DEFAULT_SUBLAYER_KEY
}

fn default_provider_name() -> String {
    "wfpctl block-all provider".to_string()
}

fn default_sublayer_name() -> String {
    "wfpctl block-all sublayer".to_string()
}

fn default_filter_name() -> String {
    "wfpctl block-all filter".to_string()
}

fn default_sublayer_weight() -> u16 {
    DEFAULT_SUBLAYER_WEIGHT
}

impl ControllerConfig {
    /// Engine library path after applying the environment override.
    pub fn resolved_engine_library(&self) -> Option<PathBuf> {
        match std::env::var_os(ENGINE_LIBRARY_ENV) {
            Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
            _ => self.engine_library.clone(),
        }
    }
}

/// Default location of the config file, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Reads and parses the config at `path`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    let json = std::fs::read_to_string(path)
        .map_err(Error::from)
        .context(&format!("failed to read {}", path.display()))?;
    let config = serde_json::from_str(&json)
        .map_err(Error::from)
        .context(&format!("failed to parse {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Loads the config from the default location, or returns the default
/// config if it is missing or unreadable.
pub fn load_config_or_default() -> ControllerConfig {
    let Some(path) = default_config_path() else {
        return ControllerConfig::default();
    };
    if !path.exists() {
        return ControllerConfig::default();
    }
    load_config(&path).unwrap_or_else(|e| {
        warn!("Ignoring config: {e}");
        ControllerConfig::default()
    })
}

/// Saves `config` to `path` using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600) on Unix.
/// 3. Atomically renames it over the target path.
pub fn save_config(path: &Path, config: &ControllerConfig) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;

    let json = serde_json::to_string_pretty(config)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    debug!("Saved config to {}", path.display());
    Ok(())
}
