//! Service configuration
//!
//! Stored as JSON. Missing files fall back to the defaults so a bare device
//! still comes up as terminal `eSE1`.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::link::InitMode;

/// Terminal ids served by this crate all start with this prefix
const TERMINAL_PREFIX: &str = "eSE";

/// Configuration of one secure element terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EseConfig {
    /// Name the terminal is registered under
    pub terminal_id: String,
    /// Mode passed to the link on open and init
    pub init_mode: InitMode,
    /// Endpoint context bracketing every exchange
    pub endpoint_context: u8,
}

impl Default for EseConfig {
    fn default() -> Self {
        Self {
            terminal_id: "eSE1".to_string(),
            init_mode: InitMode::Normal,
            endpoint_context: 0,
        }
    }
}

impl EseConfig {
    const ENV_PATH: &'static str = "ESE_HAL_CONFIG";
    const DEFAULT_FILE: &'static str = "config.json";

    /// Resolve the config file location
    ///
    /// Explicit path, then `ESE_HAL_CONFIG`, then the user config directory.
    fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
        if path.is_some() {
            return path;
        }
        if let Ok(env_path) = std::env::var(Self::ENV_PATH) {
            return Some(PathBuf::from(env_path));
        }
        dirs::config_dir().map(|dir| dir.join("ese-hal").join(Self::DEFAULT_FILE))
    }

    /// Load the configuration, using defaults when no file exists
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let Some(path) = Self::resolve_path(path) else {
            debug!("No config directory, using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(io_err)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal_id.starts_with(TERMINAL_PREFIX) {
            Ok(())
        } else {
            Err(ConfigError::InvalidTerminalId(self.terminal_id.clone()))
        }
    }
}
