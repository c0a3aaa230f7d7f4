use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use zfm_core::RackSize;
use zfm_xlsx::ImportOptions;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ZfmConfig {
    /// SQLite inventory file; defaults to the platform data directory.
    pub database: Option<PathBuf>,
    pub import: ImportConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImportConfig {
    pub strict: bool,
    pub default_rack_width: u32,
    pub default_rack_height: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let size = RackSize::default();
        Self {
            strict: false,
            default_rack_width: size.width,
            default_rack_height: size.height,
        }
    }
}

impl ImportConfig {
    pub fn options(&self) -> ImportOptions {
        ImportOptions {
            strict: self.strict,
            default_rack_size: RackSize {
                width: self.default_rack_width,
                height: self.default_rack_height,
            },
            ..ImportOptions::default()
        }
    }
}

impl ZfmConfig {
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zfm/inventory.sqlite3")
    }
}

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var("ZFM_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("zfm/config.toml")
}

/// Reads the config file, or the defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<ZfmConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ZfmConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}
