use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VmlabError;
use crate::paths;

/// Tool-level settings parsed from `<config_dir>/vmlab.toml`.
///
/// Every field has a default, so a missing settings file is not an error —
/// `vmlab` works out of the box against `qemu:///system`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Settings {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    /// Overrides the default disk storage directory when set.
    #[facet(default)]
    pub storage_dir: String,
    /// Overrides the default cloud image cache directory when set.
    #[facet(default)]
    pub cache_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            storage_dir: String::new(),
            cache_dir: String::new(),
        }
    }
}

impl Settings {
    pub fn libvirt_uri(&self) -> &str {
        &self.libvirt_uri
    }

    /// Resolved disk storage directory.
    pub fn storage_dir(&self) -> PathBuf {
        if self.storage_dir.is_empty() {
            paths::default_storage_dir()
        } else {
            PathBuf::from(&self.storage_dir)
        }
    }

    /// Resolved cloud image cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        if self.cache_dir.is_empty() {
            paths::default_cache_dir()
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }
}

/// Load settings from `<config_dir>/vmlab.toml`, falling back to defaults
/// when the file does not exist.
pub fn load_settings(config_dir: &Path) -> Result<Settings, VmlabError> {
    let path = paths::settings_file(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|e| VmlabError::SettingsLoad {
        path: path.display().to_string(),
        source: e,
    })?;

    let settings: Settings =
        facet_toml::from_str(&contents).map_err(|e| VmlabError::SettingsParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    Ok(settings)
}
