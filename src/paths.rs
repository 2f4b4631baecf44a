use std::path::{Path, PathBuf};

/// Configuration directory: `~/.config/vmlab/`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmlab")
}

/// Template store directory: `<config_dir>/templates/`
pub fn templates_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("templates")
}

/// Settings file: `<config_dir>/vmlab.toml`
pub fn settings_file(config_dir: &Path) -> PathBuf {
    config_dir.join("vmlab.toml")
}

/// Default disk storage directory: `~/.local/share/vmlab/disks/`
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmlab")
        .join("disks")
}

/// Default cloud image cache directory: `~/.cache/vmlab/images/`
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmlab")
        .join("images")
}

/// Path to the qcow2 disk for a VM.
pub fn disk_path(storage_dir: &Path, name: &str) -> PathBuf {
    storage_dir.join(format!("{name}.qcow2"))
}

/// Path to the cloud-init seed ISO for a VM.
pub fn seed_iso_path(storage_dir: &Path, name: &str) -> PathBuf {
    storage_dir.join(format!("{name}-seed.iso"))
}
