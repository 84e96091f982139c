//! Config file persistence
//!
//! The config is stored as pretty JSON. Writes go through a temp file that is
//! synced and renamed over the target.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ClientConfig;

/// File name used when a directory is given instead of a file
pub const CONFIG_FILE_NAME: &str = "courier.json";

/// Resolve `path` to a config file: directories get [`CONFIG_FILE_NAME`] appended.
pub fn config_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CONFIG_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Write `data` to `path` atomically.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = parent {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Persist `config` to `path`
pub fn write_config(path: &Path, config: &ClientConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(&config_path(path), &json)
}

/// Load a config written by [`write_config`]
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let path = config_path(path);
    let data = fs::read(&path).with_context(|| format!("Failed to read config: {:?}", path))?;
    let config: ClientConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

/// Load `path` if it exists, otherwise return the defaults.
pub fn load_or_default(path: &Path) -> Result<ClientConfig> {
    if config_path(path).exists() {
        load_config(path)
    } else {
        Ok(ClientConfig::default())
    }
}
