use std::path::{Path, PathBuf};

use anyhow::Result;
use bizsync_core::SyncConfig;

/// `<config dir>/bizsync/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bizsync").join("config.json"))
}

/// Load the effective configuration. An explicit path must exist; the
/// default location is optional and falls back to built-in defaults.
/// Returns the config together with the file it came from, if any.
pub fn resolve_config(explicit: Option<&Path>) -> Result<(SyncConfig, Option<PathBuf>)> {
    resolve_from(explicit, default_config_path())
}

fn resolve_from(
    explicit: Option<&Path>,
    fallback: Option<PathBuf>,
) -> Result<(SyncConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        return Ok((SyncConfig::load(path)?, Some(path.to_path_buf())));
    }
    match fallback {
        Some(path) if path.exists() => {
            let config = SyncConfig::load(&path)?;
            Ok((config, Some(path)))
        }
        _ => Ok((SyncConfig::default(), None)),
    }
}
