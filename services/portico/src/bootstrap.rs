//! First-start setup of the home directory.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::DEFAULT_CONFIG;

/// Create `home_dir` and write a default config at `config_path` if either
/// is missing.
pub fn bootstrap(home_dir: &Path, config_path: &Path) -> Result<()> {
    if !home_dir.exists() {
        std::fs::create_dir_all(home_dir)
            .with_context(|| format!("Can't create config directory {}", home_dir.display()))?;
    }

    if !config_path.exists() {
        info!(config = %config_path.display(), "Config file not found, creating a default one");
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Can't create config directory {}", parent.display()))?;
        }
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("Can't create file {}", config_path.display()))?;
    }

    Ok(())
}
