//! Configuration loading for the mnemo CLI.
//!
//! The storage root is resolved with precedence:
//! 1. `--home` / `MNEMO_HOME`
//! 2. `storage_root` in the config file
//! 3. The platform data directory
//!
//! The config file is `MNEMO_CONFIG` when set, else `<storage root>/config.toml`.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use mnemo_sdk::MnemoConfig;
use std::path::{Path, PathBuf};

/// Default storage root.
pub fn default_home() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "mnemo", "mnemo") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mnemo")
    }
}

/// Get the config file path.
pub fn config_path(home: &Path) -> PathBuf {
    match std::env::var("MNEMO_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => home.join("config.toml"),
    }
}

/// Resolved configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: MnemoConfig,
    pub path: PathBuf,
    pub from_file: bool,
}

/// Load configuration from file and flags.
///
/// The CLI is short-lived, so background consolidation is always off; the
/// trigger runs inline on `observe`.
pub fn load(home: Option<&Path>) -> Result<LoadedConfig> {
    let probe_home = home.map(Path::to_path_buf).unwrap_or_else(default_home);
    let path = config_path(&probe_home);

    let (mut config, from_file) = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = MnemoConfig::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        (config, true)
    } else {
        (MnemoConfig::default(), false)
    };

    if let Some(home) = home {
        config.storage_root = home.to_path_buf();
    } else if config.storage_root.as_os_str().is_empty() {
        config.storage_root = probe_home;
    }

    Ok(LoadedConfig {
        config: config.without_background_consolidation(),
        path,
        from_file,
    })
}

/// Write `config` to `path`, creating parent directories.
pub fn save(config: &MnemoConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let content = config.to_toml_string().context("Failed to serialize config")?;
    std::fs::write(path, content).context("Failed to write config file")?;
    Ok(())
}
