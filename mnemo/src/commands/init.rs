//! Initialize a storage root.

use anyhow::{Context as _, Result};
use colored::Colorize;
use mnemo_sdk::{Mnemo, MnemoConfig};
use serde_json::json;

use super::{Globals, print_json, success, warn};
use crate::config::{self, LoadedConfig};

pub async fn execute(loaded: &LoadedConfig, force: bool, globals: &Globals) -> Result<()> {
    let root = &loaded.config.storage_root;
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create storage root {}", root.display()))?;

    let wrote_config = if loaded.from_file && !force {
        false
    } else {
        // The CLI's own override is not part of the file.
        let mut on_disk = loaded.config.clone();
        on_disk.memory.auto_consolidate = MnemoConfig::default().memory.auto_consolidate;
        config::save(&on_disk, &loaded.path)?;
        true
    };

    // Opening creates the schema and the vector manifest.
    let mnemo = Mnemo::open(loaded.config.clone()).await?;
    let manifest = mnemo.store().manifest()?;
    mnemo.shutdown().await?;

    if globals.json {
        return print_json(&json!({
            "storage_root": root,
            "config": loaded.path,
            "config_written": wrote_config,
            "manifest": manifest,
        }));
    }

    success(format!("Storage root ready: {}", root.display()));
    if wrote_config {
        success(format!("Wrote config: {}", loaded.path.display()));
    } else {
        warn(format!(
            "Config exists, left unchanged: {} (use --force to overwrite)",
            loaded.path.display()
        ));
    }
    println!(
        "  Embeddings: {} ({} dimensions)",
        manifest.model.cyan(),
        manifest.dimension
    );
    Ok(())
}
