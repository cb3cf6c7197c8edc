//! Diagnostics command.

use anyhow::{Result, bail};
use colored::Colorize;
use mnemo_sdk::{CallOptions, Mnemo};
use serde::Serialize;

use super::{Globals, print_json};
use crate::config::LoadedConfig;

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

pub async fn execute(loaded: &LoadedConfig, globals: &Globals) -> Result<()> {
    let mut checks = Vec::new();
    let root = &loaded.config.storage_root;

    checks.push(Check {
        name: "config",
        ok: true,
        detail: if loaded.from_file {
            format!("loaded {}", loaded.path.display())
        } else {
            "not found (using defaults)".to_string()
        },
    });

    let db_path = root.join("mnemo.db");
    if !db_path.exists() {
        checks.push(Check {
            name: "store",
            ok: false,
            detail: format!("{} missing (run mnemo init)", db_path.display()),
        });
        return report(checks, globals);
    }

    match Mnemo::open(loaded.config.clone()).await {
        Ok(mnemo) => {
            let options = CallOptions::default();

            checks.push(match mnemo.integrity_check().await {
                Ok(()) => Check {
                    name: "integrity",
                    ok: true,
                    detail: "ok".to_string(),
                },
                Err(e) => Check {
                    name: "integrity",
                    ok: false,
                    detail: e.to_string(),
                },
            });

            checks.push(match mnemo.store().manifest() {
                Ok(manifest) => Check {
                    name: "vector manifest",
                    ok: true,
                    detail: format!("{} ({} dimensions)", manifest.model, manifest.dimension),
                },
                Err(e) => Check {
                    name: "vector manifest",
                    ok: false,
                    detail: e.to_string(),
                },
            });

            checks.push(match mnemo.verify_index(&options).await {
                Ok(index) if index.is_clean() => Check {
                    name: "index",
                    ok: true,
                    detail: format!(
                        "{} lexical, {} vector entries",
                        index.lexical_entries, index.vector_entries
                    ),
                },
                Ok(index) => Check {
                    name: "index",
                    ok: false,
                    detail: format!(
                        "{} orphaned, {} missing entries",
                        index.orphaned.len(),
                        index.missing.len()
                    ),
                },
                Err(e) => Check {
                    name: "index",
                    ok: false,
                    detail: e.to_string(),
                },
            });

            let backups = mnemo.list_backups().await.unwrap_or_default();
            checks.push(Check {
                name: "backups",
                ok: true,
                detail: match backups.last() {
                    Some(latest) => format!("{} (latest {})", backups.len(), latest.display()),
                    None => "none".to_string(),
                },
            });

            mnemo.shutdown().await?;
        }
        Err(e) => checks.push(Check {
            name: "store",
            ok: false,
            detail: e.to_string(),
        }),
    }

    report(checks, globals)
}

fn report(checks: Vec<Check>, globals: &Globals) -> Result<()> {
    let failed = checks.iter().filter(|check| !check.ok).count();

    if globals.json {
        print_json(&checks)?;
    } else {
        println!("{}", "mnemo Doctor".cyan().bold());
        println!("{}", "─".repeat(50));
        println!();
        for check in &checks {
            let marker = if check.ok { "✓".green() } else { "✗".red() };
            println!("  {} {}: {}", marker, check.name, check.detail);
        }
        println!();
        if failed == 0 {
            println!("{}", "All checks passed!".green().bold());
        }
    }

    if failed > 0 {
        bail!("{} check(s) failed", failed);
    }
    Ok(())
}
