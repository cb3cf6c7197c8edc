//! Command implementations for the mnemo CLI.
//!
//! Each submodule implements the logic for a command group. Commands that
//! touch user data share one [`Context`], opened before dispatch and shut
//! down afterwards so the WAL is checkpointed on the way out.

pub mod doctor;
pub mod init;
pub mod maintenance;
pub mod memory;
pub mod model;
pub mod procedure;

use anyhow::{Context as _, Result};
use colored::Colorize;
use mnemo_sdk::{CallOptions, Mnemo, MnemoConfig, Record};
use serde::Serialize;
use std::time::Duration;

use crate::cli::Cli;

/// Flags shared by every command.
#[derive(Debug, Clone)]
pub struct Globals {
    pub user: String,
    pub json: bool,
    pub timeout: Option<Duration>,
}

impl Globals {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            user: cli.user.clone(),
            json: cli.json,
            timeout: cli.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// An open store plus the caller's flags.
pub struct Context {
    pub mnemo: Mnemo,
    pub user: String,
    pub json: bool,
    pub options: CallOptions,
}

impl Context {
    pub async fn open(config: MnemoConfig, globals: Globals) -> Result<Self> {
        let root = config.storage_root.clone();
        tracing::debug!(root = %root.display(), user = %globals.user, "Opening store");
        let mnemo = Mnemo::open(config)
            .await
            .with_context(|| format!("Failed to open store at {}", root.display()))?;

        let mut options = CallOptions::default();
        if let Some(timeout) = globals.timeout {
            options = options.with_timeout(timeout);
        }

        Ok(Self {
            mnemo,
            user: globals.user,
            json: globals.json,
            options,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.mnemo.shutdown().await.context("Failed to shut down cleanly")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn success(message: impl std::fmt::Display) {
    println!("{} {}", "✓".green(), message);
}

pub fn warn(message: impl std::fmt::Display) {
    println!("{} {}", "⚠".yellow(), message);
}

/// Truncate for single-line display.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let head: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

/// One-line summary of a record.
pub fn record_line(record: &Record) -> String {
    let mut line = format!(
        "{} {} {}",
        format!("[{}]", record.kind().as_str()).cyan(),
        record.id().dimmed(),
        truncate(record.text(), 80)
    );
    if record.is_deleted() {
        line.push_str(&format!(" {}", "(deleted)".red()));
    }
    line
}
