//! Mental model commands.

use anyhow::Result;
use colored::Colorize;

use super::{Context, print_json, success, warn};
use crate::cli::{ModelAction, ModelCommand};

pub async fn execute(ctx: &Context, cmd: ModelCommand) -> Result<()> {
    match cmd.action {
        ModelAction::Get => get(ctx).await,
        ModelAction::Set {
            key,
            value,
            confidence,
            force,
        } => set(ctx, &key, &value, confidence, force).await,
    }
}

async fn get(ctx: &Context) -> Result<()> {
    let model = ctx.mnemo.get_mental_model(&ctx.user, &ctx.options).await?;

    if ctx.json {
        return print_json(&model);
    }
    if model.is_empty() {
        warn(format!("No beliefs recorded for {}", ctx.user));
        return Ok(());
    }

    println!("{}", format!("Mental model: {}", ctx.user).cyan().bold());
    println!("{}", "─".repeat(50));
    for entry in model.entries.values() {
        println!(
            "  {} = {}  {}",
            entry.key.bold(),
            entry.value,
            format!("({:.2})", entry.confidence).dimmed()
        );
    }
    Ok(())
}

/// Values are JSON when they parse as JSON, else plain strings.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn set(ctx: &Context, key: &str, raw: &str, confidence: f64, force: bool) -> Result<()> {
    let update = ctx
        .mnemo
        .update_mental_model(&ctx.user, key, parse_value(raw), confidence, force, &ctx.options)
        .await?;

    if ctx.json {
        return print_json(&update);
    }
    if update.applied {
        success(format!("{} = {} ({:.2})", key.bold(), update.entry.value, update.entry.confidence));
    } else {
        warn(format!(
            "Kept {} = {}: stored confidence {:.2} beats {:.2} (use --force)",
            key, update.entry.value, update.entry.confidence, confidence
        ));
    }
    Ok(())
}
