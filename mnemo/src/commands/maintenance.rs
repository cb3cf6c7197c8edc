//! Checkpoint, backup, restore and stats.

use anyhow::{Result, bail};
use colored::Colorize;
use serde_json::json;
use std::path::Path;

use super::{Context, print_json, success, warn};

pub async fn checkpoint(ctx: &Context) -> Result<()> {
    let report = ctx.mnemo.checkpoint(&ctx.options).await?;

    if ctx.json {
        return print_json(&report);
    }
    success(format!(
        "Checkpointed {}/{} WAL frames",
        report.checkpointed_frames, report.wal_frames
    ));
    Ok(())
}

pub async fn backup(ctx: &Context, list: bool) -> Result<()> {
    if list {
        let backups = ctx.mnemo.list_backups().await?;
        if ctx.json {
            return print_json(&backups);
        }
        if backups.is_empty() {
            warn("No backups yet");
            return Ok(());
        }
        for path in backups {
            println!("  {}", path.display());
        }
        return Ok(());
    }

    let path = ctx.mnemo.backup(&ctx.options).await?;
    if ctx.json {
        return print_json(&json!({ "path": path }));
    }
    success(format!("Backup written: {}", path.display()));
    Ok(())
}

pub async fn restore(ctx: &Context, snapshot: &Path) -> Result<()> {
    if !snapshot.exists() {
        bail!("Snapshot not found: {}", snapshot.display());
    }

    let report = ctx.mnemo.restore(snapshot, &ctx.options).await?;

    if ctx.json {
        return print_json(&json!({ "snapshot": snapshot, "checkpoint": report }));
    }
    success(format!("Restored from {}", snapshot.display()));
    Ok(())
}

pub async fn stats(ctx: &Context) -> Result<()> {
    let stats = ctx.mnemo.stats(&ctx.user, &ctx.options).await?;

    if ctx.json {
        return print_json(&stats);
    }

    let store = &stats.memory.store;
    println!("{}", format!("Mnemo stats: {}", ctx.user).cyan().bold());
    println!("{}", "─".repeat(50));
    println!();

    println!("{}", "Records".bold());
    if store.count_by_kind.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for (kind, count) in &store.count_by_kind {
        println!("  {:<12} {}", kind, count);
    }
    println!("  {:<12} {}", "tombstones", store.tombstones);
    println!();

    println!("{}", "Consolidation".bold());
    println!("  Pending episodes: {}", store.pending_episodes);
    println!("  Runs:             {}", store.consolidation_runs);
    match store.last_consolidation_at {
        Some(at) => println!("  Last run:         {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Last run:         {}", "never".dimmed()),
    }
    println!("  Mental model keys: {}", store.mental_model_keys);
    println!();

    let cache = &stats.memory.cache;
    println!("{}", "Read cache".bold());
    println!(
        "  {}/{} entries, {} hits, {} misses, {} invalidations",
        cache.entries, cache.capacity, cache.hits, cache.misses, cache.invalidations
    );
    println!();

    let controller = &stats.controller;
    println!("{}", "Controller".bold());
    println!(
        "  {} workers, queue depth {}, {} in flight",
        controller.workers, controller.queue_depth, controller.in_flight
    );
    println!(
        "  Jobs: {} completed, {} failed, {} cancelled, {} rejected",
        controller.jobs.completed, controller.jobs.failed, controller.jobs.cancelled, controller.jobs.rejected
    );
    Ok(())
}
