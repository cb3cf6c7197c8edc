//! Fact, recall and episode commands.
//!
//! Every call goes through the same controller an embedding application
//! would use, so rate limits and timeouts apply here too.

use anyhow::Result;
use colored::Colorize;
use mnemo_sdk::{ConsolidationOutcome, NewEpisode, Record, RememberInput, RetrievalMode};

use super::{Context, print_json, record_line, success, warn};

pub async fn remember(
    ctx: &Context,
    text: String,
    tags: Vec<String>,
    confidence: f64,
    global: bool,
) -> Result<()> {
    let mut input = RememberInput::new(&ctx.user, text)
        .with_tags(tags)
        .with_confidence(confidence);
    if global {
        input = input.global();
    }

    let fact = ctx.mnemo.remember(input, &ctx.options).await?;

    if ctx.json {
        return print_json(&fact);
    }
    let scope = if fact.is_global() { "global" } else { ctx.user.as_str() };
    success(format!("Stored fact {} ({})", fact.id.cyan(), scope));
    if fact.embedding.is_none() {
        warn("No embedding; the fact is reachable by keyword only");
    }
    Ok(())
}

pub async fn recall(ctx: &Context, query: &str, limit: usize) -> Result<()> {
    let response = ctx.mnemo.recall(&ctx.user, query, limit, &ctx.options).await?;

    if ctx.json {
        return print_json(&response);
    }

    if response.is_empty() {
        warn(format!("Nothing recalled for \"{}\"", query));
        return Ok(());
    }
    if response.mode == RetrievalMode::LexicalOnly {
        warn("Semantic search unavailable; results are keyword matches only");
    }

    println!("{}", format!("Recall: {}", query).cyan().bold());
    println!("{}", "─".repeat(60));
    for (rank, hit) in response.hits.iter().enumerate() {
        println!("{:>2}. {:.3} {}", rank + 1, hit.score, record_line(&hit.record));
    }
    Ok(())
}

pub async fn forget(ctx: &Context, id: &str, global: bool) -> Result<()> {
    let tombstone = if global {
        ctx.mnemo.forget_global(id, &ctx.options).await?
    } else {
        ctx.mnemo.forget(&ctx.user, id, &ctx.options).await?
    };

    if ctx.json {
        return print_json(&tombstone);
    }
    if tombstone.already_deleted {
        warn(format!("{} was already deleted", id));
    } else {
        success(format!("Forgot {} {}", tombstone.kind.as_str(), id.cyan()));
    }
    Ok(())
}

pub async fn get(ctx: &Context, id: &str) -> Result<()> {
    let record = ctx.mnemo.get_by_id(&ctx.user, id, &ctx.options).await?;

    if ctx.json {
        return print_json(&record);
    }

    println!("{}", record_line(&record));
    println!("  Created: {}", record.created_at().format("%Y-%m-%d %H:%M:%S"));
    match &record {
        Record::Fact(fact) => {
            println!("  Confidence: {:.2}", fact.confidence);
            if !fact.tags.is_empty() {
                println!("  Tags: {}", fact.tags.join(", "));
            }
        }
        Record::Episode(episode) => {
            println!(
                "  Kind: {}  valence {:+.2}  intensity {:.2}",
                episode.kind, episode.valence, episode.intensity
            );
            match &episode.consolidation_id {
                Some(run) => println!("  Consolidated by: {}", run),
                None => println!("  {}", "Pending consolidation".yellow()),
            }
        }
        Record::Concept(concept) => {
            println!("  Sources: {} episodes", concept.source_episode_ids.len());
        }
        _ => {}
    }
    println!();
    println!("{}", record.text());
    Ok(())
}

pub async fn observe(
    ctx: &Context,
    kind: String,
    valence: f64,
    intensity: f64,
    tags: Vec<String>,
    note: String,
) -> Result<()> {
    let episode = NewEpisode {
        user_id: ctx.user.clone(),
        kind,
        valence,
        intensity,
        tags,
        note,
    };
    let observed = ctx.mnemo.observe_episode(episode, &ctx.options).await?;

    if ctx.json {
        return print_json(&observed);
    }
    success(format!(
        "Recorded episode {} (seq {})",
        observed.episode.id.cyan(),
        observed.episode.seq
    ));
    if let Some(outcome) = &observed.consolidation {
        print_outcome(outcome);
    }
    Ok(())
}

pub async fn consolidate(ctx: &Context) -> Result<()> {
    let outcome = ctx.mnemo.consolidate_now(&ctx.options).await?;

    if ctx.json {
        return print_json(&outcome);
    }
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &ConsolidationOutcome) {
    match outcome {
        ConsolidationOutcome::Skipped { pending, threshold } => {
            println!("  {} {} pending (threshold {})", "○".yellow(), pending, threshold);
        }
        ConsolidationOutcome::AlreadyRunning => {
            warn("Consolidation already running");
        }
        ConsolidationOutcome::Completed(report) => {
            if report.runs.is_empty() {
                println!("  {} Nothing to consolidate", "○".yellow());
                return;
            }
            success(format!(
                "Consolidated {} episodes into {} concepts ({}ms)",
                report.episodes_consolidated, report.concepts_created, report.duration_ms
            ));
            for run in &report.runs {
                println!(
                    "    {} {}: {} episodes, {} concepts",
                    run.id.dimmed(),
                    run.user_id,
                    run.episode_count,
                    run.concept_count
                );
            }
        }
    }
}
