//! mnemo - operator CLI for a Mnemo memory store
//!
//! Inspect records, run consolidation, checkpoint, back up and restore.

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};
use commands::Context;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.json) {
        eprintln!("{} {}", "✗".red(), e);
    }

    if let Err(e) = run(cli).await {
        let code = error::exit_code(&e);
        eprintln!("{} {:#}", "✗".red(), e);
        if let Some(hint) = error::hint(&e) {
            eprintln!("  {}", hint.dimmed());
        }
        std::process::exit(code);
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("mnemo=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = config::load(cli.home.as_deref())?;
    let globals = commands::Globals::from_cli(&cli);

    match cli.command {
        Commands::Init { force } => commands::init::execute(&loaded, force, &globals).await,
        Commands::Doctor => commands::doctor::execute(&loaded, &globals).await,
        Commands::Version => {
            println!("mnemo {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let ctx = Context::open(loaded.config, globals).await?;
            let result = dispatch(&ctx, command).await;
            ctx.close().await?;
            result
        }
    }
}

async fn dispatch(ctx: &Context, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Remember {
            text,
            tags,
            confidence,
            global,
        } => commands::memory::remember(ctx, text, tags, confidence, global).await,
        Commands::Recall { query, limit } => commands::memory::recall(ctx, &query, limit).await,
        Commands::Forget { id, global } => commands::memory::forget(ctx, &id, global).await,
        Commands::Get { id } => commands::memory::get(ctx, &id).await,
        Commands::Observe {
            kind,
            valence,
            intensity,
            tags,
            note,
        } => commands::memory::observe(ctx, kind, valence, intensity, tags, note).await,
        Commands::Consolidate => commands::memory::consolidate(ctx).await,
        Commands::Model(cmd) => commands::model::execute(ctx, cmd).await,
        Commands::Procedure(cmd) => commands::procedure::execute(ctx, cmd).await,
        Commands::Checkpoint => commands::maintenance::checkpoint(ctx).await,
        Commands::Backup { list } => commands::maintenance::backup(ctx, list).await,
        Commands::Restore { snapshot } => commands::maintenance::restore(ctx, &snapshot).await,
        Commands::Stats => commands::maintenance::stats(ctx).await,
        Commands::Init { .. } | Commands::Doctor | Commands::Version => Ok(()),
    }
}
