//! Procedure commands.

use anyhow::Result;
use colored::Colorize;
use mnemo_sdk::{NewProcedure, Procedure};

use super::{Context, print_json, success, warn};
use crate::cli::{ProcedureAction, ProcedureCommand};

pub async fn execute(ctx: &Context, cmd: ProcedureCommand) -> Result<()> {
    match cmd.action {
        ProcedureAction::Add { name, trigger, step } => {
            let procedure = ctx
                .mnemo
                .register_procedure(
                    NewProcedure {
                        user_id: ctx.user.clone(),
                        name,
                        trigger_pattern: trigger,
                        steps: step,
                    },
                    &ctx.options,
                )
                .await?;
            if ctx.json {
                return print_json(&procedure);
            }
            success(format!(
                "Registered {} ({} steps)",
                procedure.name.cyan(),
                procedure.steps.len()
            ));
            Ok(())
        }

        ProcedureAction::Tune { name, failed } => {
            let procedure = ctx
                .mnemo
                .tune_procedure(&ctx.user, &name, !failed, &ctx.options)
                .await?;
            if ctx.json {
                return print_json(&procedure);
            }
            success(format!(
                "{} success rate now {:.1}% over {} uses",
                procedure.name.cyan(),
                procedure.success_rate * 100.0,
                procedure.usage_count
            ));
            Ok(())
        }

        ProcedureAction::List => {
            let procedures = ctx.mnemo.list_procedures(&ctx.user, &ctx.options).await?;
            print_list(ctx, &procedures, "No procedures registered")
        }

        ProcedureAction::Match { input } => {
            let procedures = ctx
                .mnemo
                .match_procedures(&ctx.user, &input, &ctx.options)
                .await?;
            print_list(ctx, &procedures, "No procedure matches")
        }
    }
}

fn print_list(ctx: &Context, procedures: &[Procedure], empty: &str) -> Result<()> {
    if ctx.json {
        return print_json(&procedures);
    }
    if procedures.is_empty() {
        warn(empty);
        return Ok(());
    }

    for procedure in procedures {
        println!(
            "{} {}  {}",
            procedure.name.bold(),
            format!("/{}/", procedure.trigger_pattern).dimmed(),
            format!(
                "{:.1}% · {} uses",
                procedure.success_rate * 100.0,
                procedure.usage_count
            )
            .cyan()
        );
        for (i, step) in procedure.steps.iter().enumerate() {
            println!("    {}. {}", i + 1, step);
        }
    }
    Ok(())
}
