//! CLI argument definitions using clap derive macros.
//!
//! Every command operates on one storage root and, where it reads or writes
//! user data, on one user id.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Mnemo operator CLI
///
/// Inspect, maintain and back up a memory store.
#[derive(Parser, Debug)]
#[command(name = "mnemo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Storage root (holds mnemo.db, backups/ and vector_indices/)
    #[arg(long, global = true, env = "MNEMO_HOME")]
    pub home: Option<PathBuf>,

    /// User the command acts for
    #[arg(short, long, global = true, env = "MNEMO_USER", default_value = "default")]
    pub user: String,

    /// Output as JSON (also switches logs to JSON)
    #[arg(long, global = true)]
    pub json: bool,

    /// Per-operation timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the storage root and write a default config.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Store a fact
    Remember {
        /// Fact text
        text: String,

        /// Tags (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Confidence between 0 and 1
        #[arg(short, long, default_value = "1.0")]
        confidence: f64,

        /// Visible to every user
        #[arg(long)]
        global: bool,
    },

    /// Ranked hybrid recall
    Recall {
        /// Search query
        query: String,

        /// Maximum results (0 uses the configured default)
        #[arg(short, long, default_value = "0")]
        limit: usize,
    },

    /// Tombstone a record
    Forget {
        /// Record ID
        id: String,

        /// The record is a global fact
        #[arg(long)]
        global: bool,
    },

    /// Show one record, tombstones included
    Get {
        /// Record ID
        id: String,
    },

    /// Append an episode
    Observe {
        /// Episode kind
        #[arg(short, long, default_value = "interaction")]
        kind: String,

        /// Valence between -1 and 1
        #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
        valence: f64,

        /// Intensity between 0 and 1
        #[arg(long, default_value = "0.5")]
        intensity: f64,

        /// Tags (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Free-text note
        #[arg(short, long, default_value = "")]
        note: String,
    },

    /// Consolidate every user's pending episodes now
    Consolidate,

    /// Mental model (per-user beliefs)
    Model(ModelCommand),

    /// Procedures (named skills with a success rate)
    Procedure(ProcedureCommand),

    /// Checkpoint the write-ahead log
    Checkpoint,

    /// Checkpoint, then snapshot into backups/
    Backup {
        /// List existing snapshots instead
        #[arg(long)]
        list: bool,
    },

    /// Replace the live store with a snapshot
    Restore {
        /// Snapshot path
        snapshot: PathBuf,
    },

    /// Record counts, cache and controller state
    Stats,

    /// Run diagnostics
    Doctor,

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Mental Model Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ModelCommand {
    #[command(subcommand)]
    pub action: ModelAction,
}

#[derive(Subcommand, Debug)]
pub enum ModelAction {
    /// Show the user's mental model
    Get,

    /// Set one belief
    Set {
        /// Key (lowercase, e.g. "preferred_language")
        key: String,

        /// Value; parsed as JSON, falling back to a plain string
        value: String,

        /// Confidence between 0 and 1
        #[arg(short, long, default_value = "0.5")]
        confidence: f64,

        /// Replace even a higher-confidence belief
        #[arg(long)]
        force: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Procedure Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ProcedureCommand {
    #[command(subcommand)]
    pub action: ProcedureAction,
}

#[derive(Subcommand, Debug)]
pub enum ProcedureAction {
    /// Register a procedure
    Add {
        /// Unique name
        name: String,

        /// Trigger regex (case-insensitive)
        #[arg(short, long)]
        trigger: String,

        /// Steps, in order
        #[arg(short, long, required = true)]
        step: Vec<String>,
    },

    /// Record one invocation outcome
    Tune {
        /// Procedure name
        name: String,

        /// The invocation failed
        #[arg(long)]
        failed: bool,
    },

    /// List procedures
    List,

    /// Procedures whose trigger matches the input
    Match {
        /// Input text
        input: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_observe() {
        let cli = Cli::try_parse_from([
            "mnemo", "--user", "u1", "observe", "--valence", "-0.4", "--tags", "travel,work",
        ])
        .unwrap();
        assert_eq!(cli.user, "u1");
        match cli.command {
            Commands::Observe { valence, tags, .. } => {
                assert_eq!(valence, -0.4);
                assert_eq!(tags, vec!["travel", "work"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
