//! # aegis-cli
//!
//! Operator CLI for the Aegis firewall orchestrator.
//!
//! - `aegis propose` — draft a rule from prose or flags
//! - `aegis proposals / approve / reject` — review the approval queue
//! - `aegis deployments / commit / rollback / cancel` — deployment control
//! - `aegis rules / import` — inspect the live ruleset
//! - `aegis autonomy` — level, breaker reset
//! - `aegis never-block` — manage protected subjects
//! - `aegis audit` — tail and verify the tamper-evident trail
//! - `aegis events` — follow the live event stream
//! - `aegis status` — daemon and backend health

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aegis_service::{AegisConfig, Facade};

/// Aegis firewall orchestrator — operator console.
#[derive(Parser)]
#[command(name = "aegis", version, about)]
struct Cli {
    /// Path to aegis.toml.
    #[arg(long, default_value = "/etc/aegis/aegis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Propose a rule, from natural language or structured flags.
    Propose(commands::propose::ProposeArgs),
    /// List proposals (optionally by state).
    Proposals {
        /// Filter: draft, pending_approval, approved, rejected, superseded.
        #[arg(long)]
        state: Option<String>,
    },
    /// Approve a pending proposal and deploy it.
    Approve {
        /// Proposal id (prefix accepted).
        id: String,
    },
    /// Reject a pending proposal.
    Reject {
        /// Proposal id (prefix accepted).
        id: String,
    },
    /// List recent deployments.
    Deployments,
    /// Commit a deployment out of probation.
    Commit {
        /// Deployment id (prefix accepted).
        id: String,
    },
    /// Roll a probation deployment back to its snapshot.
    Rollback {
        /// Deployment id (prefix accepted).
        id: String,
    },
    /// Cancel a queued deployment (or roll back a probation one).
    Cancel {
        /// Deployment id (prefix accepted).
        id: String,
    },
    /// Show the live ruleset as the backend renders it.
    Rules,
    /// Lift the live ruleset into neutral rules (with warnings).
    Import,
    /// Daemon, backend, and autonomy status.
    Status,
    /// Autonomy level and breaker control.
    Autonomy {
        #[command(subcommand)]
        command: commands::autonomy::AutonomyCommands,
    },
    /// Manage the never-block list.
    NeverBlock {
        #[command(subcommand)]
        command: commands::never_block::NeverBlockCommands,
    },
    /// Inspect the audit trail.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
    /// Follow the live security event stream.
    Events {
        /// Also replay stored events from the last N minutes.
        #[arg(long)]
        since_minutes: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AegisConfig::load(&cli.config)?;
    let facade = Facade::build(config)?;

    match cli.command {
        Commands::Propose(args) => commands::propose::run(&facade, args).await,
        Commands::Proposals { state } => commands::propose::list(&facade, state.as_deref()),
        Commands::Approve { id } => commands::review::approve(&facade, &id).await,
        Commands::Reject { id } => commands::review::reject(&facade, &id).await,
        Commands::Deployments => commands::review::deployments(&facade),
        Commands::Commit { id } => commands::review::commit(&facade, &id).await,
        Commands::Rollback { id } => commands::review::rollback(&facade, &id).await,
        Commands::Cancel { id } => commands::review::cancel(&facade, &id).await,
        Commands::Rules => commands::status::rules(&facade).await,
        Commands::Import => commands::status::import(&facade).await,
        Commands::Status => commands::status::status(&facade).await,
        Commands::Autonomy { command } => commands::autonomy::run(&facade, command),
        Commands::NeverBlock { command } => commands::never_block::run(&facade, command),
        Commands::Audit { command } => commands::audit::run(&facade, command),
        Commands::Events { since_minutes } => commands::events::follow(&facade, since_minutes).await,
    }
}
