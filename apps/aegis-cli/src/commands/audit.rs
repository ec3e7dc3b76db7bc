// audit.rs — inspect the tamper-evident audit trail.

use anyhow::Result;
use clap::Subcommand;

use aegis_service::Facade;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show the newest records.
    Tail {
        /// How many records.
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
    /// Verify hash-chain integrity over the whole trail.
    Verify,
}

pub fn run(facade: &Facade, command: AuditCommands) -> Result<()> {
    match command {
        AuditCommands::Tail { count } => {
            for record in facade.audit_tail(count)? {
                println!(
                    "{:>6}  {}  {:24} {:12} {} {}",
                    record.seq,
                    record.at.to_rfc3339(),
                    record.action.as_str(),
                    record.actor,
                    record.subject_id.as_deref().unwrap_or("-"),
                    record.error_kind.as_deref().unwrap_or("")
                );
            }
        }
        AuditCommands::Verify => {
            facade.verify_audit_chain()?;
            println!("audit chain verified: sequence gapless, hashes intact");
        }
    }
    Ok(())
}
