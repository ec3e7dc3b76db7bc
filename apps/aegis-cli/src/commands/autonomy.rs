// autonomy.rs — autonomy level and breaker control.

use anyhow::Result;
use clap::Subcommand;

use aegis_service::Facade;

#[derive(Subcommand)]
pub enum AutonomyCommands {
    /// Set the autonomy level: monitor, cautious, or aggressive.
    SetLevel { level: String },
    /// Re-arm the circuit breaker after inspecting what tripped it.
    ResetBreaker,
}

pub fn run(facade: &Facade, command: AutonomyCommands) -> Result<()> {
    match command {
        AutonomyCommands::SetLevel { level } => {
            let level = facade.autonomy_set_level(&level)?;
            println!("autonomy level set to {}", level);
        }
        AutonomyCommands::ResetBreaker => {
            facade.reset_breaker()?;
            println!("circuit breaker re-armed");
        }
    }
    Ok(())
}
