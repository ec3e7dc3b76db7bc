// never_block.rs — manage protected subjects.

use anyhow::Result;
use clap::Subcommand;

use aegis_service::Facade;

#[derive(Subcommand)]
pub enum NeverBlockCommands {
    /// Add an address, CIDR, hostname, or iface:<name> entry.
    Add { entry: String },
    /// Remove an entry by its label.
    Remove { label: String },
    /// List all entries.
    List,
}

pub fn run(facade: &Facade, command: NeverBlockCommands) -> Result<()> {
    match command {
        NeverBlockCommands::Add { entry } => {
            let label = facade.never_block_add(&entry)?;
            println!("never-block entry added: {}", label);
        }
        NeverBlockCommands::Remove { label } => {
            let removed = facade.never_block_remove(&label)?;
            if removed == 0 {
                println!("no entry labelled '{}'", label);
            } else {
                println!("removed {}", label);
            }
        }
        NeverBlockCommands::List => {
            let entries = facade.never_block_list();
            if entries.is_empty() {
                println!("never-block list is empty");
            }
            for entry in entries {
                println!("{}", entry);
            }
        }
    }
    Ok(())
}
