// commands/ — one module per CLI area.

pub mod audit;
pub mod autonomy;
pub mod events;
pub mod never_block;
pub mod propose;
pub mod review;
pub mod status;

use anyhow::{bail, Result};
use uuid::Uuid;

use aegis_service::Facade;
use aegis_store::ProposalState;

/// Resolve a full or prefix proposal id.
pub fn resolve_proposal_id(facade: &Facade, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = id.parse() {
        return Ok(uuid);
    }
    let matches: Vec<Uuid> = facade
        .list_proposals(None)?
        .iter()
        .map(|p| p.id)
        .filter(|p| p.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => bail!("no proposal matches '{}'", id),
        1 => Ok(matches[0]),
        n => bail!("'{}' is ambiguous ({} proposals match)", id, n),
    }
}

/// Resolve a full or prefix deployment id.
pub fn resolve_deployment_id(facade: &Facade, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = id.parse() {
        return Ok(uuid);
    }
    let matches: Vec<Uuid> = facade
        .list_deployments(200)?
        .iter()
        .map(|d| d.id)
        .filter(|d| d.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => bail!("no deployment matches '{}'", id),
        1 => Ok(matches[0]),
        n => bail!("'{}' is ambiguous ({} deployments match)", id, n),
    }
}

pub fn parse_proposal_state(state: &str) -> Result<ProposalState> {
    Ok(match state {
        "draft" => ProposalState::Draft,
        "pending_approval" | "pending" => ProposalState::PendingApproval,
        "approved" => ProposalState::Approved,
        "rejected" => ProposalState::Rejected,
        "superseded" => ProposalState::Superseded,
        other => bail!("unknown proposal state '{}'", other),
    })
}

/// Shorten a UUID for table display.
pub fn short(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}
