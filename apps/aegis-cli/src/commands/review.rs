// review.rs — approve/reject proposals, drive deployments.

use anyhow::Result;

use aegis_service::Facade;

use super::{resolve_deployment_id, resolve_proposal_id, short};

pub async fn approve(facade: &Facade, id: &str) -> Result<()> {
    let id = resolve_proposal_id(facade, id)?;
    let deployment = facade.approve(id).await?;
    println!(
        "deployment {} is in {} on backend {}",
        deployment.id, deployment.state, deployment.backend
    );
    if let Some(deadline) = deployment.heartbeat_deadline {
        println!("  probation ends {}; commit early with: aegis commit {}", deadline, short(deployment.id));
    }
    Ok(())
}

pub async fn reject(facade: &Facade, id: &str) -> Result<()> {
    let id = resolve_proposal_id(facade, id)?;
    let proposal = facade.reject(id).await?;
    println!("proposal {} rejected", proposal.id);
    Ok(())
}

pub fn deployments(facade: &Facade) -> Result<()> {
    let deployments = facade.list_deployments(50)?;
    if deployments.is_empty() {
        println!("no deployments");
        return Ok(());
    }
    for deployment in deployments {
        println!(
            "{}  {:12} backend={} applied={} {}",
            short(deployment.id),
            deployment.state.to_string(),
            deployment.backend,
            deployment
                .applied_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            deployment.failure_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn commit(facade: &Facade, id: &str) -> Result<()> {
    let id = resolve_deployment_id(facade, id)?;
    let deployment = facade.commit(id).await?;
    println!("deployment {} {}", deployment.id, deployment.state);
    Ok(())
}

pub async fn rollback(facade: &Facade, id: &str) -> Result<()> {
    let id = resolve_deployment_id(facade, id)?;
    let deployment = facade.rollback(id).await?;
    println!("deployment {} {}", deployment.id, deployment.state);
    Ok(())
}

pub async fn cancel(facade: &Facade, id: &str) -> Result<()> {
    let id = resolve_deployment_id(facade, id)?;
    let deployment = facade.cancel(id).await?;
    println!("deployment {} {}", deployment.id, deployment.state);
    Ok(())
}
