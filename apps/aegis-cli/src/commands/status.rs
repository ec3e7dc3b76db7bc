// status.rs — daemon status and ruleset inspection.

use anyhow::Result;

use aegis_service::Facade;

pub async fn status(facade: &Facade) -> Result<()> {
    let status = facade.daemon_status().await?;
    println!("backend:            {}", status.backend);
    println!(
        "backend health:     reachable={} writable={}",
        status.backend_reachable, status.backend_writable
    );
    println!("autonomy level:     {}", status.autonomy_level);
    println!("circuit breaker:    {}", if status.breaker_tripped { "TRIPPED" } else { "armed" });
    println!(
        "active deployment:  {}",
        status
            .active_deployment
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("queued deployments: {}", status.queued_deployments);
    println!("pending proposals:  {}", status.pending_proposals);
    println!("never-block:        {} entries", status.never_block_entries);
    println!("causal windows:     {}", status.causal_windows);
    Ok(())
}

pub async fn rules(facade: &Facade) -> Result<()> {
    let rules = facade.list_rules().await?;
    if rules.is_empty() {
        println!("ruleset is empty");
        return Ok(());
    }
    for rule in rules {
        let placement = rule.placement.as_deref().unwrap_or("?");
        println!("[{}] {}", placement, rule.text);
    }
    Ok(())
}

pub async fn import(facade: &Facade) -> Result<()> {
    let report = facade.import_rules().await?;
    for rule in &report.rules {
        println!(
            "{} {} {} src={} proto={}",
            rule.id,
            rule.direction,
            rule.action,
            rule.source_net()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "any".to_string()),
            rule.protocol
        );
    }
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
    println!(
        "{} rules imported, {} warnings",
        report.rules.len(),
        report.warnings.len()
    );
    Ok(())
}
