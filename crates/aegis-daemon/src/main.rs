//! # aegis-daemon
//!
//! The long-running orchestrator: tails log sources, polls threat feeds,
//! correlates events into threat assessments, and drives the autonomy
//! controller, all through the same service facade the CLI uses.
//!
//! ## Signals
//!
//! - TERM/INT: graceful drain. Stop sources, cancel queued deployments,
//!   roll back anything still in probation, close the store.
//! - HUP: reload `aegis.toml` (new sources/feeds/tuning) without touching
//!   in-flight deployments.
//! - USR1: dump a status snapshot to the log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use aegis_correlate::{Correlator, CorrelatorConfig};
use aegis_events::{parser_by_name, supervise, FeedFormat, FeedSource, FileTailSource, LogSource};
use aegis_service::{AegisConfig, Facade};
use aegis_store::{DeploymentState, EventKind, SecurityEvent, Severity};

mod pump;

/// Aegis firewall orchestrator daemon.
#[derive(Parser)]
#[command(name = "aegis-daemon", version, about)]
struct Cli {
    /// Path to aegis.toml.
    #[arg(long, default_value = "/etc/aegis/aegis.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = AegisConfig::load(&cli.config)?;
    tracing::info!(config = %cli.config.display(), "starting aegis daemon");

    let facade = Facade::build(config)?;
    run(facade, cli.config).await
}

async fn run(facade: Arc<Facade>, config_path: PathBuf) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sources run under a per-generation shutdown channel so a config
    // reload can retire the old set and spawn the new one.
    let (mut source_gen_tx, mut source_handles) =
        spawn_sources(&facade, shutdown_rx.clone());

    // The correlation pump: bus consumer → store → correlator → autonomy.
    // No external classifier is wired here; the fast path stands alone.
    let pump = tokio::spawn(pump::run(
        Arc::clone(&facade),
        Correlator::new(CorrelatorConfig::default()),
        None,
        shutdown_rx.clone(),
    ));

    let sweeps = tokio::spawn(run_sweeps(Arc::clone(&facade), shutdown_rx.clone()));

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut usr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                tracing::info!("TERM received; draining");
                break;
            }
            _ = int.recv() => {
                tracing::info!("interrupt received; draining");
                break;
            }
            _ = hup.recv() => {
                match AegisConfig::load(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = facade.reload(new_config) {
                            tracing::error!(error = %e, "config reload failed; keeping old config");
                            continue;
                        }
                        // Retire the old source generation, start the new.
                        let _ = source_gen_tx.send(true);
                        for handle in source_handles.drain(..) {
                            let _ = handle.await;
                        }
                        let (tx, handles) = spawn_sources(&facade, shutdown_rx.clone());
                        source_gen_tx = tx;
                        source_handles = handles;
                        tracing::info!("configuration reloaded; sources restarted");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "config reload failed; keeping old config");
                    }
                }
            }
            _ = usr1.recv() => {
                match facade.daemon_status().await {
                    Ok(status) => tracing::info!(
                        status = %serde_json::to_string(&status).unwrap_or_default(),
                        "status dump"
                    ),
                    Err(e) => tracing::warn!(error = %e, "status dump failed"),
                }
            }
        }
    }

    // Graceful drain: stop producers first, then settle deployments.
    let _ = source_gen_tx.send(true);
    let _ = shutdown_tx.send(true);
    for handle in source_handles {
        let _ = handle.await;
    }
    drain_deployments(&facade).await;
    let _ = pump.await;
    let _ = sweeps.await;
    tracing::info!("aegis daemon stopped");
    Ok(())
}

/// Cancel queued deployments and roll back anything still in probation.
/// A probation deployment cannot outlive its heartbeat, so exiting while
/// one is live means undoing it.
async fn drain_deployments(facade: &Arc<Facade>) {
    let backend = facade.deploy_controller().backend_name().to_string();
    if let Ok(queued) = facade.store().queued_deployments(&backend) {
        for deployment in queued {
            if let Err(e) = facade.cancel(deployment.id).await {
                tracing::warn!(deployment = %deployment.id, error = %e, "cancel on drain failed");
            }
        }
    }
    if let Ok(Some(active)) = facade.store().active_deployment(&backend) {
        if active.state == DeploymentState::Probation {
            tracing::warn!(deployment = %active.id, "rolling back in-probation deployment on shutdown");
            if let Err(e) = facade.rollback(active.id).await {
                tracing::error!(deployment = %active.id, error = %e, "rollback on drain failed");
            }
        }
    }
}

/// Spawn every enabled source and feed from the active config under a
/// fresh generation shutdown channel.
fn spawn_sources(
    facade: &Arc<Facade>,
    daemon_shutdown: watch::Receiver<bool>,
) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (gen_tx, gen_rx) = watch::channel(false);
    let mut handles = Vec::new();
    let config = facade.config();
    let bus = facade.bus();
    let store = facade.store();

    for (name, section) in &config.sources {
        if !section.enabled {
            continue;
        }
        let Some(parser) = parser_by_name(&section.parser) else {
            tracing::error!(source = %name, parser = %section.parser, "unknown parser; source skipped");
            continue;
        };
        let source: Arc<dyn LogSource> = Arc::new(
            FileTailSource::new(name.clone(), &section.path, parser, Arc::clone(&store))
                .with_budget(section.budget),
        );
        handles.push(supervise(
            source,
            Arc::clone(&bus),
            Arc::clone(&store),
            merged_shutdown(daemon_shutdown.clone(), gen_rx.clone()),
        ));
        tracing::info!(source = %name, path = %section.path.display(), "log source started");
    }

    for (name, section) in &config.feeds {
        let Some(format) = FeedFormat::parse_name(&section.format) else {
            tracing::error!(feed = %name, format = %section.format, "unknown feed format; feed skipped");
            continue;
        };
        let source: Arc<dyn LogSource> = Arc::new(FeedSource::new(
            name.clone(),
            section.url.clone(),
            format,
            Duration::from_secs(section.interval_secs),
            Duration::from_secs(section.age_max_secs),
            config.store.feed_cache_dir(),
        ));
        handles.push(supervise(
            source,
            Arc::clone(&bus),
            Arc::clone(&store),
            merged_shutdown(daemon_shutdown.clone(), gen_rx.clone()),
        ));
        tracing::info!(feed = %name, url = %section.url, "threat feed poller started");
    }

    (gen_tx, handles)
}

/// A receiver that reads true when either the daemon or the source
/// generation is shutting down.
fn merged_shutdown(
    mut daemon: watch::Receiver<bool>,
    mut generation: watch::Receiver<bool>,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            if *daemon.borrow() || *generation.borrow() {
                let _ = tx.send(true);
                break;
            }
            tokio::select! {
                changed = daemon.changed() => {
                    if changed.is_err() {
                        let _ = tx.send(true);
                        break;
                    }
                }
                changed = generation.changed() => {
                    if changed.is_err() {
                        let _ = tx.send(true);
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Periodic housekeeping: expired-rule removal, backup retention, event
/// retention.
async fn run_sweeps(facade: Arc<Facade>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let controller = facade.deploy_controller();
        match controller.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "expired rules removed"),
            Err(e) => tracing::warn!(error = %e, "expired-rule sweep failed"),
        }
        if let Err(e) = controller.sweep_backups() {
            tracing::warn!(error = %e, "backup retention sweep failed");
        }
        let retain_days = facade.config().store.retain_days;
        match facade.store().sweep_events(retain_days) {
            Ok(0) => {}
            Ok(swept) => tracing::debug!(swept, "old events swept"),
            Err(e) => tracing::warn!(error = %e, "event retention sweep failed"),
        }
    }
}

/// Publish a correlator mode-switch warning onto the record.
pub(crate) fn flood_warning_event(entering: bool) -> SecurityEvent {
    SecurityEvent::new("correlator", EventKind::RateAnomaly, Severity::High).with_raw(if entering {
        "event flood: correlator switched to aggregation mode"
    } else {
        "event flood subsided: full correlation resumed"
    })
}
