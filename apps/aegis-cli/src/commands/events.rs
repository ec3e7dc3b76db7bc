// events.rs — follow the live security event stream.

use anyhow::Result;
use tokio_stream::StreamExt;

use aegis_service::Facade;

pub async fn follow(facade: &Facade, since_minutes: Option<i64>) -> Result<()> {
    let since = since_minutes.map(|m| chrono::Utc::now() - chrono::Duration::minutes(m));
    let stream = facade.subscribe_events(since);
    tokio::pin!(stream);

    eprintln!("following events (ctrl-c to stop)");
    while let Some(event) = stream.next().await {
        println!(
            "{}  {:14} {:8} {:16} {} {}",
            event.observed_at.to_rfc3339(),
            event.kind.as_str(),
            event.severity.as_str(),
            event
                .source_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string()),
            event.source_name,
            event.target.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
