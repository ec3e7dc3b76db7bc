// feed.rs — Threat feed polling.
//
// A feed is an HTTP(S) resource listing bad subjects, polled on a
// schedule. The body is cached content-addressed by URL, revalidated with
// the ETag, and discarded entirely once older than age_max. Each poll
// emits feed_indicator events for subjects not seen in the previous poll.
// A failed or timed-out poll skips the cycle and tries again next time;
// it never kills the source.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use aegis_store::{EventKind, SecurityEvent, Severity};

use crate::bus::SourcePublisher;
use crate::error::SourceError;
use crate::source::LogSource;

/// How the feed body is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// One indicator per line; `#` comments allowed.
    Text,
    /// First column of each row.
    Csv,
    /// JSON array of strings, or of objects with an `ip` field.
    Json,
}

impl FeedFormat {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "text" => Some(FeedFormat::Text),
            "csv" => Some(FeedFormat::Csv),
            "json" => Some(FeedFormat::Json),
            _ => None,
        }
    }
}

/// A polled threat feed, run as a log source.
pub struct FeedSource {
    name: String,
    url: String,
    format: FeedFormat,
    interval: Duration,
    age_max: Duration,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl FeedSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        format: FeedFormat,
        interval: Duration,
        age_max: Duration,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format,
            interval,
            age_max,
            cache_dir: cache_dir.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    fn cache_stem(&self) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        self.cache_dir.join(format!("{:x}", hasher.finalize()))
    }

    fn read_cache(&self) -> Option<CachedFeed> {
        let doc = std::fs::read_to_string(self.cache_stem().with_extension("json")).ok()?;
        serde_json::from_str(&doc).ok()
    }

    fn write_cache(&self, cache: &CachedFeed) {
        let _ = std::fs::create_dir_all(&self.cache_dir);
        if let Ok(doc) = serde_json::to_string(cache) {
            let _ = std::fs::write(self.cache_stem().with_extension("json"), doc);
        }
    }

    /// One poll cycle. Returns the indicators new since the last cycle.
    async fn poll(&self) -> Result<Vec<IpAddr>, SourceError> {
        let cached = self.read_cache();

        let mut request = self.client.get(&self.url);
        if let Some(cache) = &cached {
            if let Some(etag) = &cache.etag {
                request = request.header(reqwest::header::IF_NONE_MATCH, etag);
            }
        }
        let response = request.send().await?;

        let age_max = chrono::Duration::from_std(self.age_max).unwrap_or_default();
        let (body, etag, previous_seen) = if response.status() == reqwest::StatusCode::NOT_MODIFIED
        {
            let Some(cache) = cached else {
                return Ok(Vec::new());
            };
            if Utc::now() - cache.fetched_at > age_max {
                // Not modified but too old to trust: discard.
                return Ok(Vec::new());
            }
            (cache.body, cache.etag, cache.seen)
        } else {
            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.error_for_status()?.text().await?;
            let previous = cached.map(|c| c.seen).unwrap_or_default();
            (body, etag, previous)
        };

        let indicators = parse_indicators(self.format, &body);
        let fresh: Vec<IpAddr> = indicators
            .iter()
            .filter(|ip| !previous_seen.contains(&ip.to_string()))
            .copied()
            .collect();

        self.write_cache(&CachedFeed {
            etag,
            body,
            fetched_at: Utc::now(),
            seen: indicators.iter().map(IpAddr::to_string).collect(),
        });
        Ok(fresh)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CachedFeed {
    etag: Option<String>,
    body: String,
    fetched_at: DateTime<Utc>,
    seen: BTreeSet<String>,
}

#[async_trait]
impl LogSource for FeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        publisher: SourcePublisher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.poll().await {
                Ok(fresh) => {
                    for ip in fresh {
                        let event =
                            SecurityEvent::new(&self.name, EventKind::FeedIndicator, Severity::Medium)
                                .with_source_ip(ip)
                                .with_target(self.url.clone());
                        publisher.publish(event).await?;
                    }
                }
                // A bad cycle (timeout, 5xx) is skipped, not fatal.
                Err(err) => {
                    tracing::warn!(feed = %self.name, error = %err, "feed poll skipped");
                }
            }

            publisher.flush_drop_count().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Extract IP indicators from a feed body.
pub fn parse_indicators(format: FeedFormat, body: &str) -> Vec<IpAddr> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        // Plain address, or the network part of a CIDR.
        let parsed: Option<IpAddr> = candidate
            .parse()
            .ok()
            .or_else(|| candidate.split('/').next()?.parse().ok());
        if let Some(ip) = parsed {
            if seen.insert(ip) {
                out.push(ip);
            }
        }
    };

    match format {
        FeedFormat::Text => {
            for line in body.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(token) = line.split_whitespace().next() {
                    push(token);
                }
            }
        }
        FeedFormat::Csv => {
            for line in body.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(field) = line.split(',').next() {
                    push(field.trim_matches('"'));
                }
            }
        }
        FeedFormat::Json => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
                if let Some(items) = value.as_array() {
                    for item in items {
                        match item {
                            serde_json::Value::String(s) => push(s),
                            serde_json::Value::Object(map) => {
                                if let Some(ip) = map.get("ip").and_then(|v| v.as_str()) {
                                    push(ip);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    out
}
