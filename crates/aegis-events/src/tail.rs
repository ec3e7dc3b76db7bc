// tail.rs — Rotation-aware file tailing.
//
// The tailer polls the file for growth, re-opens on rotation (inode change
// or truncation), and persists its cursor in daemon_state so a restarted
// daemon resumes where it left off instead of re-emitting history. On
// first acquaintance with a file it starts at the end: old log content is
// history, not new signal.
//
// Identical consecutive lines within a short window are coalesced; log
// floods repeat themselves, and one event per distinct observation is
// enough for scoring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use aegis_store::Store;

use crate::bus::SourcePublisher;
use crate::error::SourceError;
use crate::parsers::LineParser;
use crate::source::LogSource;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Cursor {
    offset: u64,
    inode: u64,
}

/// Tail a plaintext log file through a parser.
pub struct FileTailSource {
    name: String,
    path: PathBuf,
    parser: Box<dyn LineParser>,
    store: Arc<Store>,
    poll_interval: Duration,
    coalesce_window: Duration,
    budget: usize,
}

impl FileTailSource {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        parser: Box<dyn LineParser>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            parser,
            store,
            poll_interval: Duration::from_millis(500),
            coalesce_window: Duration::from_secs(2),
            budget: crate::bus::DEFAULT_SOURCE_BUDGET,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    fn cursor_key(&self) -> String {
        format!("source.{}.cursor", self.name)
    }

    fn load_cursor(&self) -> Option<Cursor> {
        self.store
            .daemon_state_get(&self.cursor_key())
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_str(&v).ok())
    }

    fn save_cursor(&self, cursor: Cursor) -> Result<(), SourceError> {
        let value = serde_json::to_string(&cursor).expect("cursor serializes");
        self.store.daemon_state_set(&self.cursor_key(), &value)?;
        Ok(())
    }

    #[cfg(unix)]
    fn inode_of(metadata: &std::fs::Metadata) -> u64 {
        use std::os::unix::fs::MetadataExt;
        metadata.ino()
    }

    #[cfg(not(unix))]
    fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
        0
    }
}

#[async_trait]
impl LogSource for FileTailSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn budget(&self) -> usize {
        self.budget
    }

    async fn run(
        &self,
        publisher: SourcePublisher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let mut cursor = self.load_cursor();
        let mut last_line: Option<String> = None;
        let mut last_emit = Utc::now() - chrono::Duration::hours(1);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let metadata = match std::fs::metadata(&self.path) {
                Ok(metadata) => metadata,
                Err(_) => {
                    // File absent (not yet created, mid-rotation): wait.
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                        _ = shutdown.changed() => continue,
                    }
                }
            };

            let inode = Self::inode_of(&metadata);
            let len = metadata.len();
            let mut current = match cursor {
                // Rotation: new inode, or the file shrank beneath us.
                Some(c) if c.inode != inode || len < c.offset => Cursor { offset: 0, inode },
                Some(c) => c,
                // First acquaintance: start at the end.
                None => Cursor { offset: len, inode },
            };

            if len > current.offset {
                let mut file = tokio::fs::File::open(&self.path).await.map_err(|source| {
                    SourceError::Io {
                        path: self.path.display().to_string(),
                        source,
                    }
                })?;
                file.seek(std::io::SeekFrom::Start(current.offset))
                    .await
                    .map_err(|source| SourceError::Io {
                        path: self.path.display().to_string(),
                        source,
                    })?;
                let mut buf = Vec::with_capacity((len - current.offset) as usize);
                file.read_to_end(&mut buf)
                    .await
                    .map_err(|source| SourceError::Io {
                        path: self.path.display().to_string(),
                        source,
                    })?;

                // Only consume complete lines; a partial tail line stays
                // for the next poll.
                let consumed = match buf.iter().rposition(|b| *b == b'\n') {
                    Some(pos) => pos + 1,
                    None => 0,
                };
                let text = String::from_utf8_lossy(&buf[..consumed]);
                for line in text.lines() {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }

                    // Coalesce identical repeats inside the window.
                    let now = Utc::now();
                    let window =
                        chrono::Duration::from_std(self.coalesce_window).unwrap_or_default();
                    if last_line.as_deref() == Some(line) && now - last_emit < window {
                        continue;
                    }

                    if let Some(mut event) = self.parser.parse(line) {
                        event.source_name = self.name.clone();
                        publisher.publish(event).await?;
                        last_line = Some(line.to_string());
                        last_emit = now;
                    }
                }
                current.offset += consumed as u64;
                self.save_cursor(current)?;
            }
            cursor = Some(current);

            publisher.flush_drop_count().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
