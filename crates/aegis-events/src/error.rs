// error.rs — Log source and feed errors.
//
// Source errors never propagate out of the daemon: the supervisor logs
// them, audits the restart, and starts the source again with backoff.

use thiserror::Error;

/// Failure inside a log source or feed poller.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown parser '{0}'")]
    UnknownParser(String),

    #[error("feed request failed: {0}")]
    Feed(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] aegis_store::StoreError),

    #[error("bus closed")]
    BusClosed,
}
