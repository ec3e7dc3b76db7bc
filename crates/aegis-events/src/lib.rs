//! # aegis-events
//!
//! Event-driven log ingestion: the bus, the log sources, and the threat
//! feed poller.
//!
//! Sources publish [`SecurityEvent`]s through per-source bounded queues
//! with an explicit drop policy: low-severity events are shed first under
//! backpressure and the shed count is itself an audited event; critical
//! events are never dropped. A single consumer (the correlator) drains the
//! merged stream, which preserves per-source observation order.
//!
//! The bus also holds the active causal windows published by the
//! deployment controller: events plausibly caused by the daemon's own
//! rules are stamped with the deployment id so the correlator can ignore
//! them.
//!
//! [`SecurityEvent`]: aegis_store::SecurityEvent

pub mod bus;
pub mod error;
pub mod feed;
pub mod parsers;
pub mod source;
pub mod tail;

pub use bus::{EventBus, SourcePublisher};
pub use error::SourceError;
pub use feed::{FeedFormat, FeedSource};
pub use parsers::{parser_by_name, KernelDropParser, LineParser, SshdParser};
pub use source::{supervise, LogSource};
pub use tail::FileTailSource;
