//! # aegis-policy
//!
//! Backend-neutral firewall rule model for Aegis.
//!
//! A [`PolicyRule`] captures the *intent* of a firewall rule (who to match
//! and what to do) without committing to any backend syntax. Rendering to
//! backend text is the job of an adapter; this crate never produces it.
//!
//! The crate also owns the [`NeverBlockList`]: the set of subjects that
//! autonomous logic must never target, including the host's own management
//! addresses discovered at startup.
//!
//! ## Quick Example
//!
//! ```rust
//! use aegis_policy::{PolicyRule, Action, Direction, Protocol, RuleOrigin};
//!
//! let rule = PolicyRule::builder()
//!     .direction(Direction::Input)
//!     .action(Action::Drop)
//!     .source("203.0.113.7/32").unwrap()
//!     .protocol(Protocol::Tcp)
//!     .destination_port(22)
//!     .origin(RuleOrigin::User)
//!     .comment("block brute forcer")
//!     .build()
//!     .unwrap();
//! assert_eq!(rule.action, Action::Drop);
//! ```

pub mod error;
pub mod net;
pub mod never_block;
pub mod ports;
pub mod rule;

pub use error::PolicyError;
pub use net::IpNet;
pub use never_block::{NeverBlockEntry, NeverBlockList};
pub use ports::PortSpec;
pub use rule::{
    Action, AddrSpec, Direction, Family, PolicyRule, PolicyRuleBuilder, Protocol, RateLimit,
    RuleOrigin,
};
