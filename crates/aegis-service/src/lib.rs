//! # aegis-service
//!
//! The service facade: the single entry point every consumer (CLI,
//! daemon, any future surface) goes through. The facade is the sole
//! writer against the store and the backend adapter; consumers never reach
//! around it.
//!
//! It also owns the configuration surface (`aegis.toml`, unknown keys are
//! errors) and the translator contract: natural-language rule drafting is
//! an external inference endpoint whose output is a *draft input*,
//! validated, rendered, and conflict-analyzed like any operator rule,
//! never applied verbatim.

pub mod config;
pub mod error;
pub mod facade;
pub mod translator;

pub use config::AegisConfig;
pub use error::{ErrorKind, ServiceError};
pub use facade::{DaemonStatus, Facade};
pub use translator::{DisabledTranslator, HttpTranslator, RuleDraft, Translator};
