//! # aegis-backend
//!
//! The backend adapter contract: the seam between Aegis's neutral rule
//! model and a concrete firewall system.
//!
//! An adapter advertises a [`Capabilities`] set, renders [`PolicyRule`]s
//! into backend text, and performs the mutation primitives the deployment
//! controller needs: snapshot, atomic apply, delta apply, restore. All
//! operations fail with a typed [`AdapterError`] whose kind the controller
//! uses to decide between retry, surface, and catastrophic handling.
//!
//! Adapters register in-process in an [`AdapterRegistry`]. Only one adapter
//! is active per host; activating a second adapter over the same kernel
//! subsystem fails with a `coexistence` error.
//!
//! [`PolicyRule`]: aegis_policy::PolicyRule

pub mod adapter;
pub mod capabilities;
pub mod error;
pub mod registry;

pub use adapter::{
    ApplyReceipt, BackendAdapter, BackupRef, DeltaOp, Health, ImportReport, RenderedRule,
    RuleSetImage, Verdict,
};
pub use capabilities::{Capabilities, EvaluationOrder};
pub use error::AdapterError;
pub use registry::AdapterRegistry;
