//! # corvusforge-core
//!
//! The integrity and trust core of Corvusforge, an auditable,
//! deterministic pipeline orchestrator. This crate drives a fixed sequence
//! of build/verification stages while producing a tamper-evident record of
//! every state transition and every artifact.
//!
//! ## Components
//!
//! - **Run ledger**: append-only, hash-chained, `SQLite`-backed, with
//!   external anchor export and verification
//! - **Stage machine**: prerequisite DAG traversal, cascade blocking, and
//!   signed-waiver bypass
//! - **Artifact store**: content-addressed, immutable, keyed by SHA-256
//! - **Crypto chain**: capability-probed Ed25519 providers with a
//!   fail-closed floor, key fingerprints, and trust-context sealing
//! - **Waiver manager**: signed gate-bypass artifacts with
//!   strict/permissive enforcement
//! - **Envelope validator** and **sink dispatcher**: contracted messaging
//!   with per-sink failure isolation
//! - **Production guard**: startup gate over all of the above
//!
//! The ledger's hash chain is the single source of truth; monitors and
//! dashboards are projections of it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use corvusforge_core::config::ForgeConfig;
//! use corvusforge_core::orchestrator::Orchestrator;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(ForgeConfig::default())?;
//! orchestrator.start_run(Some(json!(["repo cloned"])))?;
//! orchestrator.execute_stage("s1_prerequisites", json!({}))?;
//! orchestrator.verify_chain()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod graph;
pub mod guard;
pub mod hasher;
pub mod ledger;
pub mod orchestrator;
pub mod routing;
pub mod stage;
pub mod timefmt;
pub mod versioning;
pub mod waiver;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::FsArtifactStore;
    pub use crate::config::{Environment, ForgeConfig};
    pub use crate::crypto::ProviderChain;
    pub use crate::ledger::{LedgerEntry, RunLedger};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::stage::{StageMachine, StageState};
    pub use crate::waiver::{WaiverArtifact, WaiverManager, WaiverScope};
}

pub use config::ForgeConfig;
pub use orchestrator::Orchestrator;
pub use stage::StageState;
