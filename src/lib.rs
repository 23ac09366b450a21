//! govflow - Governance ledger and intent orchestrator
//!
//! Every governed action is evaluated by a policy engine and recorded as an
//! immutable ledger event. Multi-step workflows ("intents") run as strictly
//! ordered, individually governed steps with rollback and a deadline.
//!
//! # Architecture
//!
//! - Ledger events are append-only; replaying an event is de-duplicated on
//!   `(correlation_id, sequence_num)`
//! - Intent state is mutated only through version-checked commits, so a
//!   concurrent `cancel` or timeout sweep is never silently overwritten
//! - Every state change also lands in the intent's append-only history
//!
//! # Modules
//!
//! - `adapters`: Policy evaluator, step executor and notifier seams
//! - `api`: Ledger API contracts
//! - `core`: Orchestration logic (stores, recorder, orchestrator, rollback, sweep)
//! - `domain`: Data structures (LedgerEvent, IntentTemplate, Intent)
//! - `evidence`: Claims and asserted facts, and their wire codec
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a template
//! govflow template register templates/deployment.yaml
//!
//! # Run an intent end to end
//! govflow intent run deployment --user alice --role release-manager
//!
//! # Inspect what happened
//! govflow intent history <intent-id>
//! govflow ledger events --intent-id <intent-id>
//!
//! # Enforce deadlines
//! govflow sweep --watch
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod evidence;

// Re-export main types at crate root for convenience
pub use core::{
    CreateIntent, Database, GovernanceContext, LedgerRecorder, Orchestrator, RollbackCoordinator,
    TemplateRegistry, TimeoutSweeper,
};
pub use domain::{
    Actor, Decision, Intent, IntentState, IntentStep, IntentTemplate, LedgerEvent, LedgerLevel,
    StepStatus,
};
pub use error::{GovernanceError, GovernanceResult};
pub use evidence::Evidence;
