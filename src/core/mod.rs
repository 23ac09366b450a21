//! Core governance logic.
//!
//! This module contains:
//! - Database: SQLite connection and schema (append-only ledger and history)
//! - LedgerStore / LedgerRecorder: immutable policy decision records
//! - TemplateRegistry: versioned workflow definitions
//! - IntentStore: intents, steps and history under optimistic concurrency
//! - Orchestrator: main execution engine
//! - RollbackCoordinator / TimeoutSweeper: compensation and deadlines

pub mod clock;
pub mod context;
pub mod db;
pub(crate) mod governed;
pub mod idempotency;
pub mod intent_store;
pub mod ledger_store;
pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod rollback;
pub mod sweep;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{GovernanceContext, OrchestratorSettings};
pub use db::{Database, StoreError, StoreResult};
pub use idempotency::{generate_idempotency_key, hash_input};
pub use intent_store::IntentStore;
pub use ledger_store::{DecisionCounts, LedgerPage, LedgerQuery, LedgerStore, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
pub use orchestrator::{CreateIntent, Orchestrator};
pub use recorder::{LedgerRecorder, RecordMetadata};
pub use registry::TemplateRegistry;
pub use rollback::RollbackCoordinator;
pub use sweep::{SweepHandle, SweepReport, TimeoutSweeper};
