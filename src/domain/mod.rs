//! Domain types for the governance ledger and intent orchestrator.
//!
//! This module contains the core data structures:
//! - Ledger: immutable policy decision records and their vocabulary
//! - Template: versioned workflow definitions
//! - Intent: workflow instances and their steps
//! - Events: intent lifecycle history

pub mod events;
pub mod intent;
pub mod ledger;
pub mod template;

// Re-export commonly used types
pub use events::{replay_state, IntentEvent, IntentEventType, SWEEPER_ACTOR};
pub use intent::{compute_timeout_at, deadline_after, is_terminal, Intent, IntentState, IntentStep, StepStatus};
pub use ledger::{Actor, Decision, Layer, LedgerEvent, LedgerLevel, NewLedgerEvent};
pub use template::{
    rollback_action, IntentTemplate, RetryPolicy, TemplateStep, DEFAULT_TIMEOUT_SECONDS,
    ROLLBACK_SUFFIX,
};
