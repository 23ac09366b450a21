//! Error taxonomy for governed operations.
//!
//! A `deny` decision is not an error: it fails the step and is visible on the
//! returned intent and in the ledger.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::core::db::StoreError;
use crate::domain::IntentState;
use crate::evidence::EvidenceError;

/// Errors returned by the recorder, registry, orchestrator and rollback
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Malformed actor or evidence; a caller bug, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// `(name, version)` already registered with a different definition
    #[error("template '{name}' version {version} is already registered with a different definition")]
    Conflict { name: String, version: u32 },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("template '{name}' not found{}", version_suffix(.version))]
    TemplateNotFound { name: String, version: Option<u32> },

    #[error("intent not found: {0}")]
    IntentNotFound(Uuid),

    #[error("intent {intent_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        intent_id: Uuid,
        from: IntentState,
        to: IntentState,
    },

    /// A step's predecessor has not settled
    #[error("intent {intent_id}: step {sequence} cannot run before step {} settles", .sequence.saturating_sub(1))]
    StepOutOfOrder { intent_id: Uuid, sequence: u32 },

    /// The intent left `in_progress` underneath an in-flight operation
    #[error("intent {intent_id} is {state}; operation aborted")]
    IntentNotActive { intent_id: Uuid, state: IntentState },

    /// Lost an optimistic-concurrency race
    #[error("intent {intent_id} changed concurrently (expected version {expected_version})")]
    StaleState { intent_id: Uuid, expected_version: i64 },

    /// Deadline passed; the timeout sweep owns the transition
    #[error("intent {intent_id} exceeded its deadline at {timeout_at}")]
    TimeoutExceeded {
        intent_id: Uuid,
        timeout_at: DateTime<Utc>,
    },

    /// Compensation failed; requires operator intervention
    #[error("rollback of intent {intent_id} incomplete at step {step_sequence}: {reason}")]
    RollbackIncomplete {
        intent_id: Uuid,
        step_sequence: u32,
        reason: String,
    },

    #[error("policy evaluator unavailable: {0}")]
    PolicyUnavailable(String),

    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl GovernanceError {
    /// Caller bugs that must not be retried
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Conflict { .. }
                | Self::InvalidTemplate(_)
                | Self::TemplateNotFound { .. }
                | Self::IntentNotFound(_)
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<StoreError> for GovernanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                intent_id,
                expected_version,
            } => Self::StaleState {
                intent_id,
                expected_version,
            },
            other => Self::Storage(other),
        }
    }
}

impl From<EvidenceError> for GovernanceError {
    fn from(err: EvidenceError) -> Self {
        Self::Validation(err.to_string())
    }
}

fn version_suffix(version: &Option<u32>) -> String {
    version.map(|v| format!(" (version {})", v)).unwrap_or_default()
}

pub type GovernanceResult<T> = Result<T, GovernanceError>;
