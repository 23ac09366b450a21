//! Intent and step state.
//!
//! An Intent is a running or finished instance of an `IntentTemplate`. Only
//! the orchestrator moves `Intent::state` and `IntentStep::status`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::{Actor, Decision};
use super::template::{IntentTemplate, TemplateStep};
use crate::error::{GovernanceError, GovernanceResult};
use crate::evidence::Evidence;

/// A multi-step governed workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,

    /// Pinned template
    pub template_name: String,
    pub template_version: u32,

    pub state: IntentState,

    /// Sequence of the last completed (or skipped) step, 0 before any
    pub current_step: u32,

    /// Who the intent acts for
    pub actor: Actor,

    /// Shared by every ledger event and step of this intent
    pub correlation_id: Uuid,

    /// Set for nested intents
    pub parent_intent_id: Option<Uuid>,

    /// Input parameters
    pub context: serde_json::Value,

    /// Evidence presented with every step evaluation
    pub evidence: Evidence,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,

    /// Computed once at `start`
    pub timeout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Optimistic-concurrency version, bumped by every write
    pub version: i64,
}

impl Intent {
    /// Create a pending intent pinned to `template`
    pub fn new(
        template: &IntentTemplate,
        actor: Actor,
        context: serde_json::Value,
        evidence: Evidence,
        parent_intent_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_name: template.name.clone(),
            template_version: template.version,
            state: IntentState::Pending,
            current_step: 0,
            actor,
            correlation_id: Uuid::new_v4(),
            parent_intent_id,
            context,
            evidence,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            timeout_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.state)
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    ///
    /// Every state write goes through here; nothing else assigns `state`.
    pub fn transition_to(&mut self, next: IntentState) -> GovernanceResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(GovernanceError::InvalidTransition {
                intent_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether the deadline has passed at `now`
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Lifecycle state of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
    TimedOut,
}

impl IntentState {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: IntentState) -> bool {
        use IntentState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, TimedOut)
                | (Failed, RolledBack)
                | (TimedOut, RolledBack)
        )
    }

    /// States from which rollback may run
    pub fn is_rollback_eligible(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown intent state '{}'", other)),
        }
    }
}

/// Whether no further forward progress is possible from `state`.
///
/// `failed` and `timed_out` are terminal for forward progress even though
/// rollback may still move them to `rolled_back`.
pub fn is_terminal(state: IntentState) -> bool {
    !matches!(state, IntentState::Pending | IntentState::InProgress)
}

/// Longest deadline representable without overflow concerns (100 years)
const MAX_TIMEOUT_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Deadline for an intent started at `started_at`
pub fn compute_timeout_at(template: &IntentTemplate, started_at: DateTime<Utc>) -> DateTime<Utc> {
    deadline_after(started_at, template.timeout().as_secs())
}

/// `started_at + seconds`, clamped to a sane horizon
pub fn deadline_after(started_at: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let seconds = seconds.min(MAX_TIMEOUT_SECONDS) as i64;
    started_at + ChronoDuration::seconds(seconds)
}

/// One governed unit of work within an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentStep {
    pub id: Uuid,
    pub intent_id: Uuid,

    /// Unique per intent, contiguous from 1
    pub sequence_num: u32,

    pub action: String,
    pub required: bool,
    pub requires_role: Option<String>,

    pub status: StepStatus,

    /// Decision returned for this step's action
    pub policy_decision: Option<Decision>,

    /// Ledger event produced when this step was evaluated
    pub ledger_event_id: Option<Uuid>,

    pub attempt_count: u32,
    pub max_attempts: u32,

    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IntentStep {
    /// Materialize a pending step from its template definition
    pub fn from_template(intent_id: Uuid, step: &TemplateStep, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            sequence_num: step.sequence,
            action: step.action.clone(),
            required: step.required,
            requires_role: step.requires_role.clone(),
            status: StepStatus::Pending,
            policy_decision: None,
            ledger_event_id: None,
            attempt_count: 0,
            max_attempts,
            input: None,
            output: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether this step no longer blocks its successor
    pub fn is_settled(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Skipped)
    }

    /// Whether the executor was invoked at least once
    pub fn was_executed(&self) -> bool {
        self.attempt_count > 0
    }
}

/// Status of a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    InProgress,

    /// Completed successfully
    Completed,

    /// Failed (denied or attempts exhausted)
    Failed,

    /// Optional step that did not run to completion
    Skipped,

    /// Compensated during rollback
    RolledBack,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::template::{RetryPolicy, TemplateStep};

    fn template(timeout_seconds: Option<u64>) -> IntentTemplate {
        IntentTemplate {
            name: "grading".to_string(),
            version: 1,
            description: String::new(),
            policy_scope: "experience:lms".to_string(),
            resource_type: "assignment".to_string(),
            steps: vec![TemplateStep::new(1, "assignment:grade")],
            rollback_on_failure: Vec::new(),
            compensations: Default::default(),
            timeout_seconds,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        use IntentState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(TimedOut));
        assert!(Failed.can_transition_to(RolledBack));
        assert!(TimedOut.can_transition_to(RolledBack));

        assert!(!Pending.can_transition_to(RolledBack));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(InProgress));
    }

    #[test]
    fn test_transition_to_follows_state_machine() {
        let mut intent = Intent::new(
            &template(None),
            Actor::user("dana", "instructor"),
            serde_json::json!({}),
            Evidence::default(),
            None,
            Utc::now(),
        );

        intent.transition_to(IntentState::InProgress).unwrap();
        intent.transition_to(IntentState::Failed).unwrap();
        assert_eq!(intent.state, IntentState::Failed);

        let err = intent.transition_to(IntentState::Completed).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                from: IntentState::Failed,
                to: IntentState::Completed,
                ..
            }
        ));
        assert_eq!(intent.state, IntentState::Failed);

        intent.transition_to(IntentState::RolledBack).unwrap();
        assert!(intent.is_terminal());
        assert!(intent.transition_to(IntentState::RolledBack).is_err());
    }

    #[test]
    fn test_is_terminal() {
        assert!(!is_terminal(IntentState::Pending));
        assert!(!is_terminal(IntentState::InProgress));
        assert!(is_terminal(IntentState::Completed));
        assert!(is_terminal(IntentState::Failed));
        assert!(is_terminal(IntentState::TimedOut));
        assert!(is_terminal(IntentState::RolledBack));
    }

    #[test]
    fn test_compute_timeout_at() {
        let started = Utc::now();
        assert_eq!(
            compute_timeout_at(&template(Some(60)), started),
            started + ChronoDuration::seconds(60)
        );
        assert_eq!(
            compute_timeout_at(&template(None), started),
            started + ChronoDuration::seconds(1800)
        );
    }

    #[test]
    fn test_state_round_trip_strings() {
        for state in [
            IntentState::Pending,
            IntentState::InProgress,
            IntentState::RolledBack,
            IntentState::TimedOut,
        ] {
            assert_eq!(state.as_str().parse::<IntentState>().unwrap(), state);
        }
        assert_eq!(
            serde_json::to_string(&StepStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
