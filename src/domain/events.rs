//! Intent lifecycle events.
//!
//! Every state transition on an intent or one of its steps is recorded as an
//! immutable `IntentEvent`. Ledger events capture policy decisions; these
//! capture the orchestration narrative around them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::{Intent, IntentState};

/// Actor recorded for transitions made by the timeout sweep
pub const SWEEPER_ACTOR: &str = "system:timeout-sweeper";

/// A single entry in an intent's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub id: Uuid,
    pub intent_id: Uuid,

    /// Step this event concerns (if applicable)
    pub step_sequence: Option<u32>,

    pub event_type: IntentEventType,

    /// State before the transition (intent or step state, as text)
    pub previous_state: Option<String>,

    /// State after the transition
    pub new_state: String,

    /// Principal that caused the transition
    pub actor: String,

    pub correlation_id: Uuid,

    /// Human-readable detail (NO secrets)
    pub detail: Option<String>,

    pub occurred_at: DateTime<Utc>,
}

impl IntentEvent {
    /// Event for an intent-level transition
    pub fn transition(
        intent: &Intent,
        event_type: IntentEventType,
        previous: Option<IntentState>,
        actor: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            step_sequence: None,
            event_type,
            previous_state: previous.map(|s| s.to_string()),
            new_state: intent.state.to_string(),
            actor: actor.into(),
            correlation_id: intent.correlation_id,
            detail: None,
            occurred_at,
        }
    }

    /// Event for a step-level transition
    pub fn step(
        intent: &Intent,
        sequence: u32,
        event_type: IntentEventType,
        previous: impl fmt::Display,
        new: impl fmt::Display,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            step_sequence: Some(sequence),
            event_type,
            previous_state: Some(previous.to_string()),
            new_state: new.to_string(),
            actor: intent.actor.principal(),
            correlation_id: intent.correlation_id,
            detail: None,
            occurred_at,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Types of intent lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentEventType {
    Created,
    Started,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetrying,
    StepSkipped,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    RollbackStarted,
    StepRolledBack,
    RollbackFailed,
    RollbackCompleted,
}

impl IntentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepRetrying => "step_retrying",
            Self::StepSkipped => "step_skipped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::RollbackStarted => "rollback_started",
            Self::StepRolledBack => "step_rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::RollbackCompleted => "rollback_completed",
        }
    }

    /// Whether this event records an intent-level state change
    pub fn is_intent_transition(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Started
                | Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::TimedOut
                | Self::RollbackCompleted
        )
    }
}

impl fmt::Display for IntentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s {
            "created" => Self::Created,
            "started" => Self::Started,
            "step_started" => Self::StepStarted,
            "step_completed" => Self::StepCompleted,
            "step_failed" => Self::StepFailed,
            "step_retrying" => Self::StepRetrying,
            "step_skipped" => Self::StepSkipped,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            "rollback_started" => Self::RollbackStarted,
            "step_rolled_back" => Self::StepRolledBack,
            "rollback_failed" => Self::RollbackFailed,
            "rollback_completed" => Self::RollbackCompleted,
            other => return Err(format!("unknown intent event type '{}'", other)),
        };
        Ok(parsed)
    }
}

/// Reconstruct the intent state implied by its history.
///
/// Used to cross-check the stored state against the narrative.
pub fn replay_state(events: &[IntentEvent]) -> Option<IntentState> {
    events
        .iter()
        .filter(|e| e.event_type.is_intent_transition())
        .filter_map(|e| e.new_state.parse::<IntentState>().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::Actor;
    use crate::domain::template::{IntentTemplate, RetryPolicy, TemplateStep};
    use crate::evidence::Evidence;

    fn intent() -> Intent {
        let template = IntentTemplate {
            name: "secret-rotation".to_string(),
            version: 2,
            description: String::new(),
            policy_scope: "infra:vault".to_string(),
            resource_type: "secret".to_string(),
            steps: vec![TemplateStep::new(1, "secret:rotate")],
            rollback_on_failure: Vec::new(),
            compensations: Default::default(),
            timeout_seconds: None,
            retry_policy: RetryPolicy::default(),
        };
        Intent::new(
            &template,
            Actor::agent("rotator", "operator"),
            serde_json::json!({}),
            Evidence::default(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_event_serialization() {
        let intent = intent();
        let event = IntentEvent::transition(&intent, IntentEventType::Created, None, "agent:rotator", Utc::now())
            .with_detail("created from template secret-rotation v2");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: IntentEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, IntentEventType::Created);
        assert_eq!(parsed.new_state, "pending");
        assert_eq!(parsed.correlation_id, intent.correlation_id);
    }

    #[test]
    fn test_replay_state_follows_transitions() {
        let mut intent = intent();
        let now = Utc::now();
        let mut events = vec![IntentEvent::transition(&intent, IntentEventType::Created, None, "x", now)];

        intent.state = IntentState::InProgress;
        events.push(IntentEvent::transition(
            &intent,
            IntentEventType::Started,
            Some(IntentState::Pending),
            "x",
            now,
        ));
        events.push(IntentEvent::step(&intent, 1, IntentEventType::StepStarted, "pending", "in_progress", now));

        assert_eq!(replay_state(&events), Some(IntentState::InProgress));

        intent.state = IntentState::Cancelled;
        events.push(IntentEvent::transition(
            &intent,
            IntentEventType::Cancelled,
            Some(IntentState::InProgress),
            "x",
            now,
        ));
        assert_eq!(replay_state(&events), Some(IntentState::Cancelled));
        assert_eq!(replay_state(&[]), None);
    }
}
