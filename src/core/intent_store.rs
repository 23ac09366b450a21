//! Persistence for intents, their steps and their history.
//!
//! Every mutation goes through [`IntentStore::commit`], which writes the
//! intent row, any changed steps and the accompanying history events in one
//! transaction guarded by a compare-and-swap on `intents.version`. A writer
//! that read a stale version gets `StoreError::VersionConflict` and nothing
//! is written.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Actor, Intent, IntentEvent, IntentStep};
use crate::evidence::Evidence;

use super::db::{
    format_ts, from_json_opt, parse_enum, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid,
    to_json_opt, Database, StoreError, StoreResult,
};

const INTENT_COLUMNS: &str = "id, template_name, template_version, state, current_step, \
    actor_user_id, actor_agent_id, actor_role, delegation_id, correlation_id, parent_intent_id, \
    context, evidence, result, error, created_at, started_at, timeout_at, completed_at, version";

const STEP_COLUMNS: &str = "id, intent_id, sequence_num, action, required, requires_role, status, \
    policy_decision, ledger_event_id, attempt_count, max_attempts, input, output, error_message, \
    started_at, completed_at";

const EVENT_COLUMNS: &str = "id, intent_id, step_sequence, event_type, previous_state, new_state, \
    actor, correlation_id, detail, occurred_at";

/// SQLite-backed intent state
#[derive(Clone)]
pub struct IntentStore {
    db: Database,
}

impl IntentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a freshly created intent with its pending steps
    pub fn insert(&self, intent: &Intent, steps: &[IntentStep], event: &IntentEvent) -> StoreResult<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let wire_evidence = serde_json::to_string(&intent.evidence)?;
        tx.execute(
            &format!(
                "INSERT INTO intents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                INTENT_COLUMNS
            ),
            params![
                intent.id.to_string(),
                intent.template_name,
                intent.template_version,
                intent.state.as_str(),
                intent.current_step,
                intent.actor.user_id,
                intent.actor.agent_id,
                intent.actor.role.clone().unwrap_or_default(),
                intent.actor.delegation_id,
                intent.correlation_id.to_string(),
                intent.parent_intent_id.map(|id| id.to_string()),
                serde_json::to_string(&intent.context)?,
                wire_evidence,
                to_json_opt(&intent.result)?,
                intent.error,
                format_ts(intent.created_at),
                intent.started_at.map(format_ts),
                intent.timeout_at.map(format_ts),
                intent.completed_at.map(format_ts),
                intent.version,
            ],
        )?;

        for step in steps {
            tx.execute(
                &format!(
                    "INSERT INTO intent_steps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, \
                     ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    STEP_COLUMNS
                ),
                params![
                    step.id.to_string(),
                    step.intent_id.to_string(),
                    step.sequence_num,
                    step.action,
                    step.required,
                    step.requires_role,
                    step.status.as_str(),
                    step.policy_decision.map(|d| d.as_str()),
                    step.ledger_event_id.map(|id| id.to_string()),
                    step.attempt_count,
                    step.max_attempts,
                    to_json_opt(&step.input)?,
                    to_json_opt(&step.output)?,
                    step.error_message,
                    step.started_at.map(format_ts),
                    step.completed_at.map(format_ts),
                ],
            )?;
        }

        insert_event(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Write `intent`, changed `steps` and `events` atomically.
    ///
    /// `intent.version` must equal the stored version; on success it is
    /// bumped in place.
    pub fn commit(
        &self,
        intent: &mut Intent,
        steps: &[&IntentStep],
        events: &[IntentEvent],
    ) -> StoreResult<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE intents SET state = ?1, current_step = ?2, result = ?3, error = ?4,
                 started_at = ?5, timeout_at = ?6, completed_at = ?7, version = version + 1
             WHERE id = ?8 AND version = ?9",
            params![
                intent.state.as_str(),
                intent.current_step,
                to_json_opt(&intent.result)?,
                intent.error,
                intent.started_at.map(format_ts),
                intent.timeout_at.map(format_ts),
                intent.completed_at.map(format_ts),
                intent.id.to_string(),
                intent.version,
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::VersionConflict {
                intent_id: intent.id,
                expected_version: intent.version,
            });
        }

        for step in steps {
            tx.execute(
                "UPDATE intent_steps SET status = ?1, policy_decision = ?2, ledger_event_id = ?3,
                     attempt_count = ?4, input = ?5, output = ?6, error_message = ?7,
                     started_at = ?8, completed_at = ?9
                 WHERE id = ?10 AND intent_id = ?11",
                params![
                    step.status.as_str(),
                    step.policy_decision.map(|d| d.as_str()),
                    step.ledger_event_id.map(|id| id.to_string()),
                    step.attempt_count,
                    to_json_opt(&step.input)?,
                    to_json_opt(&step.output)?,
                    step.error_message,
                    step.started_at.map(format_ts),
                    step.completed_at.map(format_ts),
                    step.id.to_string(),
                    intent.id.to_string(),
                ],
            )?;
        }

        for event in events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;
        intent.version += 1;

        debug!(
            intent_id = %intent.id,
            state = %intent.state,
            version = intent.version,
            steps = steps.len(),
            events = events.len(),
            "Committed intent"
        );
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> StoreResult<Option<Intent>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM intents WHERE id = ?1", INTENT_COLUMNS),
            params![id.to_string()],
            IntentRow::from_row,
        )
        .optional()?
        .map(IntentRow::into_intent)
        .transpose()
    }

    /// Steps in ascending sequence
    pub fn steps(&self, intent_id: Uuid) -> StoreResult<Vec<IntentStep>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intent_steps WHERE intent_id = ?1 ORDER BY sequence_num ASC",
            STEP_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![intent_id.to_string()], StepRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    /// History in write order
    pub fn events(&self, intent_id: Uuid) -> StoreResult<Vec<IntentEvent>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intent_events WHERE intent_id = ?1 ORDER BY rowid ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![intent_id.to_string()], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Nested intents created under `parent_id`
    pub fn children(&self, parent_id: Uuid) -> StoreResult<Vec<Intent>> {
        self.select_intents(
            "WHERE parent_intent_id = ?1 ORDER BY created_at ASC",
            parent_id.to_string(),
        )
    }

    /// `in_progress` intents whose deadline is at or before `now`
    pub fn expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<Intent>> {
        self.select_intents(
            "WHERE state = 'in_progress' AND timeout_at IS NOT NULL AND timeout_at <= ?1 \
             ORDER BY timeout_at ASC",
            format_ts(now),
        )
    }

    fn select_intents(&self, clause: &str, arg: String) -> StoreResult<Vec<Intent>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM intents {}", INTENT_COLUMNS, clause))?;
        let rows = stmt
            .query_map(params![arg], IntentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(IntentRow::into_intent).collect()
    }
}

fn insert_event(tx: &Transaction<'_>, event: &IntentEvent) -> StoreResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO intent_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            EVENT_COLUMNS
        ),
        params![
            event.id.to_string(),
            event.intent_id.to_string(),
            event.step_sequence,
            event.event_type.as_str(),
            event.previous_state,
            event.new_state,
            event.actor,
            event.correlation_id.to_string(),
            event.detail,
            format_ts(event.occurred_at),
        ],
    )?;
    Ok(())
}

struct IntentRow {
    id: String,
    template_name: String,
    template_version: u32,
    state: String,
    current_step: u32,
    actor_user_id: Option<String>,
    actor_agent_id: Option<String>,
    actor_role: String,
    delegation_id: Option<String>,
    correlation_id: String,
    parent_intent_id: Option<String>,
    context: String,
    evidence: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    timeout_at: Option<String>,
    completed_at: Option<String>,
    version: i64,
}

impl IntentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            template_name: row.get(1)?,
            template_version: row.get(2)?,
            state: row.get(3)?,
            current_step: row.get(4)?,
            actor_user_id: row.get(5)?,
            actor_agent_id: row.get(6)?,
            actor_role: row.get(7)?,
            delegation_id: row.get(8)?,
            correlation_id: row.get(9)?,
            parent_intent_id: row.get(10)?,
            context: row.get(11)?,
            evidence: row.get(12)?,
            result: row.get(13)?,
            error: row.get(14)?,
            created_at: row.get(15)?,
            started_at: row.get(16)?,
            timeout_at: row.get(17)?,
            completed_at: row.get(18)?,
            version: row.get(19)?,
        })
    }

    fn into_intent(self) -> StoreResult<Intent> {
        const TABLE: &str = "intents";
        let evidence: Evidence = serde_json::from_str(&self.evidence).map_err(|e| StoreError::Corrupt {
            table: TABLE,
            details: format!("evidence: {}", e),
        })?;

        Ok(Intent {
            id: parse_uuid(TABLE, &self.id)?,
            template_name: self.template_name,
            template_version: self.template_version,
            state: parse_enum(TABLE, &self.state)?,
            current_step: self.current_step,
            actor: Actor {
                user_id: self.actor_user_id,
                agent_id: self.actor_agent_id,
                role: Some(self.actor_role),
                delegation_id: self.delegation_id,
            },
            correlation_id: parse_uuid(TABLE, &self.correlation_id)?,
            parent_intent_id: parse_opt_uuid(TABLE, self.parent_intent_id)?,
            context: serde_json::from_str(&self.context)?,
            evidence,
            result: from_json_opt(self.result)?,
            error: self.error,
            created_at: parse_ts(TABLE, &self.created_at)?,
            started_at: parse_opt_ts(TABLE, self.started_at)?,
            timeout_at: parse_opt_ts(TABLE, self.timeout_at)?,
            completed_at: parse_opt_ts(TABLE, self.completed_at)?,
            version: self.version,
        })
    }
}

struct StepRow {
    id: String,
    intent_id: String,
    sequence_num: u32,
    action: String,
    required: bool,
    requires_role: Option<String>,
    status: String,
    policy_decision: Option<String>,
    ledger_event_id: Option<String>,
    attempt_count: u32,
    max_attempts: u32,
    input: Option<String>,
    output: Option<String>,
    error_message: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            intent_id: row.get(1)?,
            sequence_num: row.get(2)?,
            action: row.get(3)?,
            required: row.get(4)?,
            requires_role: row.get(5)?,
            status: row.get(6)?,
            policy_decision: row.get(7)?,
            ledger_event_id: row.get(8)?,
            attempt_count: row.get(9)?,
            max_attempts: row.get(10)?,
            input: row.get(11)?,
            output: row.get(12)?,
            error_message: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_step(self) -> StoreResult<IntentStep> {
        const TABLE: &str = "intent_steps";
        Ok(IntentStep {
            id: parse_uuid(TABLE, &self.id)?,
            intent_id: parse_uuid(TABLE, &self.intent_id)?,
            sequence_num: self.sequence_num,
            action: self.action,
            required: self.required,
            requires_role: self.requires_role,
            status: parse_enum(TABLE, &self.status)?,
            policy_decision: self
                .policy_decision
                .map(|d| parse_enum(TABLE, &d))
                .transpose()?,
            ledger_event_id: parse_opt_uuid(TABLE, self.ledger_event_id)?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            input: from_json_opt(self.input)?,
            output: from_json_opt(self.output)?,
            error_message: self.error_message,
            started_at: parse_opt_ts(TABLE, self.started_at)?,
            completed_at: parse_opt_ts(TABLE, self.completed_at)?,
        })
    }
}

struct EventRow {
    id: String,
    intent_id: String,
    step_sequence: Option<u32>,
    event_type: String,
    previous_state: Option<String>,
    new_state: String,
    actor: String,
    correlation_id: String,
    detail: Option<String>,
    occurred_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            intent_id: row.get(1)?,
            step_sequence: row.get(2)?,
            event_type: row.get(3)?,
            previous_state: row.get(4)?,
            new_state: row.get(5)?,
            actor: row.get(6)?,
            correlation_id: row.get(7)?,
            detail: row.get(8)?,
            occurred_at: row.get(9)?,
        })
    }

    fn into_event(self) -> StoreResult<IntentEvent> {
        const TABLE: &str = "intent_events";
        Ok(IntentEvent {
            id: parse_uuid(TABLE, &self.id)?,
            intent_id: parse_uuid(TABLE, &self.intent_id)?,
            step_sequence: self.step_sequence,
            event_type: parse_enum(TABLE, &self.event_type)?,
            previous_state: self.previous_state,
            new_state: self.new_state,
            actor: self.actor,
            correlation_id: parse_uuid(TABLE, &self.correlation_id)?,
            detail: self.detail,
            occurred_at: parse_ts(TABLE, &self.occurred_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntentEventType, IntentState, IntentTemplate, TemplateStep};
    use serde_json::json;

    fn template() -> IntentTemplate {
        IntentTemplate {
            name: "rotation".to_string(),
            version: 1,
            description: String::new(),
            policy_scope: "infra:vault".to_string(),
            resource_type: "secret".to_string(),
            steps: vec![
                TemplateStep::new(1, "secret:generate"),
                TemplateStep::new(2, "secret:rotate"),
            ],
            rollback_on_failure: Vec::new(),
            compensations: Default::default(),
            timeout_seconds: Some(60),
            retry_policy: Default::default(),
        }
    }

    fn seeded() -> (IntentStore, Intent) {
        let store = IntentStore::new(Database::in_memory().unwrap());
        let template = template();
        let intent = Intent::new(
            &template,
            Actor::agent("rotator", "service"),
            json!({"secret": "db"}),
            Evidence::new().assert("rotation_window_open"),
            None,
            Utc::now(),
        );
        let steps: Vec<IntentStep> = template
            .ordered_steps()
            .into_iter()
            .map(|s| IntentStep::from_template(intent.id, s, 3))
            .collect();
        let created = IntentEvent::transition(&intent, IntentEventType::Created, None, "agent:rotator", Utc::now());
        store.insert(&intent, &steps, &created).unwrap();
        (store, intent)
    }

    #[test]
    fn test_insert_and_read_back() {
        let (store, intent) = seeded();

        let loaded = store.get(intent.id).unwrap().unwrap();
        assert_eq!(loaded.state, IntentState::Pending);
        assert_eq!(loaded.actor, intent.actor);
        assert_eq!(loaded.context, intent.context);
        assert_eq!(loaded.evidence, intent.evidence);
        assert_eq!(loaded.correlation_id, intent.correlation_id);
        assert_eq!(loaded.version, 0);

        let steps = store.steps(intent.id).unwrap();
        assert_eq!(steps.iter().map(|s| s.sequence_num).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.events(intent.id).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_rejects_stale_version() {
        let (store, intent) = seeded();

        let mut first = intent.clone();
        first.state = IntentState::Cancelled;
        store.commit(&mut first, &[], &[]).unwrap();
        assert_eq!(first.version, 1);

        let mut second = intent.clone();
        second.state = IntentState::InProgress;
        let err = store.commit(&mut second, &[], &[]).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected_version: 0, .. }));
        assert_eq!(second.version, 0);

        assert_eq!(store.get(intent.id).unwrap().unwrap().state, IntentState::Cancelled);
    }

    #[test]
    fn test_expired_only_returns_overdue_in_progress() {
        let (store, mut intent) = seeded();
        let now = Utc::now();

        intent.state = IntentState::InProgress;
        intent.started_at = Some(now - chrono::Duration::seconds(120));
        intent.timeout_at = Some(now - chrono::Duration::seconds(60));
        store.commit(&mut intent, &[], &[]).unwrap();

        let expired = store.expired(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, intent.id);

        assert!(store.expired(now - chrono::Duration::seconds(61)).unwrap().is_empty());
    }
}
