//! Append-only ledger persistence.
//!
//! Rows are written once and never updated or deleted (the schema enforces
//! this with triggers). Re-appending an event with an existing
//! `(correlation_id, sequence_num)` returns the stored row, so replays do not
//! double-count.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Actor, Decision, LedgerEvent, NewLedgerEvent};
use crate::evidence::{self, WireEvidence};

use super::db::{
    format_ts, from_json_opt, parse_enum, parse_opt_uuid, parse_ts, parse_uuid, to_json_opt,
    Database, StoreError, StoreResult,
};

const TABLE: &str = "ledger_events";

const COLUMNS: &str = "id, correlation_id, intent_id, sequence_num, layer, host, service, \
    policy_scope, actor_user_id, actor_agent_id, actor_role, delegation_id, action, \
    resource_type, resource_id, decision, policy_id, policy_version, asserted_facts, \
    fact_evidence, claims, ledger_level, required_ledger_level, request_context, \
    response_summary, metadata, occurred_at, recorded_at";

/// Default page size for queries
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Upper bound on a single page
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Filters for reading the ledger (`GET /ledger/events`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub intent_id: Option<Uuid>,
    #[serde(default)]
    pub actor_user_id: Option<String>,
    #[serde(default)]
    pub actor_agent_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl LedgerQuery {
    pub fn for_correlation(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Default::default()
        }
    }

    pub fn for_intent(intent_id: Uuid) -> Self {
        Self {
            intent_id: Some(intent_id),
            ..Default::default()
        }
    }

    /// Effective page size, clamped to `1..=MAX_QUERY_LIMIT`
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

/// One page of query results plus the unpaged total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPage {
    pub events: Vec<LedgerEvent>,
    pub total: u64,
}

/// Audit statistics per decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCounts {
    pub allow: u64,
    pub deny: u64,
    pub warn: u64,
    pub shadow_deny: u64,
}

impl DecisionCounts {
    pub fn total(&self) -> u64 {
        self.allow + self.deny + self.warn + self.shadow_deny
    }

    fn add(&mut self, decision: Decision, count: u64) {
        match decision {
            Decision::Allow => self.allow += count,
            Decision::Deny => self.deny += count,
            Decision::Warn => self.warn += count,
            Decision::ShadowDeny => self.shadow_deny += count,
        }
    }
}

/// SQLite-backed ledger
#[derive(Clone)]
pub struct LedgerStore {
    db: Database,
}

impl LedgerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event, assigning `id`, `recorded_at` and (if absent)
    /// the next `sequence_num` in its correlation chain.
    pub fn append(&self, event: NewLedgerEvent) -> StoreResult<LedgerEvent> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sequence_num = match event.sequence_num {
            Some(seq) => {
                if let Some(existing) = find_by_sequence(&tx, event.correlation_id, seq)? {
                    debug!(
                        correlation_id = %event.correlation_id,
                        sequence_num = seq,
                        "Ledger event already recorded, returning stored row"
                    );
                    return Ok(existing);
                }
                seq
            }
            None => next_sequence(&tx, event.correlation_id)?,
        };

        let stored = event.into_event(Uuid::new_v4(), sequence_num, Utc::now());
        insert(&tx, &stored)?;
        tx.commit()?;

        Ok(stored)
    }

    /// Fetch a single event
    pub fn get(&self, id: Uuid) -> StoreResult<Option<LedgerEvent>> {
        let conn = self.db.lock()?;
        let sql = format!("SELECT {} FROM ledger_events WHERE id = ?1", COLUMNS);
        conn.query_row(&sql, params![id.to_string()], LedgerRow::from_row)
            .optional()?
            .map(LedgerRow::into_event)
            .transpose()
    }

    /// Filtered, paged read ordered by occurrence
    pub fn query(&self, query: &LedgerQuery) -> StoreResult<LedgerPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(id) = query.correlation_id {
            clauses.push("correlation_id = ?");
            values.push(Value::Text(id.to_string()));
        }
        if let Some(id) = query.intent_id {
            clauses.push("intent_id = ?");
            values.push(Value::Text(id.to_string()));
        }
        if let Some(ref user) = query.actor_user_id {
            clauses.push("actor_user_id = ?");
            values.push(Value::Text(user.clone()));
        }
        if let Some(ref agent) = query.actor_agent_id {
            clauses.push("actor_agent_id = ?");
            values.push(Value::Text(agent.clone()));
        }
        if let Some(ref action) = query.action {
            clauses.push("action = ?");
            values.push(Value::Text(action.clone()));
        }
        if let Some(decision) = query.decision {
            clauses.push("decision = ?");
            values.push(Value::Text(decision.as_str().to_string()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let conn = self.db.lock()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM ledger_events{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(i64::from(query.effective_limit())));
        values.push(Value::Integer(i64::from(query.offset.unwrap_or(0))));

        let sql = format!(
            "SELECT {} FROM ledger_events{} ORDER BY occurred_at ASC, sequence_num ASC LIMIT ? OFFSET ?",
            COLUMNS, where_sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), LedgerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let events = rows
            .into_iter()
            .map(LedgerRow::into_event)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(LedgerPage {
            events,
            total: total.max(0) as u64,
        })
    }

    /// Every event in a correlation chain, by sequence
    pub fn by_correlation(&self, correlation_id: Uuid) -> StoreResult<Vec<LedgerEvent>> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {} FROM ledger_events WHERE correlation_id = ?1 ORDER BY sequence_num ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![correlation_id.to_string()], LedgerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(LedgerRow::into_event).collect()
    }

    /// Non-allow decisions, newest first, for compliance review
    pub fn compliance_review(
        &self,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> StoreResult<Vec<LedgerEvent>> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {} FROM ledger_events
             WHERE decision IN ('deny', 'warn', 'shadow_deny') AND occurred_at >= ?1
             ORDER BY occurred_at DESC LIMIT ?2",
            COLUMNS
        );
        let since = since.map(format_ts).unwrap_or_default();
        let limit = i64::from(limit.clamp(1, MAX_QUERY_LIMIT));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since, limit], LedgerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(LedgerRow::into_event).collect()
    }

    /// Count decisions, optionally within one correlation chain
    pub fn decision_counts(&self, correlation_id: Option<Uuid>) -> StoreResult<DecisionCounts> {
        let conn = self.db.lock()?;
        let mut counts = DecisionCounts::default();

        let mut stmt = conn.prepare(
            "SELECT decision, COUNT(*) FROM ledger_events
             WHERE ?1 IS NULL OR correlation_id = ?1
             GROUP BY decision",
        )?;
        let rows = stmt
            .query_map(params![correlation_id.map(|id| id.to_string())], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (decision, count) in rows {
            let decision: Decision = parse_enum(TABLE, &decision)?;
            counts.add(decision, count.max(0) as u64);
        }
        Ok(counts)
    }
}

fn find_by_sequence(
    tx: &Transaction<'_>,
    correlation_id: Uuid,
    sequence_num: i64,
) -> StoreResult<Option<LedgerEvent>> {
    let sql = format!(
        "SELECT {} FROM ledger_events WHERE correlation_id = ?1 AND sequence_num = ?2",
        COLUMNS
    );
    tx.query_row(
        &sql,
        params![correlation_id.to_string(), sequence_num],
        LedgerRow::from_row,
    )
    .optional()?
    .map(LedgerRow::into_event)
    .transpose()
}

fn next_sequence(tx: &Transaction<'_>, correlation_id: Uuid) -> StoreResult<i64> {
    let max: Option<i64> = tx.query_row(
        "SELECT MAX(sequence_num) FROM ledger_events WHERE correlation_id = ?1",
        params![correlation_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

fn insert(tx: &Transaction<'_>, event: &LedgerEvent) -> StoreResult<()> {
    let wire = evidence::encode(&event.evidence);
    let role = event.actor.role.clone().unwrap_or_default();

    tx.execute(
        &format!(
            "INSERT INTO ledger_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
             ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            COLUMNS
        ),
        params![
            event.id.to_string(),
            event.correlation_id.to_string(),
            event.intent_id.map(|id| id.to_string()),
            event.sequence_num,
            event.layer.as_str(),
            event.host,
            event.service,
            event.policy_scope,
            event.actor.user_id,
            event.actor.agent_id,
            role,
            event.actor.delegation_id,
            event.action,
            event.resource_type,
            event.resource_id,
            event.decision.as_str(),
            event.policy_id,
            event.policy_version,
            serde_json::to_string(&wire.asserted_facts)?,
            serde_json::to_string(&wire.fact_evidence)?,
            serde_json::to_string(&wire.claims)?,
            event.ledger_level.as_str(),
            event.required_ledger_level.as_str(),
            to_json_opt(&event.request_context)?,
            to_json_opt(&event.response_summary)?,
            to_json_opt(&event.metadata)?,
            format_ts(event.occurred_at),
            format_ts(event.recorded_at),
        ],
    )?;
    Ok(())
}

/// Raw column values, decoded outside the rusqlite row callback
struct LedgerRow {
    id: String,
    correlation_id: String,
    intent_id: Option<String>,
    sequence_num: i64,
    layer: String,
    host: String,
    service: String,
    policy_scope: String,
    actor_user_id: Option<String>,
    actor_agent_id: Option<String>,
    actor_role: String,
    delegation_id: Option<String>,
    action: String,
    resource_type: String,
    resource_id: Option<String>,
    decision: String,
    policy_id: Option<String>,
    policy_version: Option<String>,
    asserted_facts: String,
    fact_evidence: String,
    claims: String,
    ledger_level: String,
    required_ledger_level: String,
    request_context: Option<String>,
    response_summary: Option<String>,
    metadata: Option<String>,
    occurred_at: String,
    recorded_at: String,
}

impl LedgerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            correlation_id: row.get(1)?,
            intent_id: row.get(2)?,
            sequence_num: row.get(3)?,
            layer: row.get(4)?,
            host: row.get(5)?,
            service: row.get(6)?,
            policy_scope: row.get(7)?,
            actor_user_id: row.get(8)?,
            actor_agent_id: row.get(9)?,
            actor_role: row.get(10)?,
            delegation_id: row.get(11)?,
            action: row.get(12)?,
            resource_type: row.get(13)?,
            resource_id: row.get(14)?,
            decision: row.get(15)?,
            policy_id: row.get(16)?,
            policy_version: row.get(17)?,
            asserted_facts: row.get(18)?,
            fact_evidence: row.get(19)?,
            claims: row.get(20)?,
            ledger_level: row.get(21)?,
            required_ledger_level: row.get(22)?,
            request_context: row.get(23)?,
            response_summary: row.get(24)?,
            metadata: row.get(25)?,
            occurred_at: row.get(26)?,
            recorded_at: row.get(27)?,
        })
    }

    fn into_event(self) -> StoreResult<LedgerEvent> {
        let wire = WireEvidence {
            asserted_facts: serde_json::from_str(&self.asserted_facts)?,
            fact_evidence: serde_json::from_str(&self.fact_evidence)?,
            claims: serde_json::from_str(&self.claims)?,
        };
        let evidence = evidence::decode(wire).map_err(|e| StoreError::Corrupt {
            table: TABLE,
            details: e.to_string(),
        })?;

        Ok(LedgerEvent {
            id: parse_uuid(TABLE, &self.id)?,
            correlation_id: parse_uuid(TABLE, &self.correlation_id)?,
            intent_id: parse_opt_uuid(TABLE, self.intent_id)?,
            sequence_num: self.sequence_num,
            layer: parse_enum(TABLE, &self.layer)?,
            host: self.host,
            service: self.service,
            policy_scope: self.policy_scope,
            actor: Actor {
                user_id: self.actor_user_id,
                agent_id: self.actor_agent_id,
                role: Some(self.actor_role),
                delegation_id: self.delegation_id,
            },
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            decision: parse_enum(TABLE, &self.decision)?,
            policy_id: self.policy_id,
            policy_version: self.policy_version,
            evidence,
            ledger_level: parse_enum(TABLE, &self.ledger_level)?,
            required_ledger_level: parse_enum(TABLE, &self.required_ledger_level)?,
            request_context: from_json_opt(self.request_context)?,
            response_summary: from_json_opt(self.response_summary)?,
            metadata: from_json_opt(self.metadata)?,
            occurred_at: parse_ts(TABLE, &self.occurred_at)?,
            recorded_at: parse_ts(TABLE, &self.recorded_at)?,
        })
    }
}
