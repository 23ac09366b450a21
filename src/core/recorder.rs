//! Builds well-formed ledger events from policy decisions.
//!
//! Every governed action ends here: the recorder validates the actor,
//! enforces the ledger-level invariant, applies granularity and performs
//! exactly one durable write. Write failures propagate; the caller decides
//! whether to retry the whole governed action.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::adapters::{PolicyRequest, PolicyResponse};
use crate::domain::{Decision, Layer, LedgerEvent, LedgerLevel, NewLedgerEvent};
use crate::error::{GovernanceError, GovernanceResult};
use crate::evidence;

use super::clock::Clock;
use super::ledger_store::LedgerStore;

/// Optional detail attached to a recorded decision
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMetadata {
    /// Overrides the `<layer>:<service>` scope
    pub policy_scope: Option<String>,

    /// Persisted at `full` only
    pub request_context: Option<Value>,

    /// Persisted at `action` and `full`
    pub response_summary: Option<Value>,

    /// Free-form metadata, dropped at `none`
    pub extra: Option<Value>,

    /// Defaults to the recorder's clock
    pub occurred_at: Option<DateTime<Utc>>,

    /// Explicit position in the correlation chain (replay)
    pub sequence_num: Option<i64>,
}

/// Writes one ledger event per policy decision
#[derive(Clone)]
pub struct LedgerRecorder {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
}

impl LedgerRecorder {
    pub fn new(store: LedgerStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Record the decision `response` made for `request`
    #[instrument(skip_all, fields(action = %request.action, decision = %response.decision))]
    pub fn record(
        &self,
        request: &PolicyRequest,
        response: &PolicyResponse,
        resource_id: Option<&str>,
        metadata: Option<RecordMetadata>,
        ledger_level_override: Option<LedgerLevel>,
    ) -> GovernanceResult<LedgerEvent> {
        let actor = request.subject.actor();
        actor.validate().map_err(GovernanceError::Validation)?;

        let meta = metadata.unwrap_or_default();
        let host = request.context.request_metadata.host.clone();
        let service = request.context.request_metadata.service.clone();
        let layer = Layer::from_host(&host);
        let policy_scope = meta
            .policy_scope
            .unwrap_or_else(|| format!("{}:{}", layer, service));

        let ledger_level = effective_level(
            ledger_level_override,
            response.required_ledger_level,
            &request.action,
        );

        let event = NewLedgerEvent {
            correlation_id: request.context.request_metadata.correlation_id,
            intent_id: request.context.request_metadata.intent_id,
            sequence_num: meta.sequence_num,
            layer,
            host,
            service,
            policy_scope,
            actor,
            action: request.action.clone(),
            resource_type: request.resource.resource_type.clone(),
            resource_id: resource_id
                .map(str::to_string)
                .or_else(|| request.resource.id.clone()),
            decision: response.decision,
            policy_id: response.policy_id.clone(),
            policy_version: response.policy_version.clone(),
            evidence: request.context.evidence.clone(),
            ledger_level,
            required_ledger_level: response.required_ledger_level,
            request_context: meta.request_context,
            response_summary: meta.response_summary,
            metadata: meta.extra,
            occurred_at: meta.occurred_at.unwrap_or_else(|| self.clock.now()),
        };

        self.write(event)
    }

    /// Record a pre-built event (`POST /ledger/event`)
    ///
    /// The same invariants apply as for [`record`](Self::record): a level
    /// below the required one is raised with a warning.
    pub fn record_event(&self, mut event: NewLedgerEvent) -> GovernanceResult<LedgerEvent> {
        event.actor.validate().map_err(GovernanceError::Validation)?;
        if event.action.trim().is_empty() {
            return Err(GovernanceError::Validation("action cannot be empty".to_string()));
        }
        if event.host.trim().is_empty() || event.service.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "host and service are required".to_string(),
            ));
        }

        event.ledger_level = effective_level(
            Some(event.ledger_level),
            event.required_ledger_level,
            &event.action,
        );
        self.write(event)
    }

    fn write(&self, mut event: NewLedgerEvent) -> GovernanceResult<LedgerEvent> {
        // Stored evidence must decode on every later read
        event.evidence = evidence::normalize(&event.evidence)?;

        let missing = event.apply_granularity();
        if !missing.is_empty() {
            warn!(
                action = %event.action,
                missing = ?missing,
                "Ledger level 'full' recorded without complete detail"
            );
        }

        match event.decision {
            Decision::Warn | Decision::ShadowDeny => warn!(
                action = %event.action,
                decision = %event.decision,
                policy_id = ?event.policy_id,
                actor = %event.actor.principal(),
                "Policy flagged action"
            ),
            _ => {}
        }

        let stored = self.store.append(event)?;
        debug!(
            ledger_event_id = %stored.id,
            correlation_id = %stored.correlation_id,
            sequence_num = stored.sequence_num,
            "Ledger event recorded"
        );
        Ok(stored)
    }
}

/// The level to persist: the override, unless it ranks below `required`
fn effective_level(
    requested: Option<LedgerLevel>,
    required: LedgerLevel,
    action: &str,
) -> LedgerLevel {
    match requested {
        Some(level) if level < required => {
            warn!(
                action,
                requested = %level,
                required = %required,
                "Ledger level override below required level, using required level"
            );
            required
        }
        Some(level) => level,
        None => required,
    }
}
