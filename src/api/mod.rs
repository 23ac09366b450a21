//! Ledger API contracts.
//!
//! Typed bodies and handlers for `POST /ledger/event` and
//! `GET /ledger/events`. Transport is left to the embedding service: a
//! handler takes the decoded request and returns either the response body
//! or an [`ApiError`] carrying the HTTP status to send.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::{LedgerQuery, LedgerRecorder, LedgerStore};
use crate::domain::{Decision, LedgerEvent, NewLedgerEvent};
use crate::error::GovernanceError;

/// Body of `POST /ledger/event`: a ledger event minus `id`/`recorded_at`
pub type LedgerEventBody = NewLedgerEvent;

/// Query string of `GET /ledger/events`, as received.
///
/// Values stay textual until [`into_query`](Self::into_query) so that a
/// malformed parameter is reported as a 400 rather than swallowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEventsQuery {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub intent_id: Option<String>,
    #[serde(default)]
    pub actor_user_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl LedgerEventsQuery {
    /// Parse into a store query
    pub fn into_query(self) -> Result<LedgerQuery, ApiError> {
        Ok(LedgerQuery {
            correlation_id: parse_id("correlation_id", self.correlation_id)?,
            intent_id: parse_id("intent_id", self.intent_id)?,
            actor_user_id: non_empty(self.actor_user_id),
            actor_agent_id: None,
            action: non_empty(self.action),
            decision: match non_empty(self.decision) {
                Some(raw) => Some(
                    raw.parse::<Decision>()
                        .map_err(|e| ApiError::BadRequest(format!("decision: {}", e)))?,
                ),
                None => None,
            },
            limit: self.limit,
            offset: self.offset,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_id(field: &str, value: Option<String>) -> Result<Option<Uuid>, ApiError> {
    match non_empty(value) {
        Some(raw) => Uuid::parse_str(raw.trim())
            .map(Some)
            .map_err(|e| ApiError::BadRequest(format!("{}: {}", field, e))),
        None => Ok(None),
    }
}

/// Body of a `GET /ledger/events` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEventsResponse {
    pub events: Vec<LedgerEvent>,

    /// Matching events ignoring `limit`/`offset`
    pub total: u64,
}

/// JSON error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
}

/// Errors a handler maps to an HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status_code(),
            error: self.to_string(),
        }
    }
}

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::Validation(_) | GovernanceError::InvalidTemplate(_) => {
                Self::BadRequest(err.to_string())
            }
            GovernanceError::IntentNotFound(_) | GovernanceError::TemplateNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            GovernanceError::Conflict { .. }
            | GovernanceError::StaleState { .. }
            | GovernanceError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<crate::core::StoreError> for ApiError {
    fn from(err: crate::core::StoreError) -> Self {
        Self::from(GovernanceError::from(err))
    }
}

/// Handlers for the ledger endpoints
#[derive(Clone)]
pub struct LedgerApi {
    recorder: LedgerRecorder,
}

impl LedgerApi {
    pub fn new(recorder: LedgerRecorder) -> Self {
        Self { recorder }
    }

    fn store(&self) -> &LedgerStore {
        self.recorder.store()
    }

    /// `POST /ledger/event`
    #[instrument(skip(self, body), fields(action = %body.action))]
    pub fn post_event(&self, body: LedgerEventBody) -> Result<LedgerEvent, ApiError> {
        let stored = self.recorder.record_event(body)?;
        debug!(ledger_event_id = %stored.id, "Ledger event accepted");
        Ok(stored)
    }

    /// `POST /ledger/event` with the raw JSON body
    pub fn post_event_json(&self, body: &str) -> Result<LedgerEvent, ApiError> {
        let body: LedgerEventBody = serde_json::from_str(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid ledger event: {}", e)))?;
        self.post_event(body)
    }

    /// `GET /ledger/events`
    pub fn get_events(&self, query: LedgerEventsQuery) -> Result<LedgerEventsResponse, ApiError> {
        let query = query.into_query()?;
        let page = self.store().query(&query)?;
        Ok(LedgerEventsResponse {
            events: page.events,
            total: page.total,
        })
    }

    /// `GET /ledger/events/{id}`
    pub fn get_event(&self, id: Uuid) -> Result<LedgerEvent, ApiError> {
        self.store()
            .get(id)?
            .ok_or_else(|| ApiError::NotFound(format!("ledger event {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Database, SystemClock};
    use serde_json::json;
    use std::sync::Arc;

    fn api() -> LedgerApi {
        let db = Database::in_memory().unwrap();
        LedgerApi::new(LedgerRecorder::new(LedgerStore::new(db), Arc::new(SystemClock)))
    }

    fn body(correlation_id: Uuid, decision: &str) -> serde_json::Value {
        json!({
            "correlation_id": correlation_id,
            "layer": "experience",
            "host": "lms.example.edu",
            "service": "gradebook",
            "policy_scope": "experience:gradebook",
            "actor": {"user_id": "u-17", "role": "instructor"},
            "action": "assignment:create",
            "resource_type": "assignment",
            "decision": decision,
            "asserted_facts": ["enrolled"],
            "ledger_level": "decision",
            "occurred_at": "2026-03-01T12:00:00Z"
        })
    }

    #[test]
    fn test_post_then_query() {
        let api = api();
        let correlation_id = Uuid::new_v4();

        let first = api
            .post_event_json(&body(correlation_id, "allow").to_string())
            .unwrap();
        let second = api
            .post_event_json(&body(correlation_id, "deny").to_string())
            .unwrap();
        assert_eq!(first.sequence_num, 1);
        assert_eq!(second.sequence_num, 2);
        assert_eq!(api.get_event(first.id).unwrap().id, first.id);

        let response = api
            .get_events(LedgerEventsQuery {
                correlation_id: Some(correlation_id.to_string()),
                decision: Some("deny".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.events[0].id, second.id);
    }

    #[test]
    fn test_error_statuses() {
        let api = api();

        let err = api.post_event_json("{\"action\": 1}").unwrap_err();
        assert_eq!(err.status_code(), 400);

        let mut bad_actor = body(Uuid::new_v4(), "allow");
        bad_actor["actor"] = json!({"role": "instructor"});
        let err = api.post_event_json(&bad_actor.to_string()).unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = api
            .get_events(LedgerEventsQuery {
                intent_id: Some("not-a-uuid".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.body().status, 400);

        assert_eq!(api.get_event(Uuid::new_v4()).unwrap_err().status_code(), 404);
    }
}
