//! Ledger vocabulary and the immutable `LedgerEvent` record.
//!
//! A ledger event captures one policy decision: who acted, where, on what,
//! under which policy, and with which evidence.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::Evidence;

/// A single immutable record of a governed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Server-assigned identifier
    pub id: Uuid,

    /// Ties events across one logical request chain
    pub correlation_id: Uuid,

    /// Set when the event belongs to a multi-step intent
    pub intent_id: Option<Uuid>,

    /// Position within the correlation chain
    pub sequence_num: i64,

    pub layer: Layer,
    pub host: String,
    pub service: String,
    pub policy_scope: String,

    /// Who performed the action
    pub actor: Actor,

    /// Verb:noun, e.g. `assignment:create`
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,

    pub decision: Decision,

    /// `None` means the default stance applied
    pub policy_id: Option<String>,
    pub policy_version: Option<String>,

    /// Claims and asserted facts presented for evaluation
    #[serde(flatten)]
    pub evidence: Evidence,

    /// Granularity actually persisted
    pub ledger_level: LedgerLevel,

    /// Granularity the policy evaluator demanded
    pub required_ledger_level: LedgerLevel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_context: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// When the action happened
    pub occurred_at: DateTime<Utc>,

    /// When the row was written (differs under retry/replay)
    pub recorded_at: DateTime<Utc>,
}

/// A ledger event before the store assigns `id` and `recorded_at`.
///
/// This is also the body accepted by `POST /ledger/event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerEvent {
    pub correlation_id: Uuid,
    #[serde(default)]
    pub intent_id: Option<Uuid>,

    /// Assigned by the store when absent
    #[serde(default)]
    pub sequence_num: Option<i64>,

    pub layer: Layer,
    pub host: String,
    pub service: String,
    pub policy_scope: String,
    pub actor: Actor,
    pub action: String,
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub decision: Decision,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(flatten)]
    pub evidence: Evidence,
    pub ledger_level: LedgerLevel,
    #[serde(default)]
    pub required_ledger_level: LedgerLevel,
    #[serde(default)]
    pub request_context: Option<serde_json::Value>,
    #[serde(default)]
    pub response_summary: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl NewLedgerEvent {
    /// Materialize the stored record
    pub fn into_event(self, id: Uuid, sequence_num: i64, recorded_at: DateTime<Utc>) -> LedgerEvent {
        LedgerEvent {
            id,
            correlation_id: self.correlation_id,
            intent_id: self.intent_id,
            sequence_num,
            layer: self.layer,
            host: self.host,
            service: self.service,
            policy_scope: self.policy_scope,
            actor: self.actor,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            decision: self.decision,
            policy_id: self.policy_id,
            policy_version: self.policy_version,
            evidence: self.evidence,
            ledger_level: self.ledger_level,
            required_ledger_level: self.required_ledger_level,
            request_context: self.request_context,
            response_summary: self.response_summary,
            metadata: self.metadata,
            occurred_at: self.occurred_at,
            recorded_at,
        }
    }

    /// Drop the detail the chosen granularity does not persist.
    ///
    /// Returns the names of fields that `full` requires but were omitted.
    pub fn apply_granularity(&mut self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self.ledger_level {
            LedgerLevel::None => {
                self.request_context = None;
                self.response_summary = None;
                self.metadata = None;
            }
            LedgerLevel::Decision => {
                self.request_context = None;
                self.response_summary = None;
            }
            LedgerLevel::Action => {
                self.request_context = None;
            }
            LedgerLevel::Full => {
                if self.request_context.is_none() {
                    missing.push("request_context");
                }
                if self.response_summary.is_none() {
                    missing.push("response_summary");
                }
            }
        }
        missing
    }
}

/// The identity performing a governed action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_id: Option<String>,
}

impl Actor {
    /// A human actor with a role
    pub fn user(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role.into()),
            ..Default::default()
        }
    }

    /// An automated agent with a role
    pub fn agent(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            role: Some(role.into()),
            ..Default::default()
        }
    }

    /// Attach a delegation grant
    pub fn with_delegation(mut self, delegation_id: impl Into<String>) -> Self {
        self.delegation_id = Some(delegation_id.into());
        self
    }

    /// Structural precondition for anything that reaches the ledger.
    pub fn validate(&self) -> Result<(), String> {
        let has_user = self.user_id.as_deref().is_some_and(|s| !s.trim().is_empty());
        let has_agent = self.agent_id.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !has_user && !has_agent {
            return Err("actor requires a user_id or an agent_id".to_string());
        }
        if self.role.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err("actor requires a role".to_string());
        }
        Ok(())
    }

    /// Principal string used in intent history, e.g. `user:alice`
    pub fn principal(&self) -> String {
        match (&self.user_id, &self.agent_id) {
            (Some(user), _) => format!("user:{}", user),
            (None, Some(agent)) => format!("agent:{}", agent),
            (None, None) => "unknown".to_string(),
        }
    }

    /// Whether this actor holds the given role
    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }
}

/// Architectural layer a host belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Experience,
    Gateway,
    Governance,
    Mesh,
    Infra,
}

impl Layer {
    /// Resolve the layer from a host name by prefix/suffix rules
    pub fn from_host(host: &str) -> Self {
        let host = host.trim().to_ascii_lowercase();
        if host.starts_with("gov.") || host.ends_with(".systems") {
            Self::Governance
        } else if host.starts_with("mesh.") || host.starts_with("agents.") {
            Self::Mesh
        } else if host.starts_with("api.") {
            Self::Gateway
        } else if host.starts_with("db.") || host.starts_with("infra.") || host.starts_with("ops.") {
            Self::Infra
        } else {
            Self::Experience
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Experience => "experience",
            Self::Gateway => "gateway",
            Self::Governance => "governance",
            Self::Mesh => "mesh",
            Self::Infra => "infra",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "experience" => Ok(Self::Experience),
            "gateway" => Ok(Self::Gateway),
            "governance" => Ok(Self::Governance),
            "mesh" => Ok(Self::Mesh),
            "infra" => Ok(Self::Infra),
            other => Err(format!("unknown layer '{}'", other)),
        }
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Warn,
    /// Logged as if denied, but the action proceeds
    ShadowDeny,
}

impl Decision {
    /// Whether the governed action may run
    pub fn permits_execution(&self) -> bool {
        !matches!(self, Self::Deny)
    }

    /// Decisions surfaced by compliance review
    pub fn needs_review(&self) -> bool {
        !matches!(self, Self::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Warn => "warn",
            Self::ShadowDeny => "shadow_deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "warn" => Ok(Self::Warn),
            "shadow_deny" => Ok(Self::ShadowDeny),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

/// How much detail of a decision is persisted.
///
/// Variants are declared in rank order so the derived `Ord` is the rank:
/// none < decision < action < full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerLevel {
    None,
    #[default]
    Decision,
    Action,
    Full,
}

impl LedgerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Decision => "decision",
            Self::Action => "action",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for LedgerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "decision" => Ok(Self::Decision),
            "action" => Ok(Self::Action),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown ledger level '{}'", other)),
        }
    }
}
