//! Adapter interfaces for external systems.
//!
//! The orchestrator talks to three collaborators through these traits:
//! a policy evaluator that decides, step executors that act, and an
//! operator notifier for failures that need a human.

pub mod command;
pub mod notify;
pub mod policy_http;
pub mod static_policy;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Actor, Decision, LedgerLevel};
use crate::evidence::Evidence;

pub use command::{CommandExecutor, CommandSpec};
pub use notify::{LogNotifier, WebhookNotifier};
pub use policy_http::HttpPolicyEvaluator;
pub use static_policy::{PolicyRule, StaticPolicyEvaluator};

// ---------------------------------------------------------------------------
// Policy evaluation (`POST /policy/evaluate`)
// ---------------------------------------------------------------------------

/// Who is asking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySubject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

impl PolicySubject {
    pub fn from_actor(actor: &Actor) -> Self {
        Self {
            user_id: actor.user_id.clone(),
            agent_id: actor.agent_id.clone(),
            role: actor.role.clone().unwrap_or_default(),
            delegation_id: actor.delegation_id.clone(),
            attributes: None,
        }
    }

    /// The actor recorded in the ledger for this subject
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id.clone(),
            agent_id: self.agent_id.clone(),
            role: Some(self.role.clone()).filter(|r| !r.is_empty()),
            delegation_id: self.delegation_id.clone(),
        }
    }
}

/// What is being acted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResource {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

/// Where the request came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub host: String,
    pub service: String,
    pub correlation_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
}

/// Evidence plus request metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    #[serde(flatten)]
    pub evidence: Evidence,

    pub request_metadata: RequestMetadata,
}

/// Request body sent to the policy evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub subject: PolicySubject,
    pub action: String,
    pub resource: PolicyResource,
    pub context: PolicyContext,
}

/// Decision returned by the policy evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub decision: Decision,

    #[serde(default)]
    pub policy_id: Option<String>,

    #[serde(default)]
    pub policy_version: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,

    /// Minimum granularity the ledger must persist
    #[serde(default)]
    pub required_ledger_level: LedgerLevel,
}

impl PolicyResponse {
    /// A decision made locally without consulting a policy (default stance)
    pub fn local(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            policy_id: None,
            policy_version: None,
            reason: Some(reason.into()),
            required_ledger_level: LedgerLevel::Decision,
        }
    }
}

/// Policy evaluator transport and decoding failures
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy request failed: {0}")]
    Transport(String),

    #[error("policy evaluator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode policy response: {0}")]
    Decode(String),

    #[error("invalid policy rules: {0}")]
    Rules(String),
}

/// Decides whether a governed action may run
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Human-readable evaluator name
    fn name(&self) -> &str;

    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyResponse, PolicyError>;
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Everything an executor learns about the step it runs.
///
/// Executors may be invoked more than once for the same step (retries, or a
/// re-run after a crash between execution and commit). They must be
/// idempotent with respect to `idempotency_key`, which is stable for a given
/// intent, step and input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub intent_id: Uuid,
    pub correlation_id: Uuid,
    pub sequence: u32,

    /// Executor action name (`<action>:rollback` style for compensations)
    pub action: String,

    /// 1-indexed attempt number
    pub attempt: u32,

    pub idempotency_key: String,
    pub actor: Actor,
    pub input: serde_json::Value,

    /// Set when this invocation compensates a forward step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates: Option<String>,
}

/// Executor failure modes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Retried up to the step's attempt budget
    #[error("transient executor failure: {0}")]
    Transient(String),

    /// Fails the step without further attempts
    #[error("permanent executor failure: {0}")]
    Permanent(String),

    #[error("no executor registered for action '{0}'")]
    NotRegistered(String),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Performs the effectful work behind one action
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation) -> Result<serde_json::Value, ExecutorError>;
}

/// Executors by action name
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for `action`, replacing any previous one
    pub fn register(&mut self, action: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(action.into(), executor);
    }

    pub fn with(mut self, action: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(action, executor);
        self
    }

    pub fn get(&self, action: &str) -> Result<Arc<dyn StepExecutor>, ExecutorError> {
        self.executors
            .get(action)
            .cloned()
            .ok_or_else(|| ExecutorError::NotRegistered(action.to_string()))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.executors.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}

// ---------------------------------------------------------------------------
// Operator notification
// ---------------------------------------------------------------------------

/// A condition that needs manual intervention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub intent_id: Uuid,
    pub correlation_id: Uuid,
    pub template_name: String,
    pub step_sequence: u32,
    pub action: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Out-of-band channel to an operator
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn alert(&self, alert: &OperatorAlert) -> Result<()>;
}
