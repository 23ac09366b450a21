//! Shared mechanics of one governed action: evaluate, record, execute.
//!
//! Forward steps and compensations go through the same path so that both
//! are policy-evaluated and ledger-recorded identically.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::adapters::{
    ExecutorError, PolicyContext, PolicyRequest, PolicyResource, PolicyResponse, PolicySubject,
    RequestMetadata, StepInvocation,
};
use crate::domain::{
    Decision, Intent, IntentEvent, IntentEventType, IntentTemplate, LedgerEvent, RetryPolicy,
    StepStatus,
};
use crate::error::{GovernanceError, GovernanceResult};

use super::context::GovernanceContext;
use super::idempotency::generate_idempotency_key;
use super::recorder::RecordMetadata;

/// One action about to be evaluated on behalf of an intent
pub(crate) struct GovernedAction<'a> {
    pub intent: &'a Intent,
    pub template: &'a IntentTemplate,
    pub sequence: u32,

    /// Action presented to the policy evaluator and recorded in the ledger
    pub action: &'a str,
    pub requires_role: Option<&'a str>,
    pub input: &'a Value,
}

/// Policy decision plus the ledger event that records it
pub(crate) struct Decided {
    pub response: PolicyResponse,
    pub ledger_event: LedgerEvent,
}

impl Decided {
    pub fn permits_execution(&self) -> bool {
        self.response.decision.permits_execution()
    }

    pub fn reason(&self) -> String {
        self.response
            .reason
            .clone()
            .unwrap_or_else(|| format!("policy decision: {}", self.response.decision))
    }
}

/// Evaluate `governed` and record the decision.
///
/// A `requires_role` mismatch is decided locally as `deny` without asking
/// the evaluator; it is still recorded.
pub(crate) async fn evaluate_and_record(
    ctx: &GovernanceContext,
    governed: &GovernedAction<'_>,
) -> GovernanceResult<Decided> {
    let intent = governed.intent;
    let request = build_request(ctx, governed);

    let response = match governed.requires_role {
        Some(role) if !intent.actor.has_role(role) => {
            debug!(
                intent_id = %intent.id,
                step = governed.sequence,
                required_role = role,
                "Actor lacks required role"
            );
            PolicyResponse::local(
                Decision::Deny,
                format!(
                    "actor {} lacks required role '{}'",
                    intent.actor.principal(),
                    role
                ),
            )
        }
        _ => ctx
            .policy
            .evaluate(&request)
            .await
            .map_err(|e| GovernanceError::PolicyUnavailable(e.to_string()))?,
    };

    let metadata = RecordMetadata {
        policy_scope: Some(governed.template.policy_scope.clone()),
        request_context: Some(json!({ "input": governed.input })),
        response_summary: Some(json!({
            "decision": response.decision,
            "reason": response.reason,
        })),
        extra: Some(json!({
            "template": governed.template.name,
            "template_version": governed.template.version,
            "step": governed.sequence,
            "evaluator": ctx.policy.name(),
        })),
        occurred_at: Some(ctx.clock.now()),
        sequence_num: None,
    };

    let ledger_event = ctx
        .recorder
        .record(&request, &response, None, Some(metadata), None)?;

    Ok(Decided {
        response,
        ledger_event,
    })
}

fn build_request(ctx: &GovernanceContext, governed: &GovernedAction<'_>) -> PolicyRequest {
    let intent = governed.intent;
    let resource_id = intent
        .context
        .get("resource_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| intent.id.to_string());

    PolicyRequest {
        subject: PolicySubject::from_actor(&intent.actor),
        action: governed.action.to_string(),
        resource: PolicyResource {
            resource_type: governed.template.resource_type.clone(),
            id: Some(resource_id),
            attributes: Some(json!({
                "template": governed.template.name,
                "step": governed.sequence,
            })),
        },
        context: PolicyContext {
            evidence: intent.evidence.clone(),
            request_metadata: RequestMetadata {
                host: ctx.settings.host.clone(),
                service: ctx.settings.service.clone(),
                correlation_id: intent.correlation_id,
                intent_id: Some(intent.id),
            },
        },
    }
}

/// Result of running an executor until success or budget exhaustion
pub(crate) struct Executed {
    pub result: Result<Value, ExecutorError>,

    /// Attempts consumed, including the first
    pub attempts: u32,

    /// One `step_retrying` event per retried failure
    pub retries: Vec<IntentEvent>,
}

/// A call to an executor on behalf of a step
pub(crate) struct ExecutorCall<'a> {
    pub intent: &'a Intent,
    pub sequence: u32,

    /// Executor registry key
    pub executor: &'a str,
    pub compensates: Option<&'a str>,
    pub input: &'a Value,

    /// Attempt number of the first call (1-indexed)
    pub first_attempt: u32,
    pub max_attempts: u32,
    pub retry_policy: &'a RetryPolicy,
}

/// Invoke the executor, retrying transient failures up to `max_attempts`
pub(crate) async fn execute_with_retry(ctx: &GovernanceContext, call: ExecutorCall<'_>) -> Executed {
    let intent = call.intent;
    let mut retries = Vec::new();

    let executor = match ctx.executors.get(call.executor) {
        Ok(executor) => executor,
        Err(e) => {
            return Executed {
                result: Err(e),
                attempts: call.first_attempt,
                retries,
            }
        }
    };

    let idempotency_key = generate_idempotency_key(intent.id, call.sequence, call.executor, call.input);
    let mut attempt = call.first_attempt.max(1);

    loop {
        let invocation = StepInvocation {
            intent_id: intent.id,
            correlation_id: intent.correlation_id,
            sequence: call.sequence,
            action: call.executor.to_string(),
            attempt,
            idempotency_key: idempotency_key.clone(),
            actor: intent.actor.clone(),
            input: call.input.clone(),
            compensates: call.compensates.map(str::to_string),
        };

        match executor.execute(&invocation).await {
            Ok(output) => {
                return Executed {
                    result: Ok(output),
                    attempts: attempt,
                    retries,
                }
            }
            Err(e) if e.is_retryable() && attempt < call.max_attempts => {
                let delay = call.retry_policy.delay_for_attempt(attempt);
                warn!(
                    intent_id = %intent.id,
                    step = call.sequence,
                    executor = call.executor,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Step failed, retrying"
                );

                retries.push(
                    IntentEvent::step(
                        intent,
                        call.sequence,
                        IntentEventType::StepRetrying,
                        StepStatus::InProgress,
                        StepStatus::InProgress,
                        ctx.clock.now(),
                    )
                    .with_detail(format!("attempt {} failed: {}", attempt, e)),
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Executed {
                    result: Err(e),
                    attempts: attempt,
                    retries,
                }
            }
        }
    }
}
