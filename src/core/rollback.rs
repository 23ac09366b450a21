//! Rollback coordinator.
//!
//! Compensates the steps of a failed or timed-out intent that belong to the
//! template's rollback set, newest first. A step is a candidate when it
//! completed, or when it failed after its executor had already run (its
//! side effects may be partial). Steps already `rolled_back` are skipped,
//! so an operator can re-run rollback after an incomplete attempt.

use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::OperatorAlert;
use crate::domain::{
    rollback_action, Intent, IntentEvent, IntentEventType, IntentState, IntentStep,
    IntentTemplate, StepStatus,
};
use crate::error::{GovernanceError, GovernanceResult};

use super::context::GovernanceContext;
use super::governed::{evaluate_and_record, execute_with_retry, ExecutorCall, GovernedAction};

/// Runs compensating executors for an intent
#[derive(Clone)]
pub struct RollbackCoordinator {
    ctx: GovernanceContext,
}

impl RollbackCoordinator {
    pub fn new(ctx: GovernanceContext) -> Self {
        Self { ctx }
    }

    /// Compensate and move the intent to `rolled_back`.
    ///
    /// With nothing to compensate the intent is returned unchanged (it stays
    /// `failed`/`timed_out`). A compensation that is denied or fails leaves
    /// the intent in place, alerts an operator and returns
    /// `RollbackIncomplete`.
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    pub async fn rollback(&self, intent_id: Uuid) -> GovernanceResult<Intent> {
        let mut intent = self
            .ctx
            .intents
            .get(intent_id)?
            .ok_or(GovernanceError::IntentNotFound(intent_id))?;

        if intent.state == IntentState::RolledBack {
            return Ok(intent);
        }
        if !intent.state.is_rollback_eligible() {
            return Err(GovernanceError::InvalidTransition {
                intent_id,
                from: intent.state,
                to: IntentState::RolledBack,
            });
        }

        let template = self
            .ctx
            .templates
            .get(&intent.template_name, Some(intent.template_version))?;
        let steps = self.ctx.intents.steps(intent_id)?;

        let candidates = rollback_candidates(&template, &steps);
        let already_compensated = steps.iter().any(|s| s.status == StepStatus::RolledBack);

        if candidates.is_empty() && !already_compensated {
            info!(state = %intent.state, "Nothing to compensate, intent keeps its state");
            return Ok(intent);
        }

        let now = self.ctx.clock.now();
        let started = IntentEvent::transition(
            &intent,
            IntentEventType::RollbackStarted,
            Some(intent.state),
            intent.actor.principal(),
            now,
        )
        .with_detail(format!("{} step(s) to compensate", candidates.len()));
        self.ctx.intents.commit(&mut intent, &[], &[started])?;

        info!(steps = candidates.len(), "Rollback started");

        for step in candidates {
            self.compensate(&mut intent, &template, step).await?;
        }

        let now = self.ctx.clock.now();
        let previous = intent.state;
        intent.transition_to(IntentState::RolledBack)?;
        intent.completed_at = Some(now);
        let completed = IntentEvent::transition(
            &intent,
            IntentEventType::RollbackCompleted,
            Some(previous),
            intent.actor.principal(),
            now,
        );
        self.ctx.intents.commit(&mut intent, &[], &[completed])?;

        info!("Rollback completed");
        Ok(intent)
    }

    async fn compensate(
        &self,
        intent: &mut Intent,
        template: &IntentTemplate,
        mut step: IntentStep,
    ) -> GovernanceResult<()> {
        let ledger_action = rollback_action(&step.action);
        let executor = template.compensation_for(&step.action);
        let input = json!({
            "context": intent.context,
            "input": step.input,
            "output": step.output,
        });

        let decided = evaluate_and_record(
            &self.ctx,
            &GovernedAction {
                intent: &*intent,
                template,
                sequence: step.sequence_num,
                action: &ledger_action,
                requires_role: step.requires_role.as_deref(),
                input: &input,
            },
        )
        .await?;

        if !decided.permits_execution() {
            let reason = format!("compensation denied: {}", decided.reason());
            return self.incomplete(intent, template, &step, &ledger_action, reason).await;
        }

        let executed = execute_with_retry(
            &self.ctx,
            ExecutorCall {
                intent: &*intent,
                sequence: step.sequence_num,
                executor: &executor,
                compensates: Some(&step.action),
                input: &input,
                first_attempt: 1,
                max_attempts: step.max_attempts,
                retry_policy: &template.retry_policy,
            },
        )
        .await;

        match executed.result {
            Ok(_) => {
                let now = self.ctx.clock.now();
                let previous = step.status;
                step.status = StepStatus::RolledBack;
                step.completed_at = Some(now);

                let mut events = executed.retries;
                events.push(
                    IntentEvent::step(
                        intent,
                        step.sequence_num,
                        IntentEventType::StepRolledBack,
                        previous,
                        step.status,
                        now,
                    )
                    .with_detail(format!("compensated by '{}'", executor)),
                );
                self.ctx.intents.commit(intent, &[&step], &events)?;

                info!(step = step.sequence_num, action = %step.action, "Step compensated");
                Ok(())
            }
            Err(e) => {
                let reason = format!(
                    "compensation '{}' failed after {} attempt(s): {}",
                    executor, executed.attempts, e
                );
                if !executed.retries.is_empty() {
                    self.ctx.intents.commit(intent, &[], &executed.retries)?;
                }
                self.incomplete(intent, template, &step, &ledger_action, reason).await
            }
        }
    }

    /// Record the failure, alert an operator and stop
    async fn incomplete(
        &self,
        intent: &mut Intent,
        template: &IntentTemplate,
        step: &IntentStep,
        ledger_action: &str,
        reason: String,
    ) -> GovernanceResult<()> {
        let now = self.ctx.clock.now();
        let failed = IntentEvent::transition(
            intent,
            IntentEventType::RollbackFailed,
            Some(intent.state),
            intent.actor.principal(),
            now,
        )
        .with_detail(format!("step {}: {}", step.sequence_num, reason));
        let failed = IntentEvent {
            step_sequence: Some(step.sequence_num),
            ..failed
        };
        self.ctx.intents.commit(intent, &[], &[failed])?;

        error!(step = step.sequence_num, %reason, "Rollback incomplete, operator intervention required");

        let alert = OperatorAlert {
            intent_id: intent.id,
            correlation_id: intent.correlation_id,
            template_name: template.name.clone(),
            step_sequence: step.sequence_num,
            action: ledger_action.to_string(),
            reason: reason.clone(),
            occurred_at: now,
        };
        if let Err(e) = self.ctx.notifier.alert(&alert).await {
            warn!(error = %e, "Failed to deliver operator alert");
        }

        Err(GovernanceError::RollbackIncomplete {
            intent_id: intent.id,
            step_sequence: step.sequence_num,
            reason,
        })
    }
}

/// Steps to compensate, in strictly descending sequence
fn rollback_candidates(template: &IntentTemplate, steps: &[IntentStep]) -> Vec<IntentStep> {
    let mut candidates: Vec<IntentStep> = steps
        .iter()
        .filter(|s| template.requires_rollback(&s.action))
        .filter(|s| match s.status {
            StepStatus::Completed => true,
            StepStatus::Failed => s.was_executed(),
            _ => false,
        })
        .cloned()
        .collect();
    candidates.sort_by(|a, b| b.sequence_num.cmp(&a.sequence_num));
    candidates
}
