//! Intent orchestrator.
//!
//! Drives an intent through its template's steps: each step is
//! policy-evaluated, recorded in the ledger, executed with bounded retry and
//! committed under the intent's optimistic-concurrency version. Failure of a
//! required step fails the intent and, if the template declares a rollback
//! set, hands it to the [`RollbackCoordinator`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::ExecutorError;
use crate::domain::{
    compute_timeout_at, deadline_after, replay_state, Actor, Decision, Intent, IntentEvent, IntentEventType,
    IntentState, IntentStep, IntentTemplate, StepStatus,
};
use crate::error::{GovernanceError, GovernanceResult};
use crate::evidence::{self, Evidence};

use super::context::GovernanceContext;
use super::db::StoreError;
use super::governed::{evaluate_and_record, execute_with_retry, Executed, ExecutorCall, GovernedAction};
use super::rollback::RollbackCoordinator;

/// Parameters for `create`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIntent {
    pub template_name: String,

    /// Latest registered version when `None`
    pub template_version: Option<u32>,

    pub actor: Actor,
    pub context: Value,
    pub evidence: Evidence,
    pub parent_intent_id: Option<Uuid>,
}

impl CreateIntent {
    pub fn new(template_name: impl Into<String>, actor: Actor) -> Self {
        Self {
            template_name: template_name.into(),
            template_version: None,
            actor,
            context: json!({}),
            evidence: Evidence::default(),
            parent_intent_id: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.template_version = Some(version);
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn parent(mut self, parent_intent_id: Uuid) -> Self {
        self.parent_intent_id = Some(parent_intent_id);
        self
    }
}

/// What happened to one step
enum StepOutcome {
    /// The step settled; run the next one
    Continue,

    /// The intent reached a state where `advance` stops
    Finished(Intent),
}

/// A step whose executor ran but whose result could not be committed
struct AbandonedStep {
    step: IntentStep,
    result: Result<Value, ExecutorError>,
    retries: Vec<IntentEvent>,
}

/// Main intent orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    ctx: GovernanceContext,
}

impl Orchestrator {
    pub fn new(ctx: GovernanceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &GovernanceContext {
        &self.ctx
    }

    /// Create a pending intent pinned to a template version
    #[instrument(skip(self, request), fields(template = %request.template_name))]
    pub async fn create(&self, request: CreateIntent) -> GovernanceResult<Intent> {
        request.actor.validate().map_err(GovernanceError::Validation)?;
        if !request.context.is_object() && !request.context.is_null() {
            return Err(GovernanceError::Validation(
                "intent context must be a JSON object".to_string(),
            ));
        }
        let evidence = evidence::normalize(&request.evidence)?;

        let template = self
            .ctx
            .templates
            .get(&request.template_name, request.template_version)?;

        if let Some(parent_id) = request.parent_intent_id {
            if self.ctx.intents.get(parent_id)?.is_none() {
                return Err(GovernanceError::IntentNotFound(parent_id));
            }
        }

        let now = self.ctx.clock.now();
        let intent = Intent::new(
            &template,
            request.actor,
            request.context,
            evidence,
            request.parent_intent_id,
            now,
        );

        let steps: Vec<IntentStep> = template
            .ordered_steps()
            .into_iter()
            .map(|s| IntentStep::from_template(intent.id, s, s.attempts(&template.retry_policy)))
            .collect();

        let created = IntentEvent::transition(
            &intent,
            IntentEventType::Created,
            None,
            intent.actor.principal(),
            now,
        );
        self.ctx.intents.insert(&intent, &steps, &created)?;

        info!(
            intent_id = %intent.id,
            version = template.version,
            steps = steps.len(),
            actor = %intent.actor.principal(),
            "Intent created"
        );
        Ok(intent)
    }

    /// Move a pending intent to `in_progress` and fix its deadline
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    pub async fn start(&self, intent_id: Uuid) -> GovernanceResult<Intent> {
        let mut intent = self.get(intent_id)?;
        intent.transition_to(IntentState::InProgress)?;

        let template = self.template_for(&intent)?;
        let now = self.ctx.clock.now();

        intent.started_at = Some(now);
        intent.timeout_at = Some(self.deadline(&template, now));

        let started = IntentEvent::transition(
            &intent,
            IntentEventType::Started,
            Some(IntentState::Pending),
            intent.actor.principal(),
            now,
        );
        self.ctx.intents.commit(&mut intent, &[], &[started])?;

        info!(timeout_at = ?intent.timeout_at, "Intent started");
        Ok(intent)
    }

    /// Run pending steps in sequence until the intent completes, fails or
    /// leaves `in_progress`.
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    pub async fn advance(&self, intent_id: Uuid) -> GovernanceResult<Intent> {
        loop {
            let intent = self.get(intent_id)?;
            if intent.state != IntentState::InProgress {
                return Err(GovernanceError::IntentNotActive {
                    intent_id,
                    state: intent.state,
                });
            }
            self.ensure_within_deadline(&intent)?;

            let template = self.template_for(&intent)?;
            let steps = self.ctx.intents.steps(intent_id)?;

            let next = steps
                .iter()
                .position(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress));

            let outcome = match next {
                Some(idx) => self.run_step(intent, &template, &steps, idx).await?,
                None => StepOutcome::Finished(self.complete(intent, &steps)?),
            };

            match outcome {
                StepOutcome::Continue => continue,
                StepOutcome::Finished(intent) => return self.finish(intent, &template).await,
            }
        }
    }

    /// `create` + `start` + `advance`
    pub async fn execute(&self, request: CreateIntent) -> GovernanceResult<Intent> {
        let intent = self.create(request).await?;
        self.start(intent.id).await?;
        self.advance(intent.id).await
    }

    /// Cancel a pending or in-progress intent.
    ///
    /// Idempotent: cancelling an already cancelled intent succeeds without
    /// writing. No rollback is triggered.
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    pub async fn cancel(&self, intent_id: Uuid) -> GovernanceResult<Intent> {
        loop {
            let mut intent = self.get(intent_id)?;
            let previous = intent.state;

            if intent.is_terminal() {
                if previous == IntentState::Cancelled {
                    debug!("Intent already cancelled");
                    return Ok(intent);
                }
                return Err(GovernanceError::InvalidTransition {
                    intent_id,
                    from: previous,
                    to: IntentState::Cancelled,
                });
            }

            let now = self.ctx.clock.now();
            intent.transition_to(IntentState::Cancelled)?;
            intent.completed_at = Some(now);

            let cancelled = IntentEvent::transition(
                &intent,
                IntentEventType::Cancelled,
                Some(previous),
                intent.actor.principal(),
                now,
            );

            match self.ctx.intents.commit(&mut intent, &[], &[cancelled]) {
                Ok(()) => {
                    info!(from = %previous, "Intent cancelled");
                    return Ok(intent);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Intent changed while cancelling, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get(&self, intent_id: Uuid) -> GovernanceResult<Intent> {
        self.ctx
            .intents
            .get(intent_id)?
            .ok_or(GovernanceError::IntentNotFound(intent_id))
    }

    pub fn steps(&self, intent_id: Uuid) -> GovernanceResult<Vec<IntentStep>> {
        self.get(intent_id)?;
        Ok(self.ctx.intents.steps(intent_id)?)
    }

    /// Lifecycle events in order.
    ///
    /// The history is replayed against the stored state; a mismatch is
    /// logged, never hidden.
    pub fn history(&self, intent_id: Uuid) -> GovernanceResult<Vec<IntentEvent>> {
        let intent = self.get(intent_id)?;
        let events = self.ctx.intents.events(intent_id)?;
        let replayed = replay_state(&events);
        if replayed != Some(intent.state) {
            warn!(
                %intent_id,
                state = %intent.state,
                replayed = ?replayed,
                "Intent history does not replay to the stored state"
            );
        }
        Ok(events)
    }

    pub fn children(&self, intent_id: Uuid) -> GovernanceResult<Vec<Intent>> {
        self.get(intent_id)?;
        Ok(self.ctx.intents.children(intent_id)?)
    }

    async fn run_step(
        &self,
        intent: Intent,
        template: &IntentTemplate,
        steps: &[IntentStep],
        idx: usize,
    ) -> GovernanceResult<StepOutcome> {
        let mut intent = intent;
        let mut step = steps[idx].clone();

        // Strict total order: the predecessor must have settled
        if idx > 0 && !steps[idx - 1].is_settled() {
            return Err(GovernanceError::StepOutOfOrder {
                intent_id: intent.id,
                sequence: step.sequence_num,
            });
        }

        let input = json!({
            "context": intent.context,
            "previous": steps[..idx].iter().rev().find(|s| s.status == StepStatus::Completed).and_then(|s| s.output.clone()),
        });

        let decided = evaluate_and_record(
            &self.ctx,
            &GovernedAction {
                intent: &intent,
                template,
                sequence: step.sequence_num,
                action: &step.action,
                requires_role: step.requires_role.as_deref(),
                input: &input,
            },
        )
        .await?;

        step.policy_decision = Some(decided.response.decision);
        step.ledger_event_id = Some(decided.ledger_event.id);
        step.input = Some(input.clone());

        if !decided.permits_execution() {
            let reason = decided.reason();
            warn!(step = step.sequence_num, action = %step.action, %reason, "Step denied by policy");
            return self.settle_failure_with(intent, steps, step, format!("denied: {}", reason), Vec::new());
        }

        if decided.response.decision != Decision::Allow {
            debug!(
                step = step.sequence_num,
                decision = %decided.response.decision,
                "Proceeding under non-allow decision"
            );
        }

        // Mark in progress; this is where a concurrent cancel is observed
        let now = self.ctx.clock.now();
        let previous_status = step.status;
        step.status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.attempt_count += 1;
        let started = IntentEvent::step(
            &intent,
            step.sequence_num,
            IntentEventType::StepStarted,
            previous_status,
            step.status,
            now,
        )
        .with_detail(format!("decision: {}", decided.response.decision));
        self.commit_active(&mut intent, &[&step], &[started])?;

        let executed = execute_with_retry(
            &self.ctx,
            ExecutorCall {
                intent: &intent,
                sequence: step.sequence_num,
                executor: &step.action,
                compensates: None,
                input: &input,
                first_attempt: step.attempt_count,
                max_attempts: step.max_attempts,
                retry_policy: &template.retry_policy,
            },
        )
        .await;
        step.attempt_count = executed.attempts;

        let abandoned = AbandonedStep {
            step: step.clone(),
            result: executed.result.clone(),
            retries: executed.retries.clone(),
        };
        match self.settle_executed(intent, steps, step, executed) {
            Err(GovernanceError::IntentNotActive { intent_id, state }) => {
                self.record_abandoned(intent_id, abandoned)?;
                Err(GovernanceError::IntentNotActive { intent_id, state })
            }
            other => other,
        }
    }

    /// Commit the outcome of an executed step
    fn settle_executed(
        &self,
        mut intent: Intent,
        steps: &[IntentStep],
        mut step: IntentStep,
        executed: Executed,
    ) -> GovernanceResult<StepOutcome> {
        let now = self.ctx.clock.now();
        if intent.is_overdue(now) {
            // The sweep owns the timed_out transition; persist what ran and abort
            let reason = "deadline passed before the step result could be committed";
            warn!(step = step.sequence_num, "Late step result discarded");
            step.status = StepStatus::Failed;
            step.error_message = Some(reason.to_string());
            step.completed_at = Some(now);
            let failed = IntentEvent::step(
                &intent,
                step.sequence_num,
                IntentEventType::StepFailed,
                StepStatus::InProgress,
                step.status,
                now,
            )
            .with_detail(reason);
            let mut events = executed.retries;
            events.push(failed);
            self.commit_active(&mut intent, &[&step], &events)?;

            return Err(GovernanceError::TimeoutExceeded {
                intent_id: intent.id,
                timeout_at: intent.timeout_at.unwrap_or(now),
            });
        }

        match executed.result {
            Ok(output) => {
                step.status = StepStatus::Completed;
                step.output = Some(output);
                step.error_message = None;
                step.completed_at = Some(now);
                intent.current_step = step.sequence_num;

                let mut events = executed.retries;
                events.push(IntentEvent::step(
                    &intent,
                    step.sequence_num,
                    IntentEventType::StepCompleted,
                    StepStatus::InProgress,
                    step.status,
                    now,
                ));

                info!(step = step.sequence_num, action = %step.action, attempts = step.attempt_count, "Step completed");
                self.settle_success(intent, steps, step, events)
            }
            Err(e) => {
                error!(
                    step = step.sequence_num,
                    action = %step.action,
                    attempts = step.attempt_count,
                    error = %e,
                    "Step failed permanently"
                );
                let detail = format!("failed after {} attempt(s): {}", step.attempt_count, e);
                self.settle_failure_with(intent, steps, step, detail, executed.retries)
            }
        }
    }

    /// Persist what ran for a step whose intent left `in_progress` while the
    /// executor was running.
    ///
    /// The intent keeps the state the other writer gave it. A step that
    /// writer already settled (the sweep fails interrupted steps) keeps its
    /// status; otherwise the executor's outcome is written. Retries and the
    /// attempt count are always kept.
    fn record_abandoned(&self, intent_id: Uuid, abandoned: AbandonedStep) -> GovernanceResult<()> {
        loop {
            let mut intent = self.get(intent_id)?;
            let stored = self
                .ctx
                .intents
                .steps(intent_id)?
                .into_iter()
                .find(|s| s.id == abandoned.step.id);
            let Some(mut step) = stored else {
                return Ok(());
            };

            let now = self.ctx.clock.now();
            step.attempt_count = step.attempt_count.max(abandoned.step.attempt_count);
            let mut events = abandoned.retries.clone();

            if step.status == StepStatus::InProgress {
                let detail = format!("intent became {} while the step ran", intent.state);
                step.completed_at = Some(now);
                let event_type = match &abandoned.result {
                    Ok(output) => {
                        step.status = StepStatus::Completed;
                        step.output = Some(output.clone());
                        step.error_message = None;
                        IntentEventType::StepCompleted
                    }
                    Err(e) => {
                        step.status = StepStatus::Failed;
                        step.error_message = Some(format!("aborted: {}: {}", detail, e));
                        IntentEventType::StepFailed
                    }
                };
                events.push(
                    IntentEvent::step(
                        &intent,
                        step.sequence_num,
                        event_type,
                        StepStatus::InProgress,
                        step.status,
                        now,
                    )
                    .with_detail(detail),
                );
            }

            match self.ctx.intents.commit(&mut intent, &[&step], &events) {
                Ok(()) => {
                    warn!(
                        %intent_id,
                        step = step.sequence_num,
                        status = %step.status,
                        state = %intent.state,
                        "Recorded step outcome after the intent left in_progress"
                    );
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Intent changed while recording abandoned step, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Commit a settled (completed/skipped) step, completing the intent if it
    /// was the last one.
    fn settle_success(
        &self,
        mut intent: Intent,
        steps: &[IntentStep],
        step: IntentStep,
        mut events: Vec<IntentEvent>,
    ) -> GovernanceResult<StepOutcome> {
        let remaining = steps
            .iter()
            .filter(|s| s.sequence_num != step.sequence_num)
            .any(|s| !s.is_settled());

        if remaining {
            self.commit_active(&mut intent, &[&step], &events)?;
            return Ok(StepOutcome::Continue);
        }

        let now = self.ctx.clock.now();
        let mut all: Vec<IntentStep> = steps.to_vec();
        if let Some(slot) = all.iter_mut().find(|s| s.id == step.id) {
            *slot = step.clone();
        }

        intent.transition_to(IntentState::Completed)?;
        intent.completed_at = Some(now);
        intent.result = Some(collect_outputs(&all));
        events.push(IntentEvent::transition(
            &intent,
            IntentEventType::Completed,
            Some(IntentState::InProgress),
            intent.actor.principal(),
            now,
        ));
        self.commit_active(&mut intent, &[&step], &events)?;

        info!(intent_id = %intent.id, "Intent completed");
        Ok(StepOutcome::Finished(intent))
    }

    /// Fail a required step (and the intent) or skip an optional one
    fn settle_failure_with(
        &self,
        mut intent: Intent,
        steps: &[IntentStep],
        mut step: IntentStep,
        detail: String,
        mut events: Vec<IntentEvent>,
    ) -> GovernanceResult<StepOutcome> {
        let now = self.ctx.clock.now();
        let previous_status = step.status;
        step.error_message = Some(detail.clone());
        step.completed_at = Some(now);

        if !step.required {
            step.status = StepStatus::Skipped;
            intent.current_step = step.sequence_num;
            events.push(
                IntentEvent::step(
                    &intent,
                    step.sequence_num,
                    IntentEventType::StepSkipped,
                    previous_status,
                    step.status,
                    now,
                )
                .with_detail(detail),
            );
            info!(step = step.sequence_num, action = %step.action, "Optional step skipped");
            return self.settle_success(intent, steps, step, events);
        }

        step.status = StepStatus::Failed;
        events.push(
            IntentEvent::step(
                &intent,
                step.sequence_num,
                IntentEventType::StepFailed,
                previous_status,
                step.status,
                now,
            )
            .with_detail(detail.clone()),
        );

        intent.transition_to(IntentState::Failed)?;
        intent.error = Some(format!("step {} ({}) {}", step.sequence_num, step.action, detail));
        intent.completed_at = Some(now);
        events.push(
            IntentEvent::transition(
                &intent,
                IntentEventType::Failed,
                Some(IntentState::InProgress),
                intent.actor.principal(),
                now,
            )
            .with_detail(detail),
        );
        self.commit_active(&mut intent, &[&step], &events)?;

        error!(intent_id = %intent.id, step = step.sequence_num, "Intent failed");
        Ok(StepOutcome::Finished(intent))
    }

    /// Hand a failed intent to rollback when the template declares a
    /// rollback set.
    ///
    /// An incomplete rollback has already alerted an operator; the caller
    /// gets the intent, still `failed`.
    async fn finish(&self, intent: Intent, template: &IntentTemplate) -> GovernanceResult<Intent> {
        if intent.state != IntentState::Failed || template.rollback_on_failure.is_empty() {
            return Ok(intent);
        }

        match RollbackCoordinator::new(self.ctx.clone()).rollback(intent.id).await {
            Ok(rolled) => Ok(rolled),
            Err(GovernanceError::RollbackIncomplete { step_sequence, .. }) => {
                warn!(intent_id = %intent.id, step = step_sequence, "Rollback incomplete");
                self.get(intent.id)
            }
            Err(e) => Err(e),
        }
    }

    /// Complete an intent whose steps are all settled (e.g. after a crash
    /// between the last step and the completion commit).
    fn complete(&self, mut intent: Intent, steps: &[IntentStep]) -> GovernanceResult<Intent> {
        let now = self.ctx.clock.now();
        intent.transition_to(IntentState::Completed)?;
        intent.completed_at = Some(now);
        intent.result = Some(collect_outputs(steps));
        let completed = IntentEvent::transition(
            &intent,
            IntentEventType::Completed,
            Some(IntentState::InProgress),
            intent.actor.principal(),
            now,
        );
        self.commit_active(&mut intent, &[], &[completed])?;
        Ok(intent)
    }

    /// Commit while `in_progress`; a lost race surfaces as
    /// `IntentNotActive` when the intent left `in_progress`.
    fn commit_active(
        &self,
        intent: &mut Intent,
        steps: &[&IntentStep],
        events: &[IntentEvent],
    ) -> GovernanceResult<()> {
        match self.ctx.intents.commit(intent, steps, events) {
            Ok(()) => Ok(()),
            Err(StoreError::VersionConflict {
                intent_id,
                expected_version,
            }) => {
                let current = self.get(intent_id)?;
                if current.state != IntentState::InProgress {
                    warn!(%intent_id, state = %current.state, "Intent changed state underneath advance, aborting");
                    Err(GovernanceError::IntentNotActive {
                        intent_id,
                        state: current.state,
                    })
                } else {
                    Err(GovernanceError::StaleState {
                        intent_id,
                        expected_version,
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_within_deadline(&self, intent: &Intent) -> GovernanceResult<()> {
        match intent.timeout_at {
            Some(timeout_at) if intent.is_overdue(self.ctx.clock.now()) => {
                Err(GovernanceError::TimeoutExceeded {
                    intent_id: intent.id,
                    timeout_at,
                })
            }
            _ => Ok(()),
        }
    }

    fn template_for(&self, intent: &Intent) -> GovernanceResult<std::sync::Arc<IntentTemplate>> {
        self.ctx
            .templates
            .get(&intent.template_name, Some(intent.template_version))
    }

    fn deadline(&self, template: &IntentTemplate, started_at: DateTime<Utc>) -> DateTime<Utc> {
        match template.timeout_seconds {
            Some(_) => compute_timeout_at(template, started_at),
            None => deadline_after(started_at, self.ctx.settings.default_timeout_seconds),
        }
    }
}

/// `{action: output}` for every completed step
fn collect_outputs(steps: &[IntentStep]) -> Value {
    let outputs: BTreeMap<&str, Value> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| (s.action.as_str(), s.output.clone().unwrap_or(Value::Null)))
        .collect();
    json!(outputs)
}
