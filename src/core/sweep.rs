//! Timeout sweep.
//!
//! The only writer of `timed_out`: finds `in_progress` intents whose deadline
//! has passed, moves them to `timed_out` and hands them to rollback. Each
//! transition is a version-checked commit, so several sweepers (or a sweep
//! racing `advance`/`cancel`) never double-apply.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Intent, IntentEvent, IntentEventType, IntentState, StepStatus, SWEEPER_ACTOR};
use crate::error::{GovernanceError, GovernanceResult};

use super::context::GovernanceContext;
use super::db::StoreError;
use super::rollback::RollbackCoordinator;

const INTERRUPTED: &str = "interrupted: intent timed out";

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Intents moved to `timed_out`
    pub timed_out: Vec<Uuid>,

    /// Of those, intents whose rollback completed
    pub rolled_back: Vec<Uuid>,

    /// Of those, intents left for an operator
    pub rollback_incomplete: Vec<Uuid>,

    /// Intents another writer moved first
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.skipped == 0
    }
}

/// Periodic deadline enforcement
#[derive(Clone)]
pub struct TimeoutSweeper {
    ctx: GovernanceContext,
}

impl TimeoutSweeper {
    pub fn new(ctx: GovernanceContext) -> Self {
        Self { ctx }
    }

    /// Time out every overdue intent once
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> GovernanceResult<SweepReport> {
        let now = self.ctx.clock.now();
        let expired = self.ctx.intents.expired(now)?;
        let mut report = SweepReport::default();

        if expired.is_empty() {
            debug!("No overdue intents");
            return Ok(report);
        }

        for intent in expired {
            let intent_id = intent.id;
            let (template_name, template_version) =
                (intent.template_name.clone(), intent.template_version);
            match self.time_out(intent) {
                Ok(true) => report.timed_out.push(intent_id),
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(%intent_id, error = %e, "Failed to time out intent");
                    continue;
                }
            }

            match self.ctx.templates.get(&template_name, Some(template_version)) {
                Ok(template) if template.rollback_on_failure.is_empty() => continue,
                Ok(_) => {}
                Err(e) => {
                    error!(%intent_id, error = %e, "Template unavailable, rollback skipped");
                    report.rollback_incomplete.push(intent_id);
                    continue;
                }
            }

            match RollbackCoordinator::new(self.ctx.clone()).rollback(intent_id).await {
                Ok(intent) if intent.state == IntentState::RolledBack => {
                    report.rolled_back.push(intent_id)
                }
                Ok(_) => {}
                Err(GovernanceError::RollbackIncomplete { .. }) => {
                    report.rollback_incomplete.push(intent_id)
                }
                Err(e) => {
                    error!(%intent_id, error = %e, "Rollback after timeout failed");
                    report.rollback_incomplete.push(intent_id);
                }
            }
        }

        info!(
            timed_out = report.timed_out.len(),
            rolled_back = report.rolled_back.len(),
            rollback_incomplete = report.rollback_incomplete.len(),
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Returns `false` if the intent left `in_progress` before the commit
    fn time_out(&self, mut intent: Intent) -> GovernanceResult<bool> {
        let now = self.ctx.clock.now();

        let mut steps = self.ctx.intents.steps(intent.id)?;
        let mut events = Vec::new();
        for step in steps.iter_mut().filter(|s| s.status == StepStatus::InProgress) {
            step.status = StepStatus::Failed;
            step.error_message = Some(INTERRUPTED.to_string());
            step.completed_at = Some(now);
            let mut event = IntentEvent::step(
                &intent,
                step.sequence_num,
                IntentEventType::StepFailed,
                StepStatus::InProgress,
                step.status,
                now,
            )
            .with_detail(INTERRUPTED);
            event.actor = SWEEPER_ACTOR.to_string();
            events.push(event);
        }

        let deadline = intent.timeout_at;
        intent.transition_to(IntentState::TimedOut)?;
        intent.completed_at = Some(now);
        intent.error = Some(match deadline {
            Some(at) => format!("deadline {} exceeded", at.to_rfc3339()),
            None => "deadline exceeded".to_string(),
        });
        events.push(
            IntentEvent::transition(
                &intent,
                IntentEventType::TimedOut,
                Some(IntentState::InProgress),
                SWEEPER_ACTOR,
                now,
            )
            .with_detail(format!("deadline {:?} passed", deadline)),
        );

        let interrupted: Vec<_> = steps
            .iter()
            .filter(|s| s.error_message.as_deref() == Some(INTERRUPTED))
            .collect();
        match self.ctx.intents.commit(&mut intent, &interrupted, &events) {
            Ok(()) => {
                warn!(intent_id = %intent.id, "Intent timed out");
                Ok(true)
            }
            Err(StoreError::VersionConflict { .. }) => {
                debug!(intent_id = %intent.id, "Intent changed before the sweep could time it out");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sweep every `interval` until stopped
    pub fn spawn(self, interval: Duration) -> SweepHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "Timeout sweeper running");
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        info!("Timeout sweeper stopping...");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "Sweep failed");
                        }
                    }
                }
            }
        });

        SweepHandle { stop_tx, task }
    }
}

/// Handle to a running sweeper
pub struct SweepHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl SweepHandle {
    /// Stop the sweeper after its current pass
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}
