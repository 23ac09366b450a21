//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Value};

use govflow::adapters::{
    ExecutorError, ExecutorRegistry, OperatorAlert, OperatorNotifier, StaticPolicyEvaluator,
    StepExecutor, StepInvocation,
};
use govflow::core::{
    Database, GovernanceContext, ManualClock, Orchestrator, TemplateRegistry, TimeoutSweeper,
};
use govflow::domain::{IntentTemplate, RetryPolicy};

pub const DEPLOYMENT_YAML: &str = r#"
name: deployment
version: 1
policy_scope: governance:deploy
resource_type: service
steps:
  - sequence: 1
    action: deployment:request
  - sequence: 2
    action: deployment:approve
    requires_role: release-manager
  - sequence: 3
    action: deployment:pre-check
  - sequence: 4
    action: deployment:execute
  - sequence: 5
    action: deployment:validate
rollback_on_failure:
  - deployment:execute
  - deployment:validate
timeout_seconds: 900
"#;

/// The five-step deployment template with retries that don't sleep
pub fn deployment_template() -> IntentTemplate {
    let mut template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();
    template.retry_policy = RetryPolicy::immediate(3);
    template
}

/// Executor that replays a script of results, then succeeds
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<Value, ExecutorError>>>,
    calls: Mutex<Vec<StepInvocation>>,
}

impl ScriptedExecutor {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize) -> Arc<Self> {
        let script = (0..times)
            .map(|i| Err(ExecutorError::Transient(format!("connection reset #{}", i + 1))))
            .collect();
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn permanent(message: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::from([Err(ExecutorError::Permanent(message.to_string()))])),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<StepInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, ExecutorError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(json!({ "action": invocation.action, "attempt": invocation.attempt })),
        }
    }
}

/// Executor that moves the shared clock forward while it "runs"
pub struct SlowExecutor {
    pub clock: Arc<ManualClock>,
    pub takes: ChronoDuration,
}

#[async_trait]
impl StepExecutor for SlowExecutor {
    async fn execute(&self, _invocation: &StepInvocation) -> Result<Value, ExecutorError> {
        self.clock.advance(self.takes);
        Ok(json!("done"))
    }
}

/// Executor that outlives the deadline and runs the sweep before returning
pub struct SweepingExecutor {
    pub clock: Arc<ManualClock>,
    pub takes: ChronoDuration,
    pub sweeper: Mutex<Option<TimeoutSweeper>>,
}

#[async_trait]
impl StepExecutor for SweepingExecutor {
    async fn execute(&self, _invocation: &StepInvocation) -> Result<Value, ExecutorError> {
        self.clock.advance(self.takes);
        let sweeper = self.sweeper.lock().unwrap().clone();
        if let Some(sweeper) = sweeper {
            sweeper
                .sweep_once()
                .await
                .map_err(|e| ExecutorError::Permanent(e.to_string()))?;
        }
        Ok(json!("done"))
    }
}

/// Executor that cancels its own intent before returning
#[derive(Default)]
pub struct CancellingExecutor {
    pub orchestrator: Mutex<Option<Orchestrator>>,

    /// Transient failures returned before the cancelling call
    pub fail_first: usize,

    /// Returned as a permanent failure after cancelling, instead of output
    pub error_after_cancel: Option<String>,

    calls: Mutex<usize>,
}

impl CancellingExecutor {
    pub fn after_failures(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }

    pub fn failing_after_cancel(message: &str) -> Self {
        Self {
            error_after_cancel: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl StepExecutor for CancellingExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, ExecutorError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call <= self.fail_first {
            return Err(ExecutorError::Transient(format!("flaky call {}", call)));
        }

        let orchestrator = self.orchestrator.lock().unwrap().clone();
        if let Some(orchestrator) = orchestrator {
            orchestrator
                .cancel(invocation.intent_id)
                .await
                .map_err(|e| ExecutorError::Permanent(e.to_string()))?;
        }
        match self.error_after_cancel {
            Some(ref message) => Err(ExecutorError::Permanent(message.clone())),
            None => Ok(json!("side effect applied")),
        }
    }
}

/// Notifier that keeps every alert
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn alert(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Everything a test needs to drive intents
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub ctx: GovernanceContext,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(
    policy: StaticPolicyEvaluator,
    executors: ExecutorRegistry,
    templates: Vec<IntentTemplate>,
) -> Harness {
    harness_with_clock(policy, executors, templates, Arc::new(start_clock()))
}

pub fn harness_with_clock(
    policy: StaticPolicyEvaluator,
    executors: ExecutorRegistry,
    templates: Vec<IntentTemplate>,
    clock: Arc<ManualClock>,
) -> Harness {
    let db = Database::in_memory().unwrap();
    let registry = TemplateRegistry::load(db.clone()).unwrap();
    for template in templates {
        registry.register(template).unwrap();
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = GovernanceContext::new(db, Arc::new(registry), Arc::new(policy), executors)
        .with_clock(clock.clone())
        .with_notifier(notifier.clone());

    Harness {
        orchestrator: Orchestrator::new(ctx.clone()),
        ctx,
        clock,
        notifier,
    }
}

/// A fixed, second-aligned starting instant
pub fn start_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap())
}

/// Executors for every deployment action (and both compensations)
pub fn deployment_executors() -> (ExecutorRegistry, DeploymentExecutors) {
    let executors = DeploymentExecutors {
        request: ScriptedExecutor::ok(),
        approve: ScriptedExecutor::ok(),
        pre_check: ScriptedExecutor::ok(),
        execute: ScriptedExecutor::ok(),
        validate: ScriptedExecutor::ok(),
        revert_execute: ScriptedExecutor::ok(),
        revert_validate: ScriptedExecutor::ok(),
    };
    (executors.registry(), executors)
}

pub struct DeploymentExecutors {
    pub request: Arc<ScriptedExecutor>,
    pub approve: Arc<ScriptedExecutor>,
    pub pre_check: Arc<ScriptedExecutor>,
    pub execute: Arc<ScriptedExecutor>,
    pub validate: Arc<ScriptedExecutor>,
    pub revert_execute: Arc<ScriptedExecutor>,
    pub revert_validate: Arc<ScriptedExecutor>,
}

impl DeploymentExecutors {
    pub fn registry(&self) -> ExecutorRegistry {
        ExecutorRegistry::new()
            .with("deployment:request", self.request.clone())
            .with("deployment:approve", self.approve.clone())
            .with("deployment:pre-check", self.pre_check.clone())
            .with("deployment:execute", self.execute.clone())
            .with("deployment:validate", self.validate.clone())
            .with("deployment:execute:rollback", self.revert_execute.clone())
            .with("deployment:validate:rollback", self.revert_validate.clone())
    }
}
