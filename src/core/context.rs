//! Explicit handle to every collaborator the orchestrator uses.

use std::sync::Arc;

use crate::adapters::{ExecutorRegistry, LogNotifier, OperatorNotifier, PolicyEvaluator};
use crate::domain::DEFAULT_TIMEOUT_SECONDS;

use super::clock::{Clock, SystemClock};
use super::db::Database;
use super::intent_store::IntentStore;
use super::ledger_store::LedgerStore;
use super::recorder::LedgerRecorder;
use super::registry::TemplateRegistry;

/// Where the orchestrator reports itself in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Host recorded on every ledger event (drives the layer)
    pub host: String,

    /// Service recorded on every ledger event
    pub service: String,

    /// Deadline for templates that don't set `timeout_seconds`
    pub default_timeout_seconds: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            host: "gov.localhost".to_string(),
            service: "govflow".to_string(),
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// Stores, registries and external collaborators, passed to every component
#[derive(Clone)]
pub struct GovernanceContext {
    pub db: Database,
    pub ledger: LedgerStore,
    pub recorder: LedgerRecorder,
    pub intents: IntentStore,
    pub templates: Arc<TemplateRegistry>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub executors: Arc<ExecutorRegistry>,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub clock: Arc<dyn Clock>,
    pub settings: OrchestratorSettings,
}

impl GovernanceContext {
    pub fn new(
        db: Database,
        templates: Arc<TemplateRegistry>,
        policy: Arc<dyn PolicyEvaluator>,
        executors: ExecutorRegistry,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = LedgerStore::new(db.clone());

        Self {
            recorder: LedgerRecorder::new(ledger.clone(), clock.clone()),
            intents: IntentStore::new(db.clone()),
            ledger,
            db,
            templates,
            policy,
            executors: Arc::new(executors),
            notifier: Arc::new(LogNotifier),
            clock,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.recorder = LedgerRecorder::new(self.ledger.clone(), clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn OperatorNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }
}
