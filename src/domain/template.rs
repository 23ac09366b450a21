//! Intent templates: versioned workflow definitions.
//!
//! Templates are defined in YAML and consist of strictly ordered steps,
//! each naming a governed action.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timeout applied when a template does not set one
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 1800;

/// Suffix of the synthetic action used for compensation
pub const ROLLBACK_SUFFIX: &str = ":rollback";

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentTemplate {
    /// Template name (used to create intents)
    pub name: String,

    /// Version; `(name, version)` is immutable once registered
    pub version: u32,

    #[serde(default)]
    pub description: String,

    /// Policy scope the steps are evaluated under
    pub policy_scope: String,

    /// Resource type presented to the policy evaluator
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    /// Ordered steps, `sequence` contiguous from 1
    pub steps: Vec<TemplateStep>,

    /// Step actions that must be compensated if the intent fails after they ran
    #[serde(default)]
    pub rollback_on_failure: Vec<String>,

    /// Explicit compensating executor per action (default `<action>:rollback`)
    #[serde(default)]
    pub compensations: BTreeMap<String, String>,

    /// Deadline for the whole intent, measured from `start`
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Retry policy for executor failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_resource_type() -> String {
    "intent".to_string()
}

impl IntentTemplate {
    /// Load a template from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a template from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse template YAML")
    }

    /// Validate the definition.
    ///
    /// Sequences must be exactly `1..=N` so the orchestrator can always treat
    /// "next step" as `current + 1`.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("template name cannot be empty".to_string());
        }
        if self.steps.is_empty() {
            return Err(format!("template '{}' must have at least one step", self.name));
        }
        if self.timeout_seconds == Some(0) {
            return Err(format!("template '{}' has a zero timeout", self.name));
        }

        let mut sequences: Vec<u32> = self.steps.iter().map(|s| s.sequence).collect();
        sequences.sort_unstable();
        for (i, seq) in sequences.iter().enumerate() {
            let expected = i as u32 + 1;
            if *seq != expected {
                return Err(format!(
                    "template '{}' step sequences must be contiguous from 1: expected {}, found {}",
                    self.name, expected, seq
                ));
            }
        }

        let mut actions = HashSet::new();
        for step in &self.steps {
            if step.action.trim().is_empty() {
                return Err(format!("step {} has an empty action", step.sequence));
            }
            if step.action.ends_with(ROLLBACK_SUFFIX) {
                return Err(format!(
                    "step {} action '{}' uses the reserved '{}' suffix",
                    step.sequence, step.action, ROLLBACK_SUFFIX
                ));
            }
            if !actions.insert(step.action.as_str()) {
                return Err(format!("action '{}' appears in more than one step", step.action));
            }
            if step.max_attempts == Some(0) {
                return Err(format!("step {} allows zero attempts", step.sequence));
            }
        }

        for action in &self.rollback_on_failure {
            if !actions.contains(action.as_str()) {
                return Err(format!(
                    "rollback_on_failure names '{}', which is not a step action",
                    action
                ));
            }
        }
        for action in self.compensations.keys() {
            if !self.rollback_on_failure.contains(action) {
                return Err(format!(
                    "compensation declared for '{}', which is not in rollback_on_failure",
                    action
                ));
            }
        }

        Ok(())
    }

    /// Steps ordered by sequence
    pub fn ordered_steps(&self) -> Vec<&TemplateStep> {
        let mut steps: Vec<&TemplateStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.sequence);
        steps
    }

    /// Whether a step action must be compensated on failure
    pub fn requires_rollback(&self, action: &str) -> bool {
        self.rollback_on_failure.iter().any(|a| a == action)
    }

    /// Executor name that compensates `action`
    pub fn compensation_for(&self, action: &str) -> String {
        self.compensations
            .get(action)
            .cloned()
            .unwrap_or_else(|| rollback_action(action))
    }

    /// Effective intent deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS))
    }
}

/// Synthetic action name for compensating `action`
pub fn rollback_action(action: &str) -> String {
    format!("{}{}", action, ROLLBACK_SUFFIX)
}

/// A single step in a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    /// Position, contiguous from 1
    pub sequence: u32,

    /// Governed action (verb:noun)
    pub action: String,

    /// Optional steps end `skipped` instead of failing the intent
    #[serde(default = "default_required")]
    pub required: bool,

    /// Role the executing actor must hold
    #[serde(default)]
    pub requires_role: Option<String>,

    /// Override for `retry_policy.max_attempts`
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_required() -> bool {
    true
}

impl TemplateStep {
    pub fn new(sequence: u32, action: impl Into<String>) -> Self {
        Self {
            sequence,
            action: action.into(),
            required: true,
            requires_role: None,
            max_attempts: None,
        }
    }

    /// Effective attempt budget
    pub fn attempts(&self, policy: &RetryPolicy) -> u32 {
        self.max_attempts.unwrap_or(policy.max_attempts)
    }
}

/// Retry policy for failed step executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT_YAML: &str = r#"
name: deployment
version: 1
description: Ship a service to production
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
    max_attempts: 5
  - sequence: 5
    action: deployment:validate
    required: false

rollback_on_failure:
  - deployment:execute
  - deployment:validate

compensations:
  deployment:execute: deployment:revert

timeout_seconds: 900
"#;

    #[test]
    fn test_template_parsing() {
        let template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();

        assert_eq!(template.name, "deployment");
        assert_eq!(template.steps.len(), 5);
        assert_eq!(template.resource_type, "service");
        assert_eq!(template.steps[1].requires_role.as_deref(), Some("release-manager"));
        assert!(!template.steps[4].required);
        assert_eq!(template.steps[3].attempts(&template.retry_policy), 5);
        assert_eq!(template.steps[0].attempts(&template.retry_policy), 3);
        assert_eq!(template.timeout(), Duration::from_secs(900));
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_compensation_lookup() {
        let template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();
        assert_eq!(template.compensation_for("deployment:execute"), "deployment:revert");
        assert_eq!(
            template.compensation_for("deployment:validate"),
            "deployment:validate:rollback"
        );
        assert!(template.requires_rollback("deployment:execute"));
        assert!(!template.requires_rollback("deployment:request"));
    }

    #[test]
    fn test_non_contiguous_sequences_rejected() {
        let mut template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();
        template.steps[2].sequence = 7;
        let err = template.validate().unwrap_err();
        assert!(err.contains("contiguous"));

        template.steps[2].sequence = 0;
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_rollback_set_must_name_steps() {
        let mut template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();
        template.rollback_on_failure.push("deployment:teleport".to_string());
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_default_timeout() {
        let mut template = IntentTemplate::from_yaml(DEPLOYMENT_YAML).unwrap();
        template.timeout_seconds = None;
        assert_eq!(template.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));

        template.timeout_seconds = Some(0);
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped

        assert_eq!(RetryPolicy::immediate(3).delay_for_attempt(2), Duration::ZERO);
    }
}
