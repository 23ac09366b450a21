//! Local rule table evaluator for dry runs and tests.
//!
//! Rules are checked in order; the first whose action glob, role and
//! required facts all match decides. When nothing matches, the default
//! stance applies and `policy_id` is left empty.
//!
//! ```yaml
//! policy_id: deploy-guard
//! version: "4"
//! default_decision: deny
//! rules:
//!   - pattern: "deployment:*"
//!     decision: allow
//!     role: release-manager
//!   - pattern: "secret:rotate"
//!     decision: shadow_deny
//!     required_ledger_level: full
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::{PolicyError, PolicyEvaluator, PolicyRequest, PolicyResponse};
use crate::domain::{Decision, LedgerLevel};

/// One row of the rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Glob over the action name, e.g. `deployment:*`
    pub pattern: String,

    pub decision: Decision,

    /// Only match subjects holding this role
    #[serde(default)]
    pub role: Option<String>,

    /// Only match when all of these facts are asserted
    #[serde(default)]
    pub requires_facts: Vec<String>,

    #[serde(default)]
    pub required_ledger_level: LedgerLevel,

    #[serde(default)]
    pub reason: Option<String>,

    /// Overrides the table's `policy_id` for this rule
    #[serde(default)]
    pub id: Option<String>,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, decision: Decision) -> Self {
        Self {
            pattern: pattern.into(),
            decision,
            role: None,
            requires_facts: Vec::new(),
            required_ledger_level: LedgerLevel::Decision,
            reason: None,
            id: None,
        }
    }

    pub fn for_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn requiring_level(mut self, level: LedgerLevel) -> Self {
        self.required_ledger_level = level;
        self
    }

    pub fn requiring_fact(mut self, fact: impl Into<String>) -> Self {
        self.requires_facts.push(fact.into());
        self
    }
}

/// Rule table as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RuleFile {
    policy_id: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default = "default_decision")]
    default_decision: Decision,
    #[serde(default)]
    default_ledger_level: LedgerLevel,
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

fn default_decision() -> Decision {
    Decision::Deny
}

/// Evaluates requests against an ordered rule table
#[derive(Debug, Clone)]
pub struct StaticPolicyEvaluator {
    policy_id: String,
    version: Option<String>,
    rules: Vec<(Pattern, PolicyRule)>,
    default_decision: Decision,
    default_ledger_level: LedgerLevel,
}

impl StaticPolicyEvaluator {
    /// Empty table with the given default stance
    pub fn new(policy_id: impl Into<String>, default_decision: Decision) -> Self {
        Self {
            policy_id: policy_id.into(),
            version: None,
            rules: Vec::new(),
            default_decision,
            default_ledger_level: LedgerLevel::Decision,
        }
    }

    /// Allow everything by default
    pub fn allow_all() -> Self {
        Self::new("allow-all", Decision::Allow)
    }

    /// Deny everything by default
    pub fn deny_all() -> Self {
        Self::new("deny-all", Decision::Deny)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Append a rule; later rules only apply when earlier ones don't match
    pub fn with_rule(mut self, rule: PolicyRule) -> Result<Self, PolicyError> {
        let pattern = Pattern::new(&rule.pattern)
            .map_err(|e| PolicyError::Rules(format!("bad pattern '{}': {}", rule.pattern, e)))?;
        self.rules.push((pattern, rule));
        Ok(self)
    }

    /// Parse a rule table from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: RuleFile = serde_yaml::from_str(content).context("Failed to parse policy rules")?;

        let mut evaluator = Self::new(file.policy_id, file.default_decision);
        evaluator.version = file.version;
        evaluator.default_ledger_level = file.default_ledger_level;
        for rule in file.rules {
            evaluator = evaluator.with_rule(rule)?;
        }
        Ok(evaluator)
    }

    /// Load a rule table from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy rules: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn decide(&self, request: &PolicyRequest) -> PolicyResponse {
        let facts = request.context.evidence.asserted_facts();

        let matched = self.rules.iter().find(|(pattern, rule)| {
            pattern.matches(&request.action)
                && rule.role.as_deref().map_or(true, |r| r == request.subject.role)
                && rule.requires_facts.iter().all(|f| facts.contains(&f.as_str()))
        });

        match matched {
            Some((_, rule)) => PolicyResponse {
                decision: rule.decision,
                policy_id: Some(rule.id.clone().unwrap_or_else(|| self.policy_id.clone())),
                policy_version: self.version.clone(),
                reason: rule
                    .reason
                    .clone()
                    .or_else(|| Some(format!("matched rule '{}'", rule.pattern))),
                required_ledger_level: rule.required_ledger_level,
            },
            None => PolicyResponse {
                decision: self.default_decision,
                policy_id: None,
                policy_version: None,
                reason: Some("no rule matched; default stance applied".to_string()),
                required_ledger_level: self.default_ledger_level,
            },
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicyEvaluator {
    fn name(&self) -> &str {
        "static"
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyResponse, PolicyError> {
        Ok(self.decide(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{PolicyContext, PolicyResource, PolicySubject, RequestMetadata};
    use crate::domain::Actor;
    use crate::evidence::Evidence;
    use uuid::Uuid;

    fn request(action: &str, role: &str, evidence: Evidence) -> PolicyRequest {
        PolicyRequest {
            subject: PolicySubject::from_actor(&Actor::user("alice", role)),
            action: action.to_string(),
            resource: PolicyResource {
                resource_type: "service".to_string(),
                id: None,
                attributes: None,
            },
            context: PolicyContext {
                evidence,
                request_metadata: RequestMetadata {
                    host: "gov.example.com".to_string(),
                    service: "deploy".to_string(),
                    correlation_id: Uuid::new_v4(),
                    intent_id: None,
                },
            },
        }
    }

    const RULES: &str = r#"
policy_id: deploy-guard
version: "4"
default_decision: deny
rules:
  - pattern: "deployment:approve"
    decision: allow
    role: release-manager
  - pattern: "deployment:execute"
    decision: allow
    requires_facts: [change_ticket_approved]
    required_ledger_level: full
  - pattern: "deployment:*"
    decision: warn
"#;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let evaluator = StaticPolicyEvaluator::from_yaml(RULES).unwrap();
        assert_eq!(evaluator.rule_count(), 3);

        let approve = evaluator
            .evaluate(&request("deployment:approve", "release-manager", Evidence::new()))
            .await
            .unwrap();
        assert_eq!(approve.decision, Decision::Allow);
        assert_eq!(approve.policy_id.as_deref(), Some("deploy-guard"));
        assert_eq!(approve.policy_version.as_deref(), Some("4"));

        // Wrong role falls through to the wildcard
        let approve = evaluator
            .evaluate(&request("deployment:approve", "engineer", Evidence::new()))
            .await
            .unwrap();
        assert_eq!(approve.decision, Decision::Warn);
    }

    #[tokio::test]
    async fn test_required_facts() {
        let evaluator = StaticPolicyEvaluator::from_yaml(RULES).unwrap();

        let with_ticket = evaluator
            .evaluate(&request(
                "deployment:execute",
                "engineer",
                Evidence::new().assert("change_ticket_approved"),
            ))
            .await
            .unwrap();
        assert_eq!(with_ticket.decision, Decision::Allow);
        assert_eq!(with_ticket.required_ledger_level, LedgerLevel::Full);

        let without = evaluator
            .evaluate(&request("deployment:execute", "engineer", Evidence::new()))
            .await
            .unwrap();
        assert_eq!(without.decision, Decision::Warn);
    }

    #[tokio::test]
    async fn test_default_stance_has_no_policy_id() {
        let evaluator = StaticPolicyEvaluator::from_yaml(RULES).unwrap();
        let response = evaluator
            .evaluate(&request("secret:rotate", "engineer", Evidence::new()))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Deny);
        assert!(response.policy_id.is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = StaticPolicyEvaluator::allow_all().with_rule(PolicyRule::new("deploy[", Decision::Deny));
        assert!(matches!(result, Err(PolicyError::Rules(_))));
    }
}
