//! Intent CLI subcommands.
//!
//! Provides commands to:
//! - `create` / `start` / `advance`: drive an intent one phase at a time
//! - `run`: create, start and advance in one go
//! - `cancel` / `rollback`: stop an intent or compensate a failed one
//! - `status` / `history`: inspect state, steps and lifecycle events

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{CreateIntent, Orchestrator, RollbackCoordinator};
use crate::domain::{Actor, Intent, IntentState};
use crate::error::GovernanceError;
use crate::evidence::{Claim, Evidence};

/// Intent-related subcommands
#[derive(Subcommand, Debug)]
pub enum IntentCommands {
    /// Create a pending intent from a template
    Create(CreateArgs),

    /// Start a pending intent (fixes its deadline)
    Start {
        /// Intent ID
        intent_id: String,
    },

    /// Run the remaining steps of an in-progress intent
    Advance {
        /// Intent ID
        intent_id: String,
    },

    /// Create, start and advance an intent
    Run(CreateArgs),

    /// Cancel a pending or in-progress intent
    Cancel {
        /// Intent ID
        intent_id: String,
    },

    /// Show an intent and its steps
    Status {
        /// Intent ID
        intent_id: String,
    },

    /// Show the lifecycle events of an intent
    History {
        /// Intent ID
        intent_id: String,
    },

    /// Compensate a failed or timed-out intent
    Rollback {
        /// Intent ID
        intent_id: String,
    },
}

/// Who an intent acts for
#[derive(Args, Debug, Clone)]
pub struct ActorArgs {
    /// Human actor
    #[arg(long, conflicts_with = "agent")]
    pub user: Option<String>,

    /// Automated actor
    #[arg(long)]
    pub agent: Option<String>,

    /// Actor role
    #[arg(long)]
    pub role: String,

    /// Delegation grant the actor acts under
    #[arg(long)]
    pub delegation: Option<String>,
}

impl ActorArgs {
    pub fn to_actor(&self) -> Actor {
        let actor = Actor {
            user_id: self.user.clone(),
            agent_id: self.agent.clone(),
            role: Some(self.role.clone()),
            delegation_id: None,
        };
        match &self.delegation {
            Some(delegation) => actor.with_delegation(delegation.clone()),
            None => actor,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Template name
    pub template: String,

    /// Template version (latest if omitted)
    #[arg(long)]
    pub version: Option<u32>,

    #[command(flatten)]
    pub actor: ActorArgs,

    /// Input parameters as a JSON object
    #[arg(long)]
    pub context: Option<String>,

    /// Asserted fact (repeatable)
    #[arg(long = "fact")]
    pub facts: Vec<String>,

    /// Claim as name=value (value parsed as JSON, else a string; repeatable)
    #[arg(long = "claim")]
    pub claims: Vec<String>,

    /// Parent intent for nested workflows
    #[arg(long)]
    pub parent: Option<String>,
}

impl CreateArgs {
    fn to_request(&self) -> Result<CreateIntent> {
        let mut request = CreateIntent::new(&self.template, self.actor.to_actor());

        if let Some(version) = self.version {
            request = request.version(version);
        }
        if let Some(raw) = &self.context {
            let context: Value =
                serde_json::from_str(raw).context("--context must be a JSON object")?;
            request = request.context(context);
        }

        let mut evidence = Evidence::new();
        for fact in &self.facts {
            evidence = evidence.assert(fact.clone());
        }
        for raw in &self.claims {
            evidence = evidence.claim(parse_claim(raw)?);
        }
        request = request.evidence(evidence);

        if let Some(parent) = &self.parent {
            request = request.parent(parse_id(parent)?);
        }
        Ok(request)
    }
}

fn parse_claim(raw: &str) -> Result<Claim> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Claim must be name=value: {}", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(Claim::new(name.trim(), value))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid intent ID: {}", raw))
}

/// Execute intent subcommands
pub async fn execute(command: IntentCommands) -> Result<()> {
    let ctx = super::open_context()?;
    let orchestrator = Orchestrator::new(ctx.clone());

    match command {
        IntentCommands::Create(args) => {
            let intent = orchestrator.create(args.to_request()?).await?;
            println!("{}", intent.id);
            Ok(())
        }
        IntentCommands::Start { intent_id } => {
            let intent = orchestrator.start(parse_id(&intent_id)?).await?;
            print_summary(&intent);
            Ok(())
        }
        IntentCommands::Advance { intent_id } => {
            let intent = orchestrator.advance(parse_id(&intent_id)?).await?;
            report_outcome(&intent)
        }
        IntentCommands::Run(args) => {
            let intent = orchestrator.execute(args.to_request()?).await?;
            report_outcome(&intent)
        }
        IntentCommands::Cancel { intent_id } => {
            let intent = orchestrator.cancel(parse_id(&intent_id)?).await?;
            print_summary(&intent);
            Ok(())
        }
        IntentCommands::Status { intent_id } => show_status(&orchestrator, parse_id(&intent_id)?),
        IntentCommands::History { intent_id } => show_history(&orchestrator, parse_id(&intent_id)?),
        IntentCommands::Rollback { intent_id } => {
            let id = parse_id(&intent_id)?;
            match RollbackCoordinator::new(ctx).rollback(id).await {
                Ok(intent) => {
                    print_summary(&intent);
                    Ok(())
                }
                Err(e @ GovernanceError::RollbackIncomplete { .. }) => {
                    eprintln!("\n[{}]", e);
                    std::process::exit(2);
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn print_summary(intent: &Intent) {
    println!("Intent:   {}", intent.id);
    println!("Template: {} v{}", intent.template_name, intent.template_version);
    println!("State:    {}", intent.state);
    if let Some(timeout_at) = intent.timeout_at {
        println!("Deadline: {}", timeout_at.to_rfc3339());
    }
}

/// Print the result and exit non-zero unless the intent completed
fn report_outcome(intent: &Intent) -> Result<()> {
    match intent.state {
        IntentState::Completed => {
            if let Some(result) = &intent.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            eprintln!("\n[Intent {} completed successfully]", intent.id);
            Ok(())
        }
        IntentState::Failed | IntentState::RolledBack => {
            eprintln!(
                "\n[Intent {} {}: {}]",
                intent.id,
                intent.state,
                intent.error.as_deref().unwrap_or("no error recorded")
            );
            std::process::exit(1);
        }
        _ => {
            eprintln!("\n[Intent {} in state: {}]", intent.id, intent.state);
            Ok(())
        }
    }
}

fn show_status(orchestrator: &Orchestrator, intent_id: Uuid) -> Result<()> {
    let intent = orchestrator.get(intent_id)?;
    let steps = orchestrator.steps(intent_id)?;

    print_summary(&intent);
    println!("Actor:       {}", intent.actor.principal());
    println!("Correlation: {}", intent.correlation_id);
    println!("Created:     {}", intent.created_at.to_rfc3339());
    if let Some(completed) = intent.completed_at {
        println!("Finished:    {}", completed.to_rfc3339());
    }
    if let Some(error) = &intent.error {
        println!("Error:       {}", error);
    }
    println!("Current step: {}", intent.current_step);

    println!();
    println!("{:<4} {:<32} {:<12} {:<12} {:<8}", "SEQ", "ACTION", "STATUS", "DECISION", "ATTEMPTS");
    println!("{}", "-".repeat(72));
    for step in steps {
        println!(
            "{:<4} {:<32} {:<12} {:<12} {}/{}",
            step.sequence_num,
            step.action,
            step.status.as_str(),
            step.policy_decision.map(|d| d.as_str()).unwrap_or("-"),
            step.attempt_count,
            step.max_attempts
        );
    }

    let children = orchestrator.children(intent_id)?;
    if !children.is_empty() {
        println!();
        println!("Nested intents:");
        for child in children {
            println!("  {}  {}  {}", child.id, child.template_name, child.state);
        }
    }

    Ok(())
}

fn show_history(orchestrator: &Orchestrator, intent_id: Uuid) -> Result<()> {
    let events = orchestrator.history(intent_id)?;

    println!("{:<32} {:<20} {:<5} {:<28} {}", "WHEN", "EVENT", "STEP", "TRANSITION", "ACTOR");
    println!("{}", "-".repeat(110));
    for event in events {
        let transition = match &event.previous_state {
            Some(previous) => format!("{} -> {}", previous, event.new_state),
            None => event.new_state.clone(),
        };
        println!(
            "{:<32} {:<20} {:<5} {:<28} {}",
            event.occurred_at.to_rfc3339(),
            event.event_type.as_str(),
            event.step_sequence.map(|s| s.to_string()).unwrap_or_default(),
            transition,
            event.actor
        );
        if let Some(detail) = &event.detail {
            println!("    {}", detail);
        }
    }
    Ok(())
}
