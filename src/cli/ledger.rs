//! Ledger CLI subcommands.
//!
//! Provides commands to:
//! - `events`: query the ledger (`GET /ledger/events` semantics)
//! - `append`: record an event from a JSON body (`POST /ledger/event`)
//! - `review`: list recent non-allow decisions for compliance review
//! - `stats`: decision counts

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Subcommand;

use crate::api::{LedgerApi, LedgerEventsQuery};
use crate::domain::LedgerEvent;

/// Ledger-related subcommands
#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// Query ledger events
    Events {
        #[arg(long)]
        correlation_id: Option<String>,

        #[arg(long)]
        intent_id: Option<String>,

        /// Filter by actor user id
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        action: Option<String>,

        /// allow | deny | warn | shadow_deny
        #[arg(long)]
        decision: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Append an event from a JSON file (reads stdin if omitted)
    Append {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Recent deny/warn/shadow_deny decisions
    Review {
        /// Look back this many hours
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Decision counts
    Stats {
        /// Restrict to one correlation chain
        #[arg(long)]
        correlation_id: Option<String>,
    },
}

/// Execute ledger subcommands
pub async fn execute(command: LedgerCommands) -> Result<()> {
    let ctx = super::open_context()?;
    let api = LedgerApi::new(ctx.recorder.clone());

    match command {
        LedgerCommands::Events {
            correlation_id,
            intent_id,
            user,
            action,
            decision,
            limit,
            offset,
            json,
        } => {
            let response = api.get_events(LedgerEventsQuery {
                correlation_id,
                intent_id,
                actor_user_id: user,
                action,
                decision,
                limit: Some(limit),
                offset: Some(offset),
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            print_events(&response.events);
            println!("\n{} of {} event(s)", response.events.len(), response.total);
            Ok(())
        }
        LedgerCommands::Append { input } => {
            let body = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read event file: {}", path.display()))?,
                None => {
                    let mut buffer = String::new();
                    io::stdin()
                        .read_to_string(&mut buffer)
                        .context("Failed to read from stdin")?;
                    buffer
                }
            };

            let event = api.post_event_json(&body)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        LedgerCommands::Review { hours, limit } => {
            let since = Utc::now() - ChronoDuration::hours(hours.max(0));
            let events = ctx.ledger.compliance_review(Some(since), limit)?;
            if events.is_empty() {
                println!("No flagged decisions in the last {}h", hours);
                return Ok(());
            }
            print_events(&events);
            Ok(())
        }
        LedgerCommands::Stats { correlation_id } => {
            let correlation_id = match correlation_id {
                Some(raw) => Some(super::intent::parse_id(&raw)?),
                None => None,
            };
            let counts = ctx.ledger.decision_counts(correlation_id)?;
            println!("allow:       {}", counts.allow);
            println!("deny:        {}", counts.deny);
            println!("warn:        {}", counts.warn);
            println!("shadow_deny: {}", counts.shadow_deny);
            println!("total:       {}", counts.total());
            Ok(())
        }
    }
}

fn print_events(events: &[LedgerEvent]) {
    println!(
        "{:<26} {:<4} {:<28} {:<12} {:<20} {}",
        "OCCURRED", "SEQ", "ACTION", "DECISION", "ACTOR", "POLICY"
    );
    println!("{}", "-".repeat(110));
    for event in events {
        println!(
            "{:<26} {:<4} {:<28} {:<12} {:<20} {}",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.sequence_num,
            event.action,
            event.decision.as_str(),
            event.actor.principal(),
            event.policy_id.as_deref().unwrap_or("(default)")
        );
    }
}
