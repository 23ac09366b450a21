//! Command-line interface for govflow.
//!
//! Provides commands for registering templates, driving intents through
//! their lifecycle, running the timeout sweep and inspecting the ledger.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::{
    CommandExecutor, ExecutorRegistry, HttpPolicyEvaluator, LogNotifier, OperatorNotifier,
    PolicyEvaluator, StaticPolicyEvaluator, WebhookNotifier,
};
use crate::config::{self, PolicySource, ResolvedConfig};
use crate::core::{Database, GovernanceContext, TemplateRegistry, TimeoutSweeper};

pub mod intent;
pub mod ledger;
pub mod template;

/// govflow - Governance ledger and intent orchestrator
#[derive(Parser, Debug)]
#[command(name = "govflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage intent templates
    Template {
        #[command(subcommand)]
        command: template::TemplateCommands,
    },

    /// Create and drive intents
    Intent {
        #[command(subcommand)]
        command: intent::IntentCommands,
    },

    /// Time out overdue intents and roll them back
    Sweep {
        /// Keep sweeping at the configured interval until Ctrl-C
        #[arg(short, long)]
        watch: bool,
    },

    /// Query and append to the governance ledger
    Ledger {
        #[command(subcommand)]
        command: ledger::LedgerCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Template { command } => template::execute(command).await,
            Commands::Intent { command } => intent::execute(command).await,
            Commands::Sweep { watch } => sweep(watch).await,
            Commands::Ledger { command } => ledger::execute(command).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Open the database and wire every collaborator from the configuration
pub(crate) fn open_context() -> Result<GovernanceContext> {
    let cfg = config::config()?;
    build_context(cfg)
}

fn build_context(cfg: &ResolvedConfig) -> Result<GovernanceContext> {
    if let Some(parent) = cfg.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let db = Database::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    let templates = TemplateRegistry::load(db.clone()).context("Failed to load templates")?;

    let policy: Arc<dyn PolicyEvaluator> = match &cfg.policy {
        PolicySource::Http { url, timeout } => Arc::new(
            HttpPolicyEvaluator::new(url.clone(), *timeout)
                .context("Failed to build policy client")?,
        ),
        PolicySource::Rules(path) => Arc::new(StaticPolicyEvaluator::from_file(path)?),
        PolicySource::DenyAll => Arc::new(StaticPolicyEvaluator::deny_all()),
    };

    let mut executors = ExecutorRegistry::new();
    for (action, spec) in &cfg.executors {
        executors.register(action.clone(), Arc::new(CommandExecutor::from_spec(spec)));
    }

    let notifier: Arc<dyn OperatorNotifier> = match &cfg.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(
        GovernanceContext::new(db, Arc::new(templates), policy, executors)
            .with_notifier(notifier)
            .with_settings(cfg.orchestrator.clone()),
    )
}

/// Run the timeout sweep once, or repeatedly with `--watch`
async fn sweep(watch: bool) -> Result<()> {
    let ctx = open_context()?;
    let sweeper = TimeoutSweeper::new(ctx);

    if !watch {
        let report = sweeper.sweep_once().await?;
        if report.is_empty() {
            println!("No overdue intents");
            return Ok(());
        }
        for id in &report.timed_out {
            let outcome = if report.rolled_back.contains(id) {
                "rolled back"
            } else if report.rollback_incomplete.contains(id) {
                "ROLLBACK INCOMPLETE"
            } else {
                "timed out"
            };
            println!("{}  {}", id, outcome);
        }
        if report.skipped > 0 {
            println!("({} intent(s) changed concurrently, skipped)", report.skipped);
        }
        return Ok(());
    }

    let interval = config::config()?.sweep_interval;
    let handle = sweeper.spawn(interval);
    info!("Sweeping every {}s, press Ctrl-C to stop", interval.as_secs());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    handle.stop().await
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("govflow configuration");
    println!("=====================");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Policy:");
    match &cfg.policy {
        PolicySource::Http { url, timeout } => {
            println!("  Evaluator: {}/policy/evaluate (timeout {}s)", url.trim_end_matches('/'), timeout.as_secs())
        }
        PolicySource::Rules(path) => println!("  Rules:     {}", path.display()),
        PolicySource::DenyAll => println!("  (none configured - every action is denied)"),
    }
    println!();
    println!("Orchestrator:");
    println!("  Host:            {}", cfg.orchestrator.host);
    println!("  Service:         {}", cfg.orchestrator.service);
    println!("  Default timeout: {}s", cfg.orchestrator.default_timeout_seconds);
    println!("  Sweep interval:  {}s", cfg.sweep_interval.as_secs());
    println!();
    println!(
        "Operator alerts: {}",
        cfg.webhook_url.as_deref().unwrap_or("(log only)")
    );
    println!();
    println!("Executors:");
    if cfg.executors.is_empty() {
        println!("  (none)");
    } else {
        for (action, spec) in &cfg.executors {
            println!("  {}: {} {}", action, spec.command, spec.args.join(" "));
        }
    }

    Ok(())
}
