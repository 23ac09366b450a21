//! Configuration for govflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GOVFLOW_HOME, GOVFLOW_DATABASE, GOVFLOW_POLICY_URL)
//! 2. Config file (.govflow/config.yaml)
//! 3. Defaults (~/.govflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .govflow/config.yaml
//! - Paths in config file are relative to the .govflow/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::CommandSpec;
use crate::core::OrchestratorSettings;
use crate::domain::DEFAULT_TIMEOUT_SECONDS;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".govflow";
const DATABASE_FILE: &str = "govflow.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Action → subprocess executor
    #[serde(default)]
    pub executors: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .govflow/)
    pub home: Option<String>,
    /// SQLite database file (relative to .govflow/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// Base URL of the policy evaluator
    pub url: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Local rule table used when no URL is configured
    pub rules_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub host: Option<String>,
    pub service: Option<String>,
    pub default_timeout_seconds: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

/// Where policy decisions come from
#[derive(Debug, Clone, PartialEq)]
pub enum PolicySource {
    /// Remote evaluator at `{url}/policy/evaluate`
    Http { url: String, timeout: Duration },

    /// Local YAML rule table
    Rules(PathBuf),

    /// Nothing configured: every action is denied
    DenyAll,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to govflow home (state)
    pub home: PathBuf,
    /// Absolute path to the SQLite database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub policy: PolicySource,
    pub orchestrator: OrchestratorSettings,
    pub sweep_interval: Duration,
    pub webhook_url: Option<String>,
    pub executors: BTreeMap<String, CommandSpec>,
}

const DEFAULT_POLICY_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Load configuration from all sources, discovering the file from `start`
fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file(start);
    let config = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // Relative paths in the file resolve against .govflow/
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = match (env_var("GOVFLOW_HOME"), &config.paths.home, &config_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        (None, None, Some(dir)) => dir.clone(),
        _ => default_home,
    };

    let database = match (env_var("GOVFLOW_DATABASE"), &config.paths.database, &config_dir) {
        (Some(env_db), _, _) => PathBuf::from(env_db),
        (None, Some(db), Some(dir)) => resolve_path(dir, db),
        _ => home.join(DATABASE_FILE),
    };

    let policy_timeout = Duration::from_secs(
        config
            .policy
            .timeout_seconds
            .unwrap_or(DEFAULT_POLICY_TIMEOUT_SECONDS),
    );
    let policy = match (
        env_var("GOVFLOW_POLICY_URL"),
        config.policy.url.clone(),
        &config.policy.rules_file,
    ) {
        (Some(url), _, _) | (None, Some(url), _) => PolicySource::Http {
            url,
            timeout: policy_timeout,
        },
        (None, None, Some(rules)) => {
            let base = config_dir.clone().unwrap_or_else(|| home.clone());
            PolicySource::Rules(resolve_path(&base, rules))
        }
        (None, None, None) => {
            let local = home.join("policy.yaml");
            if local.exists() {
                PolicySource::Rules(local)
            } else {
                PolicySource::DenyAll
            }
        }
    };

    let defaults = OrchestratorSettings::default();
    let orchestrator = OrchestratorSettings {
        host: config.orchestrator.host.clone().unwrap_or(defaults.host),
        service: config.orchestrator.service.clone().unwrap_or(defaults.service),
        default_timeout_seconds: config
            .orchestrator
            .default_timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
    };

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        policy,
        orchestrator,
        sweep_interval: Duration::from_secs(
            config
                .orchestrator
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS)
                .max(1),
        ),
        webhook_url: config.notifications.webhook_url,
        executors: config.executors,
    })
}

fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the govflow home directory
pub fn govflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
