//! Versioned intent template registry.
//!
//! Templates live in memory behind an `RwLock` and are written through to
//! `intent_templates` when the registry is backed by a database. A
//! `(name, version)` pair is immutable once registered.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::domain::IntentTemplate;
use crate::error::{GovernanceError, GovernanceResult};

use super::db::{format_ts, Database, StoreError};

type TemplateKey = (String, u32);

/// Holds every registered template version
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<BTreeMap<TemplateKey, Arc<IntentTemplate>>>,
    db: Option<Database>,
}

impl TemplateRegistry {
    /// In-memory registry (nothing persisted)
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by `db`, pre-loaded with every stored template
    pub fn load(db: Database) -> GovernanceResult<Self> {
        let rows: Vec<(String, u32, String)> = {
            let conn = db.lock()?;
            let mut stmt = conn
                .prepare("SELECT name, version, definition FROM intent_templates")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            rows
        };

        let mut templates = BTreeMap::new();
        for (name, version, definition) in rows {
            let template: IntentTemplate =
                serde_json::from_str(&definition).map_err(|e| StoreError::Corrupt {
                    table: "intent_templates",
                    details: format!("{} v{}: {}", name, version, e),
                })?;
            templates.insert((name, version), Arc::new(template));
        }
        debug!(count = templates.len(), "Loaded intent templates");

        Ok(Self {
            templates: RwLock::new(templates),
            db: Some(db),
        })
    }

    /// Register a template version.
    ///
    /// Re-registering an identical definition is a no-op; a different
    /// definition under an existing `(name, version)` is a conflict.
    pub fn register(&self, template: IntentTemplate) -> GovernanceResult<Arc<IntentTemplate>> {
        template.validate().map_err(GovernanceError::InvalidTemplate)?;

        let key = (template.name.clone(), template.version);
        if let Some(existing) = self.lookup(&key)? {
            return same_or_conflict(existing, &template);
        }

        // No registry lock is held across the database write
        if let Some(ref db) = self.db {
            persist(db, &template)?;
        }

        let mut templates = self.templates.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = templates.get(&key) {
            // Another caller registered the same key while we persisted
            return same_or_conflict(existing.clone(), &template);
        }

        info!(template = %template.name, version = template.version, steps = template.steps.len(), "Registered intent template");
        let template = Arc::new(template);
        templates.insert(key, template.clone());
        Ok(template)
    }

    fn lookup(&self, key: &TemplateKey) -> GovernanceResult<Option<Arc<IntentTemplate>>> {
        let templates = self.templates.read().map_err(|_| StoreError::Poisoned)?;
        Ok(templates.get(key).cloned())
    }

    /// Fetch a specific version, or the highest one when `version` is `None`
    pub fn get(&self, name: &str, version: Option<u32>) -> GovernanceResult<Arc<IntentTemplate>> {
        let templates = self.templates.read().map_err(|_| StoreError::Poisoned)?;

        let found = match version {
            Some(v) => templates.get(&(name.to_string(), v)).cloned(),
            None => templates
                .range((name.to_string(), 0)..=(name.to_string(), u32::MAX))
                .next_back()
                .map(|(_, t)| t.clone()),
        };

        found.ok_or_else(|| GovernanceError::TemplateNotFound {
            name: name.to_string(),
            version,
        })
    }

    /// Every registered version, ordered by name then version
    pub fn list(&self) -> GovernanceResult<Vec<Arc<IntentTemplate>>> {
        let templates = self.templates.read().map_err(|_| StoreError::Poisoned)?;
        Ok(templates.values().cloned().collect())
    }
}

fn same_or_conflict(
    existing: Arc<IntentTemplate>,
    template: &IntentTemplate,
) -> GovernanceResult<Arc<IntentTemplate>> {
    if *existing == *template {
        Ok(existing)
    } else {
        Err(GovernanceError::Conflict {
            name: template.name.clone(),
            version: template.version,
        })
    }
}

/// Write-through; a row written by another process must match exactly
fn persist(db: &Database, template: &IntentTemplate) -> GovernanceResult<()> {
    let definition = serde_json::to_string(template).map_err(StoreError::from)?;
    let conn = db.lock()?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT definition FROM intent_templates WHERE name = ?1 AND version = ?2",
            params![template.name, template.version],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)?;

    match stored {
        Some(existing) => {
            let existing: IntentTemplate =
                serde_json::from_str(&existing).map_err(StoreError::from)?;
            if existing != *template {
                return Err(GovernanceError::Conflict {
                    name: template.name.clone(),
                    version: template.version,
                });
            }
        }
        None => {
            conn.execute(
                "INSERT INTO intent_templates (name, version, definition, registered_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![template.name, template.version, definition, format_ts(Utc::now())],
            )
            .map_err(StoreError::from)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TemplateStep;

    fn template(version: u32, actions: &[&str]) -> IntentTemplate {
        IntentTemplate {
            name: "grading".to_string(),
            version,
            description: String::new(),
            policy_scope: "experience:lms".to_string(),
            resource_type: "assignment".to_string(),
            steps: actions
                .iter()
                .enumerate()
                .map(|(i, a)| TemplateStep::new(i as u32 + 1, *a))
                .collect(),
            rollback_on_failure: Vec::new(),
            compensations: Default::default(),
            timeout_seconds: None,
            retry_policy: Default::default(),
        }
    }

    #[test]
    fn test_register_is_idempotent_for_identical_definition() {
        let registry = TemplateRegistry::new();
        registry.register(template(1, &["assignment:grade"])).unwrap();
        registry.register(template(1, &["assignment:grade"])).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_conflicting_definition_rejected() {
        let registry = TemplateRegistry::new();
        registry.register(template(1, &["assignment:grade"])).unwrap();
        let err = registry
            .register(template(1, &["assignment:grade", "assignment:publish"]))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Conflict { version: 1, .. }));
    }

    #[test]
    fn test_get_latest_version() {
        let registry = TemplateRegistry::new();
        registry.register(template(1, &["assignment:grade"])).unwrap();
        registry.register(template(3, &["assignment:grade", "assignment:publish"])).unwrap();
        registry.register(template(2, &["assignment:publish"])).unwrap();

        assert_eq!(registry.get("grading", None).unwrap().version, 3);
        assert_eq!(registry.get("grading", Some(2)).unwrap().version, 2);
        assert!(matches!(
            registry.get("grading", Some(9)),
            Err(GovernanceError::TemplateNotFound { version: Some(9), .. })
        ));
        assert!(registry.get("onboarding", None).is_err());
    }

    #[test]
    fn test_invalid_template_rejected() {
        let registry = TemplateRegistry::new();
        let mut bad = template(1, &["assignment:grade", "assignment:publish"]);
        bad.steps[1].sequence = 3;
        assert!(matches!(
            registry.register(bad),
            Err(GovernanceError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_write_through_and_reload() {
        let db = Database::in_memory().unwrap();
        let registry = TemplateRegistry::load(db.clone()).unwrap();
        registry.register(template(1, &["assignment:grade"])).unwrap();

        let reloaded = TemplateRegistry::load(db.clone()).unwrap();
        assert_eq!(reloaded.get("grading", Some(1)).unwrap().steps.len(), 1);

        // A second process registering a different v1 hits the stored row
        let fresh = TemplateRegistry {
            templates: RwLock::new(BTreeMap::new()),
            db: Some(db),
        };
        assert!(matches!(
            fresh.register(template(1, &["assignment:publish"])),
            Err(GovernanceError::Conflict { .. })
        ));
    }
}
