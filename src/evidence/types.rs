//! Evidence data types
//!
//! Typed in-memory model for the evidence attached to a policy decision.
//! The JSON form exchanged with the policy evaluator and stored in the
//! ledger is [`WireEvidence`](super::codec::WireEvidence).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::WireEvidence;

/// Claims and asserted facts presented for one evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvidence", try_from = "WireEvidence")]
pub struct Evidence {
    /// Claims presented by the caller
    pub claims: Vec<Claim>,

    /// Facts the caller asserts, in assertion order
    pub facts: Vec<Fact>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert a fact without supporting evidence
    pub fn assert(mut self, name: impl Into<String>) -> Self {
        self.facts.push(Fact {
            name: name.into(),
            evidence: None,
        });
        self
    }

    /// Assert a fact backed by evidence
    pub fn assert_with(mut self, name: impl Into<String>, evidence: FactEvidence) -> Self {
        self.facts.push(Fact {
            name: name.into(),
            evidence: Some(evidence),
        });
        self
    }

    /// Present a claim
    pub fn claim(mut self, claim: Claim) -> Self {
        self.claims.push(claim);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.facts.is_empty()
    }

    /// Asserted fact names in order
    pub fn asserted_facts(&self) -> Vec<&str> {
        self.facts.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn fact(&self, name: &str) -> Option<&Fact> {
        self.facts.iter().find(|f| f.name == name)
    }
}

/// A fact the caller claims is true
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub name: String,
    pub evidence: Option<FactEvidence>,
}

/// Supporting structure for an asserted fact.
///
/// Kinds this crate does not know are preserved as `Unknown` so newer
/// producers can add kinds without breaking older readers.
#[derive(Debug, Clone, PartialEq)]
pub enum FactEvidence {
    /// A document, optionally pinned by content hash
    Document {
        uri: String,
        sha256: Option<String>,
    },

    /// A statement signed off by an issuer
    Attestation {
        issuer: String,
        statement: String,
        issued_at: Option<DateTime<Utc>>,
    },

    /// Something a system observed directly
    Observation {
        source: String,
        observed_at: DateTime<Utc>,
        value: serde_json::Value,
    },

    /// A prior ledger event that established the fact
    LedgerReference { ledger_event_id: Uuid },

    /// An evidence kind from a newer producer
    Unknown {
        kind: String,
        payload: serde_json::Value,
    },
}

impl FactEvidence {
    /// The `kind` tag used on the wire
    pub fn kind(&self) -> &str {
        match self {
            Self::Document { .. } => "document",
            Self::Attestation { .. } => "attestation",
            Self::Observation { .. } => "observation",
            Self::LedgerReference { .. } => "ledger_reference",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }
}

/// A claim object presented for evaluation (e.g. a token claim)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Claim {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            issuer: None,
            value,
            expires_at: None,
        }
    }

    pub fn issued_by(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}
