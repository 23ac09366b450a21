//! Evidence codec
//!
//! Converts between the typed [`Evidence`] model and the loosely-typed
//! wire form (`asserted_facts`, `fact_evidence`, `claims`), validating and
//! normalizing on the way in.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::types::{Claim, Evidence, Fact, FactEvidence};

/// Errors raised while decoding evidence
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvidenceError {
    #[error("asserted fact at position {position} has an empty name")]
    EmptyFactName { position: usize },

    #[error("fact_evidence references '{fact}', which is not an asserted fact")]
    UnassertedFact { fact: String },

    #[error("evidence for fact '{fact}' must be an object with a 'kind' field")]
    MissingKind { fact: String },

    #[error("evidence for fact '{fact}' is not a valid '{kind}': {reason}")]
    Malformed {
        fact: String,
        kind: String,
        reason: String,
    },

    #[error("claim at position {position} has an empty name")]
    EmptyClaimName { position: usize },
}

/// Evidence as exchanged with the policy evaluator and stored in the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEvidence {
    #[serde(default)]
    pub asserted_facts: Vec<String>,

    #[serde(default)]
    pub fact_evidence: BTreeMap<String, Value>,

    #[serde(default)]
    pub claims: Vec<Claim>,
}

#[derive(Serialize, Deserialize)]
struct DocumentBody {
    uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AttestationBody {
    issuer: String,
    statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issued_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ObservationBody {
    source: String,
    observed_at: DateTime<Utc>,
    #[serde(default)]
    value: Value,
}

#[derive(Serialize, Deserialize)]
struct LedgerReferenceBody {
    ledger_event_id: Uuid,
}

/// Encode typed evidence into its wire form
pub fn encode(evidence: &Evidence) -> WireEvidence {
    let mut fact_evidence = BTreeMap::new();
    for fact in &evidence.facts {
        if let Some(ref ev) = fact.evidence {
            fact_evidence.insert(fact.name.clone(), encode_fact_evidence(ev));
        }
    }

    WireEvidence {
        asserted_facts: evidence.facts.iter().map(|f| f.name.clone()).collect(),
        fact_evidence,
        claims: evidence.claims.clone(),
    }
}

/// Decode, validate and normalize wire evidence
pub fn decode(wire: WireEvidence) -> Result<Evidence, EvidenceError> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(wire.asserted_facts.len());

    for (position, raw) in wire.asserted_facts.iter().enumerate() {
        let name = raw.trim();
        if name.is_empty() {
            return Err(EvidenceError::EmptyFactName { position });
        }
        if !seen.insert(name.to_string()) {
            warn!(fact = %name, "Duplicate asserted fact dropped");
            continue;
        }
        names.push(name.to_string());
    }

    let mut evidence_by_fact = BTreeMap::new();
    for (raw_name, value) in wire.fact_evidence {
        let name = raw_name.trim().to_string();
        if !seen.contains(&name) {
            return Err(EvidenceError::UnassertedFact { fact: name });
        }
        let decoded = decode_fact_evidence(&name, value)?;
        evidence_by_fact.insert(name, decoded);
    }

    let facts = names
        .into_iter()
        .map(|name| {
            let evidence = evidence_by_fact.remove(&name);
            Fact { name, evidence }
        })
        .collect();

    for (position, claim) in wire.claims.iter().enumerate() {
        if claim.name.trim().is_empty() {
            return Err(EvidenceError::EmptyClaimName { position });
        }
    }

    Ok(Evidence {
        claims: wire.claims,
        facts,
    })
}

/// Run typed evidence through the codec rules before it is stored
///
/// Names are trimmed and duplicate facts collapse, so what comes back is
/// exactly what a later read will decode.
pub fn normalize(evidence: &Evidence) -> Result<Evidence, EvidenceError> {
    decode(encode(evidence))
}

fn encode_fact_evidence(evidence: &FactEvidence) -> Value {
    let body = match evidence {
        FactEvidence::Document { uri, sha256 } => serde_json::to_value(DocumentBody {
            uri: uri.clone(),
            sha256: sha256.clone(),
        }),
        FactEvidence::Attestation {
            issuer,
            statement,
            issued_at,
        } => serde_json::to_value(AttestationBody {
            issuer: issuer.clone(),
            statement: statement.clone(),
            issued_at: *issued_at,
        }),
        FactEvidence::Observation {
            source,
            observed_at,
            value,
        } => serde_json::to_value(ObservationBody {
            source: source.clone(),
            observed_at: *observed_at,
            value: value.clone(),
        }),
        FactEvidence::LedgerReference { ledger_event_id } => {
            serde_json::to_value(LedgerReferenceBody {
                ledger_event_id: *ledger_event_id,
            })
        }
        FactEvidence::Unknown { payload, .. } => Ok(payload.clone()),
    };

    let mut object = match body {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other);
            map
        }
        Err(_) => Map::new(),
    };
    object.insert("kind".to_string(), Value::String(evidence.kind().to_string()));
    Value::Object(object)
}

fn decode_fact_evidence(fact: &str, value: Value) -> Result<FactEvidence, EvidenceError> {
    let Value::Object(mut object) = value else {
        return Err(EvidenceError::MissingKind {
            fact: fact.to_string(),
        });
    };

    let kind = match object.remove("kind") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        _ => {
            return Err(EvidenceError::MissingKind {
                fact: fact.to_string(),
            })
        }
    };

    let body = Value::Object(object);
    let malformed = |e: serde_json::Error| EvidenceError::Malformed {
        fact: fact.to_string(),
        kind: kind.clone(),
        reason: e.to_string(),
    };

    match kind.as_str() {
        "document" => {
            let b: DocumentBody = serde_json::from_value(body).map_err(malformed)?;
            Ok(FactEvidence::Document {
                uri: b.uri,
                sha256: b.sha256,
            })
        }
        "attestation" => {
            let b: AttestationBody = serde_json::from_value(body).map_err(malformed)?;
            Ok(FactEvidence::Attestation {
                issuer: b.issuer,
                statement: b.statement,
                issued_at: b.issued_at,
            })
        }
        "observation" => {
            let b: ObservationBody = serde_json::from_value(body).map_err(malformed)?;
            Ok(FactEvidence::Observation {
                source: b.source,
                observed_at: b.observed_at,
                value: b.value,
            })
        }
        "ledger_reference" => {
            let b: LedgerReferenceBody = serde_json::from_value(body).map_err(malformed)?;
            Ok(FactEvidence::LedgerReference {
                ledger_event_id: b.ledger_event_id,
            })
        }
        _ => Ok(FactEvidence::Unknown {
            kind: kind.clone(),
            payload: body,
        }),
    }
}

impl From<Evidence> for WireEvidence {
    fn from(evidence: Evidence) -> Self {
        encode(&evidence)
    }
}

impl TryFrom<WireEvidence> for Evidence {
    type Error = EvidenceError;

    fn try_from(wire: WireEvidence) -> Result<Self, Self::Error> {
        decode(wire)
    }
}
