//! Evidence attached to policy decisions
//!
//! Every governed action carries the claims and asserted facts it was
//! evaluated against. This module provides a typed model for them and the
//! codec that validates the loosely-typed JSON form used on the wire and in
//! the ledger.
//!
//! # Design Principles
//!
//! - **Typed kinds**: known evidence kinds are enum variants, unknown kinds
//!   are kept verbatim in `FactEvidence::Unknown`.
//! - **Ordered facts**: assertion order is preserved; duplicates collapse.
//! - **Closed references**: evidence may only support facts that were
//!   actually asserted.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, normalize, EvidenceError, WireEvidence};
pub use types::{Claim, Evidence, Fact, FactEvidence};
