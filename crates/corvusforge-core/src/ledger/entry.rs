//! Ledger entry and anchor records.
//!
//! Entries are sealed value types: a draft carries the caller's fields and
//! [`EntryDraft::seal`] finalizes the chain link, timestamp, and entry hash
//! in one step. There is no mutable record with a separate seal call to
//! forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{ProviderChain, TrustContext, TRUST_CONTEXT_VERSION};
use crate::hasher::{CanonicalError, canonical_bytes, compute_entry_hash, sha256_hex};
use crate::stage::StageState;
use crate::timefmt;
use crate::versioning::VersionPin;

/// A stage state transition, recorded as `from->to` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// The state the stage left.
    pub from: StageState,

    /// The state the stage entered.
    pub to: StageState,
}

impl StateTransition {
    /// Creates a transition record.
    #[must_use]
    pub const fn new(from: StageState, to: StageState) -> Self {
        Self { from, to }
    }
}

impl std::fmt::Display for StateTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

impl std::str::FromStr for StateTransition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once("->")
            .ok_or_else(|| format!("malformed state transition: {s}"))?;
        Ok(Self {
            from: from.parse()?,
            to: to.parse()?,
        })
    }
}

impl Serialize for StateTransition {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StateTransition {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(de)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller-side fields of a ledger entry, before sealing.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    /// Unique entry identifier, generated at draft creation.
    pub entry_id: String,

    /// The run this entry belongs to.
    pub run_id: String,

    /// The stage that transitioned.
    pub stage_id: String,

    /// The transition being recorded.
    pub state_transition: StateTransition,

    /// SHA-256 of canonical stage inputs, or empty.
    pub input_hash: String,

    /// SHA-256 of canonical stage outputs, or empty.
    pub output_hash: String,

    /// Content addresses of artifacts produced by this transition.
    pub artifact_refs: Vec<String>,

    /// Content addresses of waivers that authorized this transition.
    pub waiver_refs: Vec<String>,

    /// Fingerprints of the trust roots active at write time.
    pub trust_context: TrustContext,

    /// SHA-256 of the canonical stage-specific payload, or empty.
    pub payload_hash: String,

    /// Versions active when the entry was written.
    pub version_pin: VersionPin,
}

impl EntryDraft {
    /// Creates a draft for a transition with a fresh entry identifier.
    #[must_use]
    pub fn new(run_id: &str, stage_id: &str, state_transition: StateTransition) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            stage_id: stage_id.to_string(),
            state_transition,
            input_hash: String::new(),
            output_hash: String::new(),
            artifact_refs: Vec::new(),
            waiver_refs: Vec::new(),
            trust_context: TrustContext::default(),
            payload_hash: String::new(),
            version_pin: VersionPin::default(),
        }
    }

    /// Seals the draft into an immutable [`LedgerEntry`].
    ///
    /// The ledger supplies the chain link and the (monotonic) timestamp;
    /// the entry hash is computed here as part of finalization.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be canonicalized.
    pub fn seal(
        self,
        previous_entry_hash: String,
        timestamp_utc: DateTime<Utc>,
    ) -> Result<LedgerEntry, CanonicalError> {
        let mut entry = LedgerEntry {
            entry_id: self.entry_id,
            run_id: self.run_id,
            stage_id: self.stage_id,
            state_transition: self.state_transition,
            timestamp_utc,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            artifact_refs: self.artifact_refs,
            pipeline_version: self.version_pin.pipeline_version,
            schema_version: self.version_pin.schema_version,
            toolchain_version: self.version_pin.toolchain_version,
            ruleset_versions: self.version_pin.ruleset_versions,
            waiver_refs: self.waiver_refs,
            trust_context: self.trust_context,
            trust_context_version: TRUST_CONTEXT_VERSION.to_string(),
            payload_hash: self.payload_hash,
            previous_entry_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }
}

/// One sealed entry in the append-only run ledger.
///
/// The monitor and dashboards are projections of these entries; they do
/// not compute truth, they display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub entry_id: String,

    /// The run this entry belongs to.
    pub run_id: String,

    /// The stage that transitioned.
    pub stage_id: String,

    /// The recorded transition, `from->to`.
    pub state_transition: StateTransition,

    /// UTC timestamp, microsecond precision, monotonic per run.
    #[serde(with = "timefmt::iso_micros")]
    pub timestamp_utc: DateTime<Utc>,

    /// SHA-256 of canonical stage inputs, or empty.
    pub input_hash: String,

    /// SHA-256 of canonical stage outputs, or empty.
    pub output_hash: String,

    /// Content addresses of artifacts produced by this transition.
    pub artifact_refs: Vec<String>,

    /// Pipeline release version at write time.
    pub pipeline_version: String,

    /// Ledger schema version at write time.
    pub schema_version: String,

    /// Implementation toolchain identifier at write time.
    pub toolchain_version: String,

    /// Active ruleset versions at write time.
    pub ruleset_versions: std::collections::BTreeMap<String, String>,

    /// Content addresses of waivers that authorized this transition.
    pub waiver_refs: Vec<String>,

    /// Fingerprints of the trust roots active at write time.
    pub trust_context: TrustContext,

    /// Trust-context schema version.
    pub trust_context_version: String,

    /// SHA-256 of the canonical stage-specific payload, or empty.
    pub payload_hash: String,

    /// `entry_hash` of the previous entry in this run; empty for the first.
    pub previous_entry_hash: String,

    /// SHA-256 over canonical JSON of every other field. Seals the entry.
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Recomputes the entry hash from the entry's own fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be canonicalized.
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        let value = serde_json::to_value(self)?;
        compute_entry_hash(&value)
    }
}

/// An externally witnessable checkpoint of a run's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    /// The anchored run.
    pub run_id: String,

    /// Number of entries the chain held at anchor time.
    pub entry_count: u64,

    /// `entry_hash` of the final entry, or empty for an empty run.
    pub root_hash: String,

    /// `entry_hash` of the first entry, or empty for an empty run.
    pub first_entry_hash: String,

    /// When the anchor was exported.
    #[serde(with = "timefmt::iso_micros")]
    pub timestamp_utc: DateTime<Utc>,

    /// SHA-256 over canonical JSON of the other fields.
    pub anchor_hash: String,
}

impl LedgerAnchor {
    /// Builds and seals an anchor, computing `anchor_hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be canonicalized.
    pub fn build(
        run_id: &str,
        entry_count: u64,
        root_hash: &str,
        first_entry_hash: &str,
    ) -> Result<Self, CanonicalError> {
        let mut anchor = Self {
            run_id: run_id.to_string(),
            entry_count,
            root_hash: root_hash.to_string(),
            first_entry_hash: first_entry_hash.to_string(),
            timestamp_utc: timefmt::now_utc_micros(),
            anchor_hash: String::new(),
        };
        anchor.anchor_hash = anchor.compute_hash()?;
        Ok(anchor)
    }

    /// Recomputes the anchor hash from the anchor's own fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be canonicalized.
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("anchor_hash");
        }
        Ok(sha256_hex(&canonical_bytes(&value)?))
    }

    /// Canonical bytes signed by [`SignedAnchor`]: the full anchor record,
    /// including `anchor_hash`, excluding any signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be canonicalized.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&serde_json::to_value(self)?)
    }
}

/// An anchor plus an Ed25519 signature from the anchor key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAnchor {
    /// The anchored checkpoint.
    pub anchor: LedgerAnchor,

    /// Hex-encoded Ed25519 signature over the anchor's canonical bytes.
    pub signature: String,

    /// Hex-encoded public key the signature verifies under.
    pub anchor_key_public_hex: String,
}

impl SignedAnchor {
    /// Verifies the signature over the anchor's canonical bytes.
    ///
    /// Fail-closed: any canonicalization failure or crypto absence is an
    /// unverified anchor.
    #[must_use]
    pub fn verify(&self, chain: &ProviderChain) -> bool {
        let Ok(bytes) = self.anchor.signable_bytes() else {
            return false;
        };
        chain.verify_data(&bytes, &self.signature, &self.anchor_key_public_hex)
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_transition_wire_form() {
        let t = StateTransition::new(StageState::NotStarted, StageState::Running);
        assert_eq!(t.to_string(), "not_started->running");
        assert_eq!("not_started->running".parse::<StateTransition>().unwrap(), t);
        assert!("passed".parse::<StateTransition>().is_err());
    }

    #[test]
    fn test_seal_computes_entry_hash() {
        let draft = EntryDraft::new(
            "run-1",
            "s0_intake",
            StateTransition::new(StageState::NotStarted, StageState::Running),
        );
        let entry = draft
            .seal(String::new(), timefmt::now_utc_micros())
            .unwrap();
        assert_eq!(entry.entry_hash.len(), 64);
        assert_eq!(entry.compute_hash().unwrap(), entry.entry_hash);
        assert_eq!(entry.trust_context_version, TRUST_CONTEXT_VERSION);
    }

    #[test]
    fn test_field_mutation_changes_hash() {
        let draft = EntryDraft::new(
            "run-1",
            "s0_intake",
            StateTransition::new(StageState::NotStarted, StageState::Running),
        );
        let entry = draft
            .seal(String::new(), timefmt::now_utc_micros())
            .unwrap();

        let mut mutated = entry.clone();
        mutated.payload_hash = "f".repeat(64);
        assert_ne!(mutated.compute_hash().unwrap(), entry.entry_hash);
    }

    #[test]
    fn test_anchor_hash_seals_fields() {
        let anchor = LedgerAnchor::build("run-1", 3, "root", "first").unwrap();
        assert_eq!(anchor.compute_hash().unwrap(), anchor.anchor_hash);

        let mut mutated = anchor.clone();
        mutated.entry_count = 2;
        assert_ne!(mutated.compute_hash().unwrap(), anchor.anchor_hash);
    }

    #[test]
    fn test_empty_run_anchor_hash_computed() {
        let anchor = LedgerAnchor::build("run-1", 0, "", "").unwrap();
        assert_eq!(anchor.entry_count, 0);
        assert!(!anchor.anchor_hash.is_empty());
    }

    #[test]
    fn test_signed_anchor_roundtrip() {
        let chain = ProviderChain::probe();
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();

        let anchor = LedgerAnchor::build("run-1", 1, "root", "first").unwrap();
        let signature = chain
            .sign_data(&anchor.signable_bytes().unwrap(), &private_hex)
            .unwrap();
        let signed = SignedAnchor {
            anchor,
            signature,
            anchor_key_public_hex: public_hex,
        };
        assert!(signed.verify(&chain));

        let mut forged = signed.clone();
        forged.anchor.entry_count = 99;
        assert!(!forged.verify(&chain));
    }

    #[test]
    fn test_entry_serde_roundtrip_preserves_hash() {
        let draft = EntryDraft::new(
            "run-1",
            "s1_prerequisites",
            StateTransition::new(StageState::Running, StageState::Passed),
        );
        let entry = draft
            .seal("prev-hash".to_string(), timefmt::now_utc_micros())
            .unwrap();

        let json = serde_json::to_string(&entry).unwrap();
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.compute_hash().unwrap(), entry.entry_hash);
    }
}
