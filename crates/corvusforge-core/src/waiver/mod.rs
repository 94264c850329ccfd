//! Signed gate-bypass waivers.
//!
//! A waiver is a structured artifact, never an informal flag: it names a
//! scope, carries a justification and an expiry, and is signed by the
//! approving identity. In strict mode an unverifiable waiver is rejected
//! outright; in permissive mode it is stored but flagged, and
//! [`WaiverManager::has_valid_waiver`] will not count it once strict mode
//! is in force.

// Mutex poisoning and construction-time invariants are unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{ArtifactError, FsArtifactStore};
use crate::crypto::{CryptoError, ProviderChain};
use crate::hasher::{CanonicalError, canonical_bytes};
use crate::timefmt;

/// Errors from waiver registration and lookup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaiverError {
    /// The waiver's signature is missing or failed verification, and the
    /// manager is in strict mode.
    #[error(
        "waiver {waiver_id} for scope {stage_id}/{gate} has no valid signature; \
         waivers bypassing mandatory gates must be cryptographically signed"
    )]
    Signature {
        /// The rejected waiver.
        waiver_id: String,
        /// The waived stage.
        stage_id: String,
        /// The waived gate name.
        gate: String,
    },

    /// The waiver was already expired at registration time.
    #[error("waiver {waiver_id} expired at {expires_at}")]
    Expired {
        /// The rejected waiver.
        waiver_id: String,
        /// When it expired.
        expires_at: String,
    },

    /// The waiver could not be persisted to the artifact store.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// The waiver could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Signing failed while constructing a waiver.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Risk level assigned to a waiver by its approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClassification {
    /// Routine bypass, e.g. a known false positive.
    Low,
    /// Bypass with bounded impact.
    Medium,
    /// Bypass of a substantive control.
    High,
    /// Bypass that would normally halt a release.
    Critical,
}

/// What a waiver authorizes bypassing.
///
/// Waivers match on the full scope: a waiver for one gate of a stage does
/// not cover another gate of the same stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaiverScope {
    /// The gate stage being bypassed.
    pub stage_id: String,

    /// The gate name within the stage.
    pub gate: String,
}

/// A structured waiver authorizing bypass of a mandatory gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiverArtifact {
    /// Unique waiver identifier.
    pub waiver_id: String,

    /// The bypassed scope.
    pub scope: WaiverScope,

    /// Why the bypass is acceptable.
    pub justification: String,

    /// Hex-encoded public key of the approver; also the verification key.
    pub approving_identity: String,

    /// Risk level assigned by the approver.
    pub risk_classification: RiskClassification,

    /// When the waiver was issued.
    #[serde(with = "timefmt::iso_micros")]
    pub issued_at: DateTime<Utc>,

    /// When the waiver stops being valid.
    #[serde(with = "timefmt::iso_micros")]
    pub expires_at: DateTime<Utc>,

    /// Hex-encoded Ed25519 signature over the signed fields; empty until
    /// signed.
    pub signature: String,
}

impl WaiverArtifact {
    /// Creates an unsigned waiver with a fresh identifier.
    #[must_use]
    pub fn new(
        scope: WaiverScope,
        justification: &str,
        approving_identity: &str,
        risk_classification: RiskClassification,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            waiver_id: Uuid::new_v4().to_string(),
            scope,
            justification: justification.to_string(),
            approving_identity: approving_identity.to_string(),
            risk_classification,
            issued_at: timefmt::now_utc_micros(),
            expires_at,
            signature: String::new(),
        }
    }

    /// Canonical bytes of the signed fields: every field except
    /// `signature`.
    ///
    /// # Errors
    ///
    /// Returns an error if the waiver cannot be canonicalized.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("signature");
        }
        canonical_bytes(&value)
    }

    /// Returns this waiver signed with the approving identity's private
    /// key.
    ///
    /// # Errors
    ///
    /// Returns an error if canonicalization or signing fails.
    pub fn signed(
        mut self,
        chain: &ProviderChain,
        approver_private_hex: &str,
    ) -> Result<Self, WaiverError> {
        let bytes = self.signable_bytes()?;
        self.signature = chain.sign_data(&bytes, approver_private_hex)?;
        Ok(self)
    }

    /// Whether the waiver has passed its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A registered waiver: the artifact, its verification outcome, and its
/// content address in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWaiver {
    /// The registered waiver.
    pub waiver: WaiverArtifact,

    /// Whether the signature verified at registration. Set by the manager;
    /// never promoted to `true` by any other path.
    pub signature_verified: bool,

    /// Content address of the stored waiver bytes.
    pub content_address: String,
}

/// Validates, stores, and checks waivers.
///
/// Strict mode is fixed at construction: the production guard forces it in
/// production environments, and nothing can relax it afterwards.
pub struct WaiverManager {
    store: Arc<FsArtifactStore>,
    crypto: Arc<ProviderChain>,
    require_signature: bool,
    registry: Mutex<BTreeMap<WaiverScope, Vec<StoredWaiver>>>,
}

impl WaiverManager {
    /// Creates a manager.
    ///
    /// `require_signature` selects strict mode: only signature-verified
    /// waivers count, and unverifiable waivers are rejected at
    /// registration.
    #[must_use]
    pub fn new(
        store: Arc<FsArtifactStore>,
        crypto: Arc<ProviderChain>,
        require_signature: bool,
    ) -> Self {
        Self {
            store,
            crypto,
            require_signature,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether the manager is in strict mode.
    #[must_use]
    pub const fn strict(&self) -> bool {
        self.require_signature
    }

    /// Validates, verifies, and stores a waiver.
    ///
    /// # Errors
    ///
    /// Returns [`WaiverError::Expired`] for waivers already past expiry and
    /// [`WaiverError::Signature`] in strict mode when the signature cannot
    /// be verified (including when no real crypto backend is available).
    pub fn register_waiver(&self, waiver: WaiverArtifact) -> Result<StoredWaiver, WaiverError> {
        if waiver.is_expired_at(timefmt::now_utc_micros()) {
            return Err(WaiverError::Expired {
                waiver_id: waiver.waiver_id,
                expires_at: timefmt::format_iso_micros(&waiver.expires_at),
            });
        }

        let signable = waiver.signable_bytes()?;
        let signature_verified =
            self.crypto
                .verify_data(&signable, &waiver.signature, &waiver.approving_identity);

        if self.require_signature && !signature_verified {
            return Err(WaiverError::Signature {
                waiver_id: waiver.waiver_id,
                stage_id: waiver.scope.stage_id,
                gate: waiver.scope.gate,
            });
        }

        // Content address covers the full waiver, signature included.
        let waiver_bytes = canonical_bytes(&serde_json::to_value(&waiver).map_err(CanonicalError::from)?)?;
        let content_address = self.store.put(&waiver_bytes, "application/json")?;

        let stored = StoredWaiver {
            waiver,
            signature_verified,
            content_address,
        };

        if signature_verified {
            tracing::info!(
                waiver_id = %stored.waiver.waiver_id,
                stage_id = %stored.waiver.scope.stage_id,
                "registered signed waiver"
            );
        } else {
            tracing::warn!(
                waiver_id = %stored.waiver.waiver_id,
                stage_id = %stored.waiver.scope.stage_id,
                "registered UNSIGNED waiver (signature_verified=false)"
            );
        }

        let mut registry = self.registry.lock().expect("lock poisoned");
        registry
            .entry(stored.waiver.scope.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    /// Whether a non-expired, strict-mode-acceptable waiver exists for the
    /// full scope (stage and gate).
    #[must_use]
    pub fn has_valid_waiver(&self, scope: &WaiverScope, now: DateTime<Utc>) -> bool {
        self.find_valid(scope, now).is_some()
    }

    /// Returns the first valid waiver for the full scope, if any.
    #[must_use]
    pub fn find_valid(&self, scope: &WaiverScope, now: DateTime<Utc>) -> Option<StoredWaiver> {
        let registry = self.registry.lock().expect("lock poisoned");
        registry.get(scope)?.iter().find_map(|stored| {
            if stored.waiver.is_expired_at(now) {
                return None;
            }
            if self.require_signature && !stored.signature_verified {
                return None;
            }
            Some(stored.clone())
        })
    }

    /// Returns all non-expired waivers across all scopes.
    #[must_use]
    pub fn active_waivers(&self, now: DateTime<Utc>) -> Vec<StoredWaiver> {
        let registry = self.registry.lock().expect("lock poisoned");
        registry
            .values()
            .flatten()
            .filter(|stored| !stored.waiver.is_expired_at(now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod unit_tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::crypto::FailClosedProvider;

    fn fixture(strict: bool) -> (WaiverManager, Arc<ProviderChain>, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let store = Arc::new(FsArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let chain = Arc::new(ProviderChain::probe());
        let manager = WaiverManager::new(store, Arc::clone(&chain), strict);
        (manager, chain, dir)
    }

    fn future() -> DateTime<Utc> {
        timefmt::now_utc_micros() + Duration::hours(24)
    }

    fn scope(stage_id: &str, gate: &str) -> WaiverScope {
        WaiverScope {
            stage_id: stage_id.to_string(),
            gate: gate.to_string(),
        }
    }

    fn signed_waiver(chain: &ProviderChain, stage_id: &str) -> WaiverArtifact {
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();
        WaiverArtifact::new(
            WaiverScope {
                stage_id: stage_id.to_string(),
                gate: "accessibility".to_string(),
            },
            "known false positive in contrast checker",
            &public_hex,
            RiskClassification::Low,
            future(),
        )
        .signed(chain, &private_hex)
        .unwrap()
    }

    #[test]
    fn test_signed_waiver_registers_verified() {
        let (manager, chain, _dir) = fixture(true);
        let waiver = signed_waiver(&chain, "s55_accessibility");

        let stored = manager.register_waiver(waiver).unwrap();
        assert!(stored.signature_verified);
        assert!(stored.content_address.starts_with("sha256:"));
        assert!(manager.has_valid_waiver(
            &scope("s55_accessibility", "accessibility"),
            timefmt::now_utc_micros()
        ));
    }

    #[test]
    fn test_strict_mode_rejects_unsigned() {
        let (manager, chain, _dir) = fixture(true);
        let (_, public_hex) = chain.generate_keypair().unwrap();
        let waiver = WaiverArtifact::new(
            WaiverScope {
                stage_id: "s55_accessibility".to_string(),
                gate: "accessibility".to_string(),
            },
            "unsigned",
            &public_hex,
            RiskClassification::High,
            future(),
        );

        assert!(matches!(
            manager.register_waiver(waiver),
            Err(WaiverError::Signature { .. })
        ));
        assert!(!manager.has_valid_waiver(
            &scope("s55_accessibility", "accessibility"),
            timefmt::now_utc_micros()
        ));
    }

    #[test]
    fn test_permissive_mode_stores_unsigned_flagged() {
        let (manager, chain, _dir) = fixture(false);
        let (_, public_hex) = chain.generate_keypair().unwrap();
        let waiver = WaiverArtifact::new(
            WaiverScope {
                stage_id: "s575_security".to_string(),
                gate: "security".to_string(),
            },
            "development bypass",
            &public_hex,
            RiskClassification::Medium,
            future(),
        );

        let stored = manager.register_waiver(waiver).unwrap();
        assert!(!stored.signature_verified);
        // Permissive mode still counts it.
        assert!(manager.has_valid_waiver(
            &scope("s575_security", "security"),
            timefmt::now_utc_micros()
        ));
    }

    #[test]
    fn test_waiver_for_other_gate_does_not_match() {
        let (manager, chain, _dir) = fixture(true);
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();
        let waiver = WaiverArtifact::new(
            scope("s575_security", "security"),
            "pen-test finding accepted",
            &public_hex,
            RiskClassification::High,
            future(),
        )
        .signed(&chain, &private_hex)
        .unwrap();
        manager.register_waiver(waiver).unwrap();

        let now = timefmt::now_utc_micros();
        assert!(manager.has_valid_waiver(&scope("s575_security", "security"), now));
        // A different gate on the same stage is not covered.
        assert!(!manager.has_valid_waiver(&scope("s575_security", "redteam"), now));
        assert!(!manager.has_valid_waiver(&scope("s55_accessibility", "security"), now));
    }

    #[test]
    fn test_strict_mode_with_fail_closed_crypto_rejects() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let fail_closed = Arc::new(ProviderChain::from_candidates(vec![Arc::new(
            FailClosedProvider,
        )]));
        let manager = WaiverManager::new(store, fail_closed, true);

        // Signed with real crypto, but the manager cannot verify anything.
        let real = ProviderChain::probe();
        let waiver = signed_waiver(&real, "s55_accessibility");

        assert!(matches!(
            manager.register_waiver(waiver),
            Err(WaiverError::Signature { .. })
        ));
    }

    #[test]
    fn test_tampered_signed_fields_fail_verification() {
        let (manager, chain, _dir) = fixture(true);
        let mut waiver = signed_waiver(&chain, "s55_accessibility");
        waiver.justification = "broadened after signing".to_string();

        assert!(matches!(
            manager.register_waiver(waiver),
            Err(WaiverError::Signature { .. })
        ));
    }

    #[test]
    fn test_expired_at_registration_rejected() {
        let (manager, chain, _dir) = fixture(false);
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();
        let waiver = WaiverArtifact {
            expires_at: timefmt::now_utc_micros() - Duration::hours(1),
            ..WaiverArtifact::new(
                WaiverScope {
                    stage_id: "s55_accessibility".to_string(),
                    gate: "accessibility".to_string(),
                },
                "too late",
                &public_hex,
                RiskClassification::Low,
                future(),
            )
        }
        .signed(&chain, &private_hex)
        .unwrap();

        assert!(matches!(
            manager.register_waiver(waiver),
            Err(WaiverError::Expired { .. })
        ));
    }

    #[test]
    fn test_expiry_checked_at_lookup_time() {
        let (manager, chain, _dir) = fixture(true);
        let waiver = signed_waiver(&chain, "s55_accessibility");
        let expires_at = waiver.expires_at;
        manager.register_waiver(waiver).unwrap();

        let covered = scope("s55_accessibility", "accessibility");
        assert!(manager.has_valid_waiver(&covered, timefmt::now_utc_micros()));
        assert!(!manager.has_valid_waiver(&covered, expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_find_valid_returns_content_address() {
        let (manager, chain, _dir) = fixture(true);
        let waiver = signed_waiver(&chain, "s55_accessibility");
        let stored = manager.register_waiver(waiver).unwrap();

        let found = manager
            .find_valid(
                &scope("s55_accessibility", "accessibility"),
                timefmt::now_utc_micros(),
            )
            .unwrap();
        assert_eq!(found.content_address, stored.content_address);
        assert!(manager
            .find_valid(&scope("s575_security", "security"), timefmt::now_utc_micros())
            .is_none());
    }
}
