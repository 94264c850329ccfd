//! Capability-probed crypto providers.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;
use zeroize::Zeroizing;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 key length in bytes (both seed and public key).
const KEY_SIZE: usize = 32;

/// Errors from signing and key-generation operations.
///
/// Verification never errors — it returns `false`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// No real crypto provider is available.
    #[error("no crypto provider available: {operation} refused (fail-closed)")]
    Unavailable {
        /// The operation that was refused.
        operation: &'static str,
    },

    /// A key was malformed (bad hex or wrong length).
    #[error("malformed key: {details}")]
    MalformedKey {
        /// What was wrong with the key.
        details: String,
    },
}

/// A crypto backend capable of Ed25519 keypair generation, signing, and
/// verification over hex-encoded key material.
pub trait CryptoProvider: Send + Sync {
    /// Short name used in logs and guard diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this provider can actually be used in this process.
    fn is_available(&self) -> bool;

    /// Whether this is the fail-closed placeholder.
    fn is_fail_closed(&self) -> bool {
        false
    }

    /// Generates a keypair, returned as `(private_hex, public_hex)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot generate keys.
    fn generate_keypair(&self) -> Result<(String, String), CryptoError>;

    /// Signs `data` with the hex-encoded private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed or the provider refuses.
    fn sign(&self, data: &[u8], private_hex: &str) -> Result<String, CryptoError>;

    /// Verifies `signature_hex` over `data` under `public_hex`.
    ///
    /// Never errors: malformed input is an unverified signature.
    fn verify(&self, data: &[u8], signature_hex: &str, public_hex: &str) -> bool;
}

/// Native Ed25519 provider.
#[derive(Debug, Default)]
pub struct NativeEd25519Provider;

impl NativeEd25519Provider {
    fn signing_key(private_hex: &str) -> Result<SigningKey, CryptoError> {
        let bytes = Zeroizing::new(hex::decode(private_hex).map_err(|e| {
            CryptoError::MalformedKey {
                details: format!("private key is not valid hex: {e}"),
            }
        })?);
        let seed: [u8; KEY_SIZE] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::MalformedKey {
                    details: format!("private key must be {KEY_SIZE} bytes, got {}", bytes.len()),
                })?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl CryptoProvider for NativeEd25519Provider {
    fn name(&self) -> &'static str {
        "ed25519-native"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn generate_keypair(&self) -> Result<(String, String), CryptoError> {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let private_hex = hex::encode(Zeroizing::new(signing_key.to_bytes()).as_slice());
        let public_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Ok((private_hex, public_hex))
    }

    fn sign(&self, data: &[u8], private_hex: &str) -> Result<String, CryptoError> {
        let key = Self::signing_key(private_hex)?;
        Ok(hex::encode(key.sign(data).to_bytes()))
    }

    fn verify(&self, data: &[u8], signature_hex: &str, public_hex: &str) -> bool {
        if signature_hex.is_empty() || public_hex.is_empty() {
            return false;
        }
        let Ok(sig_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(sig_array) = <[u8; SIGNATURE_SIZE]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        let Ok(pub_bytes) = hex::decode(public_hex) else {
            return false;
        };
        let Ok(pub_array) = <[u8; KEY_SIZE]>::try_from(pub_bytes.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pub_array) else {
            return false;
        };
        verifying_key
            .verify(data, &Signature::from_bytes(&sig_array))
            .is_ok()
    }
}

/// Fail-closed placeholder used when no real crypto backend is present.
///
/// `verify` always returns `false`; `sign` and `generate_keypair` refuse.
/// The system refuses to trust anything it cannot verify.
#[derive(Debug, Default)]
pub struct FailClosedProvider;

impl CryptoProvider for FailClosedProvider {
    fn name(&self) -> &'static str {
        "fail-closed"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn is_fail_closed(&self) -> bool {
        true
    }

    fn generate_keypair(&self) -> Result<(String, String), CryptoError> {
        Err(CryptoError::Unavailable {
            operation: "generate_keypair",
        })
    }

    fn sign(&self, _data: &[u8], _private_hex: &str) -> Result<String, CryptoError> {
        Err(CryptoError::Unavailable { operation: "sign" })
    }

    fn verify(&self, _data: &[u8], _signature_hex: &str, _public_hex: &str) -> bool {
        false
    }
}

/// The probed provider chain. Selection happens once, at construction.
pub struct ProviderChain {
    selected: Arc<dyn CryptoProvider>,
}

impl ProviderChain {
    /// Probes the default provider order and caches the first available
    /// backend.
    #[must_use]
    pub fn probe() -> Self {
        Self::from_candidates(vec![
            Arc::new(NativeEd25519Provider),
            Arc::new(FailClosedProvider),
        ])
    }

    /// Probes with an externally supplied provider at the front of the
    /// chain.
    ///
    /// This is the integration seam for richer SATL-compatible backends:
    /// register one here and it takes precedence over the native provider.
    #[must_use]
    pub fn with_preferred(preferred: Arc<dyn CryptoProvider>) -> Self {
        Self::from_candidates(vec![
            preferred,
            Arc::new(NativeEd25519Provider),
            Arc::new(FailClosedProvider),
        ])
    }

    /// Probes an explicit candidate list in order.
    ///
    /// Falls back to the fail-closed provider if nothing is available.
    #[must_use]
    pub fn from_candidates(candidates: Vec<Arc<dyn CryptoProvider>>) -> Self {
        for candidate in candidates {
            if candidate.is_available() {
                if candidate.is_fail_closed() {
                    tracing::warn!(
                        provider = candidate.name(),
                        "no real crypto backend available; verification will fail closed"
                    );
                } else {
                    tracing::debug!(provider = candidate.name(), "crypto provider selected");
                }
                return Self {
                    selected: candidate,
                };
            }
        }
        tracing::warn!("no crypto provider probed as available; failing closed");
        Self {
            selected: Arc::new(FailClosedProvider),
        }
    }

    /// Name of the selected provider.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.selected.name()
    }

    /// Whether the selected provider is real crypto (not fail-closed).
    #[must_use]
    pub fn has_real_crypto(&self) -> bool {
        !self.selected.is_fail_closed()
    }

    /// Generates a keypair as `(private_hex, public_hex)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected provider refuses.
    pub fn generate_keypair(&self) -> Result<(String, String), CryptoError> {
        self.selected.generate_keypair()
    }

    /// Signs `data`, returning the hex-encoded 64-byte Ed25519 signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed or the selected provider is
    /// fail-closed.
    pub fn sign_data(&self, data: &[u8], private_hex: &str) -> Result<String, CryptoError> {
        self.selected.sign(data, private_hex)
    }

    /// Verifies a signature. The only site that can produce `true`.
    ///
    /// Returns `true` only when the selected provider is real crypto AND the
    /// signature is syntactically well-formed AND the cryptographic check
    /// succeeds. Fail-closed provider, empty or malformed signature, missing
    /// key: all `false`.
    #[must_use]
    pub fn verify_data(&self, data: &[u8], signature_hex: &str, public_hex: &str) -> bool {
        if self.selected.is_fail_closed() {
            tracing::warn!("verify_data: no crypto backend available; cannot verify signature");
            return false;
        }
        if signature_hex.is_empty() || public_hex.is_empty() {
            return false;
        }
        self.selected.verify(data, signature_hex, public_hex)
    }
}

impl std::fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderChain")
            .field("selected", &self.selected.name())
            .finish()
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_probe_selects_native() {
        let chain = ProviderChain::probe();
        assert_eq!(chain.provider_name(), "ed25519-native");
        assert!(chain.has_real_crypto());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let chain = ProviderChain::probe();
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();

        let sig = chain.sign_data(b"payload", &private_hex).unwrap();
        assert_eq!(sig.len(), SIGNATURE_SIZE * 2);
        assert!(chain.verify_data(b"payload", &sig, &public_hex));
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let chain = ProviderChain::probe();
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();

        let sig = chain.sign_data(b"payload", &private_hex).unwrap();
        assert!(!chain.verify_data(b"tampered", &sig, &public_hex));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let chain = ProviderChain::probe();
        let (private_hex, _) = chain.generate_keypair().unwrap();
        let (_, other_public) = chain.generate_keypair().unwrap();

        let sig = chain.sign_data(b"payload", &private_hex).unwrap();
        assert!(!chain.verify_data(b"payload", &sig, &other_public));
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let chain = ProviderChain::probe();
        let (private_hex, public_hex) = chain.generate_keypair().unwrap();
        let sig = chain.sign_data(b"payload", &private_hex).unwrap();

        assert!(!chain.verify_data(b"payload", "", &public_hex));
        assert!(!chain.verify_data(b"payload", "not-hex", &public_hex));
        assert!(!chain.verify_data(b"payload", "abcd", &public_hex));
        assert!(!chain.verify_data(b"payload", &sig, ""));
        assert!(!chain.verify_data(b"payload", &sig, "zz"));
    }

    #[test]
    fn test_fail_closed_chain_never_verifies() {
        let chain = ProviderChain::from_candidates(vec![Arc::new(FailClosedProvider)]);
        assert!(!chain.has_real_crypto());
        assert_eq!(chain.provider_name(), "fail-closed");

        // Even a signature produced by real crypto is unverifiable here.
        let real = ProviderChain::probe();
        let (private_hex, public_hex) = real.generate_keypair().unwrap();
        let sig = real.sign_data(b"data", &private_hex).unwrap();

        assert!(!chain.verify_data(b"data", &sig, &public_hex));
        assert!(chain.sign_data(b"data", &private_hex).is_err());
        assert!(chain.generate_keypair().is_err());
    }

    #[test]
    fn test_preferred_provider_takes_precedence() {
        struct Preferred;
        impl CryptoProvider for Preferred {
            fn name(&self) -> &'static str {
                "preferred-stub"
            }
            fn is_available(&self) -> bool {
                true
            }
            fn generate_keypair(&self) -> Result<(String, String), CryptoError> {
                NativeEd25519Provider.generate_keypair()
            }
            fn sign(&self, data: &[u8], private_hex: &str) -> Result<String, CryptoError> {
                NativeEd25519Provider.sign(data, private_hex)
            }
            fn verify(&self, data: &[u8], signature_hex: &str, public_hex: &str) -> bool {
                NativeEd25519Provider.verify(data, signature_hex, public_hex)
            }
        }

        let chain = ProviderChain::with_preferred(Arc::new(Preferred));
        assert_eq!(chain.provider_name(), "preferred-stub");
    }

    #[test]
    fn test_unavailable_preferred_falls_through() {
        struct Absent;
        impl CryptoProvider for Absent {
            fn name(&self) -> &'static str {
                "absent"
            }
            fn is_available(&self) -> bool {
                false
            }
            fn generate_keypair(&self) -> Result<(String, String), CryptoError> {
                Err(CryptoError::Unavailable {
                    operation: "generate_keypair",
                })
            }
            fn sign(&self, _: &[u8], _: &str) -> Result<String, CryptoError> {
                Err(CryptoError::Unavailable { operation: "sign" })
            }
            fn verify(&self, _: &[u8], _: &str, _: &str) -> bool {
                false
            }
        }

        let chain = ProviderChain::with_preferred(Arc::new(Absent));
        assert_eq!(chain.provider_name(), "ed25519-native");
    }
}
