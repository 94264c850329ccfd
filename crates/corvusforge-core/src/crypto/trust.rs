//! Key fingerprints, trust contexts, and PIN hashing.

use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::hasher::sha256_hex;

/// Length of a key fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// Current trust-context schema version.
pub const TRUST_CONTEXT_VERSION: &str = "1";

/// Fingerprints of the trust roots active when a ledger entry was written.
///
/// Recording the fingerprint, not the key, keeps entries compact while
/// making key rotations forensically visible: rotate a key and every
/// subsequent entry carries a different fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustContext {
    /// Fingerprint of the plugin trust root key, or empty.
    pub plugin_trust_root_fp: String,

    /// Fingerprint of the waiver signing key, or empty.
    pub waiver_signing_key_fp: String,

    /// Fingerprint of the anchor signing key, or empty.
    pub anchor_key_fp: String,
}

/// Computes a short fingerprint of a hex-encoded public key.
///
/// First 16 hex characters of SHA-256 over the UTF-8 bytes of the hex
/// string. Empty key yields an empty fingerprint.
#[must_use]
pub fn key_fingerprint(public_hex: &str) -> String {
    if public_hex.is_empty() {
        return String::new();
    }
    let digest = sha256_hex(public_hex.as_bytes());
    digest[..FINGERPRINT_LEN].to_string()
}

/// Builds the trust context from the three configured public keys.
///
/// Absent keys produce empty fingerprints.
#[must_use]
pub fn compute_trust_context(
    plugin_trust_root: &str,
    waiver_signing_key: &str,
    anchor_key: &str,
) -> TrustContext {
    TrustContext {
        plugin_trust_root_fp: key_fingerprint(plugin_trust_root),
        waiver_signing_key_fp: key_fingerprint(waiver_signing_key),
        anchor_key_fp: key_fingerprint(anchor_key),
    }
}

/// Produces a salted hash of a human-entered PIN or passphrase.
///
/// Format: `<salt_hex>:<sha256(salt || pin)_hex>`. When `salt` is `None` a
/// random 16-byte salt is generated.
#[must_use]
pub fn hash_pin(pin: &str, salt: Option<&[u8]>) -> String {
    let salt: Vec<u8> = match salt {
        Some(s) => s.to_vec(),
        None => {
            let mut buf = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut buf);
            buf.to_vec()
        },
    };
    let mut material = salt.clone();
    material.extend_from_slice(pin.as_bytes());
    format!("{}:{}", hex::encode(&salt), sha256_hex(&material))
}
