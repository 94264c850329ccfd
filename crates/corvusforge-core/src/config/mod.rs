//! Pipeline configuration consumed by the production guard and the
//! orchestrator.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Trust-key role name: plugin signature verification root.
pub const ROLE_PLUGIN_TRUST_ROOT: &str = "plugin_trust_root";

/// Trust-key role name: waiver signature verification key.
pub const ROLE_WAIVER_SIGNING_KEY: &str = "waiver_signing_key";

/// Trust-key role name: anchor signing key.
pub const ROLE_ANCHOR_SIGNING_KEY: &str = "anchor_signing_key";

/// Runtime environment the pipeline operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Hardened mode: trust keys required, waivers strict, real crypto.
    Production,

    /// Development mode: no key requirements, permissive waivers allowed.
    #[default]
    Debug,
}

/// Configuration for one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Runtime environment.
    pub environment: Environment,

    /// Trust-key roles that must be configured in production.
    pub required_trust_keys: BTreeSet<String>,

    /// Hex-encoded public key for plugin verification, or empty.
    pub plugin_trust_root_public_hex: String,

    /// Hex-encoded public key for waiver verification, or empty.
    pub waiver_signing_key_public_hex: String,

    /// Hex-encoded public key for anchor signing, or empty.
    pub anchor_signing_key_public_hex: String,

    /// Whether waiver signatures are required; forced on in production.
    pub require_waiver_signature: bool,

    /// Filesystem location of the ledger database.
    pub ledger_path: PathBuf,

    /// Filesystem root of the artifact store.
    pub artifact_dir: PathBuf,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Debug,
            required_trust_keys: [
                ROLE_PLUGIN_TRUST_ROOT.to_string(),
                ROLE_WAIVER_SIGNING_KEY.to_string(),
            ]
            .into_iter()
            .collect(),
            plugin_trust_root_public_hex: String::new(),
            waiver_signing_key_public_hex: String::new(),
            anchor_signing_key_public_hex: String::new(),
            require_waiver_signature: false,
            ledger_path: PathBuf::from(".corvusforge/ledger.db"),
            artifact_dir: PathBuf::from(".corvusforge/artifacts"),
        }
    }
}

impl ForgeConfig {
    /// Whether this configuration is for production.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// The configured public key for a trust-key role, if any.
    #[must_use]
    pub fn key_for_role(&self, role: &str) -> Option<&str> {
        match role {
            ROLE_PLUGIN_TRUST_ROOT => Some(self.plugin_trust_root_public_hex.as_str()),
            ROLE_WAIVER_SIGNING_KEY => Some(self.waiver_signing_key_public_hex.as_str()),
            ROLE_ANCHOR_SIGNING_KEY => Some(self.anchor_signing_key_public_hex.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_default_is_debug_permissive() {
        let config = ForgeConfig::default();
        assert!(!config.is_production());
        assert!(!config.require_waiver_signature);
        assert!(config.required_trust_keys.contains(ROLE_PLUGIN_TRUST_ROOT));
        assert!(config.required_trust_keys.contains(ROLE_WAIVER_SIGNING_KEY));
    }

    #[test]
    fn test_key_for_role() {
        let config = ForgeConfig {
            waiver_signing_key_public_hex: "abcd".to_string(),
            ..ForgeConfig::default()
        };
        assert_eq!(config.key_for_role(ROLE_WAIVER_SIGNING_KEY), Some("abcd"));
        assert_eq!(config.key_for_role(ROLE_PLUGIN_TRUST_ROOT), Some(""));
        assert_eq!(config.key_for_role("unknown_role"), None);
    }

    #[test]
    fn test_serde_environment_names() {
        let config: ForgeConfig =
            serde_json::from_str(r#"{"environment": "production"}"#).unwrap();
        assert!(config.is_production());
    }
}
