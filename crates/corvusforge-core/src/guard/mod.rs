//! Production configuration guard.
//!
//! The guard is the single enforcement point for production invariants; it
//! runs once during orchestrator construction and fails hard. Other code
//! does not scatter `is_production` checks.

use thiserror::Error;

use crate::config::ForgeConfig;
use crate::crypto::ProviderChain;

/// Raised when production constraints are violated.
///
/// This must not be caught and ignored: the orchestrator refuses to start.
#[derive(Debug, Error)]
#[error("production guard failed:\n{}", .violations.iter().map(|v| format!("  - {v}")).collect::<Vec<_>>().join("\n"))]
pub struct ProductionGuardError {
    /// Every violated constraint, collected in one pass.
    pub violations: Vec<String>,
}

/// Whether waiver signatures must be required under this configuration.
///
/// Production always requires them; elsewhere the configured flag stands.
#[must_use]
pub fn waiver_signature_required(config: &ForgeConfig) -> bool {
    config.is_production() || config.require_waiver_signature
}

/// Validates all production-critical constraints.
///
/// Outside production this imposes nothing. In production it checks, and
/// reports together:
///
/// 1. every role in `required_trust_keys` has a non-empty key configured;
/// 2. waiver signature enforcement is on;
/// 3. the selected crypto provider is real (not fail-closed).
///
/// # Errors
///
/// Returns [`ProductionGuardError`] listing every violated constraint.
pub fn enforce_production_guard(
    config: &ForgeConfig,
    chain: &ProviderChain,
) -> Result<(), ProductionGuardError> {
    if !config.is_production() {
        return Ok(());
    }

    let mut violations = Vec::new();

    for role in &config.required_trust_keys {
        match config.key_for_role(role) {
            Some(key) if !key.is_empty() => {},
            Some(_) => violations.push(format!(
                "required trust key {role} is empty; configure its public key"
            )),
            None => violations.push(format!(
                "required trust key {role} is not a recognized role"
            )),
        }
    }

    if !config.require_waiver_signature {
        violations.push(
            "require_waiver_signature must be enabled in production".to_string(),
        );
    }

    if !chain.has_real_crypto() {
        violations.push(format!(
            "crypto provider {} is fail-closed; production requires a real provider",
            chain.provider_name()
        ));
    }

    if violations.is_empty() {
        tracing::info!("production guard passed");
        Ok(())
    } else {
        tracing::error!(count = violations.len(), "production guard failed");
        Err(ProductionGuardError { violations })
    }
}

#[cfg(test)]
mod unit_tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Environment;
    use crate::crypto::FailClosedProvider;

    fn production_config() -> ForgeConfig {
        ForgeConfig {
            environment: Environment::Production,
            plugin_trust_root_public_hex: "aa".repeat(32),
            waiver_signing_key_public_hex: "bb".repeat(32),
            require_waiver_signature: true,
            ..ForgeConfig::default()
        }
    }

    #[test]
    fn test_debug_imposes_nothing() {
        let config = ForgeConfig::default();
        let chain = ProviderChain::from_candidates(vec![Arc::new(FailClosedProvider)]);
        enforce_production_guard(&config, &chain).unwrap();
        assert!(!waiver_signature_required(&config));
    }

    #[test]
    fn test_valid_production_passes() {
        let config = production_config();
        let chain = ProviderChain::probe();
        enforce_production_guard(&config, &chain).unwrap();
        assert!(waiver_signature_required(&config));
    }

    #[test]
    fn test_missing_key_named_in_error() {
        let config = ForgeConfig {
            plugin_trust_root_public_hex: String::new(),
            ..production_config()
        };
        let err = enforce_production_guard(&config, &ProviderChain::probe()).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("plugin_trust_root")));
    }

    #[test]
    fn test_all_violations_collected() {
        let config = ForgeConfig {
            environment: Environment::Production,
            require_waiver_signature: false,
            ..ForgeConfig::default()
        };
        let chain = ProviderChain::from_candidates(vec![Arc::new(FailClosedProvider)]);
        let err = enforce_production_guard(&config, &chain).unwrap_err();

        // Two empty keys, permissive waivers, fail-closed crypto.
        assert_eq!(err.violations.len(), 4);
    }

    #[test]
    fn test_permissive_waivers_rejected_in_production() {
        let config = ForgeConfig {
            require_waiver_signature: false,
            ..production_config()
        };
        let err = enforce_production_guard(&config, &ProviderChain::probe()).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("require_waiver_signature")));
        // The effective policy is still strict.
        assert!(waiver_signature_required(&config));
    }

    #[test]
    fn test_fail_closed_crypto_rejected_in_production() {
        let config = production_config();
        let chain = ProviderChain::from_candidates(vec![Arc::new(FailClosedProvider)]);
        let err = enforce_production_guard(&config, &chain).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("fail-closed")));
    }
}
