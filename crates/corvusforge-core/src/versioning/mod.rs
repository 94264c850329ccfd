//! Version pinning recorded in every ledger entry.
//!
//! Each entry carries the pipeline, schema, toolchain, and ruleset versions
//! that were active when it was written, so replays can detect drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current ledger schema version.
pub const SCHEMA_VERSION: &str = "2026-02";

/// The pinned versions stamped into ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPin {
    /// Pipeline release version.
    pub pipeline_version: String,

    /// Ledger schema version.
    pub schema_version: String,

    /// Implementation toolchain identifier.
    pub toolchain_version: String,

    /// Active ruleset versions, keyed by ruleset name.
    pub ruleset_versions: BTreeMap<String, String>,
}

impl Default for VersionPin {
    fn default() -> Self {
        let mut ruleset_versions = BTreeMap::new();
        ruleset_versions.insert("accessibility".to_string(), "wcag-2.1-aa".to_string());
        ruleset_versions.insert("security".to_string(), "1.0.0".to_string());
        Self {
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            toolchain_version: "rust-2021+serde+rusqlite+ed25519-dalek".to_string(),
            ruleset_versions,
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_default_pin_populated() {
        let pin = VersionPin::default();
        assert!(!pin.pipeline_version.is_empty());
        assert_eq!(pin.schema_version, SCHEMA_VERSION);
        assert_eq!(
            pin.ruleset_versions.get("accessibility").map(String::as_str),
            Some("wcag-2.1-aa")
        );
    }
}
