//! Contracted inter-node envelopes and their validator.
//!
//! All node communication uses validated JSON envelopes; no freeform
//! messages pass the validator. Envelopes are sealed at construction:
//! [`Envelope::new`] computes `payload_hash` from the canonical payload
//! bytes, and [`validate_bytes`] recomputes it on receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::hasher::{CanonicalError, canonical_bytes, sha256_hex};
use crate::timefmt;
use crate::versioning::SCHEMA_VERSION;

/// Envelope schema versions the validator accepts.
pub const ACCEPTED_SCHEMA_VERSIONS: &[&str] = &[SCHEMA_VERSION];

/// Errors from envelope construction and validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// The raw bytes are not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The parsed JSON is not an object.
    #[error("envelope must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON type of the rejected value.
        found: &'static str,
    },

    /// A required base field is absent or not a string.
    #[error("missing or malformed envelope field: {field}")]
    MissingField {
        /// The absent field.
        field: &'static str,
    },

    /// `envelope_kind` is not one of the six contracted kinds.
    #[error("unknown envelope_kind: {kind}")]
    UnknownKind {
        /// The rejected kind string.
        kind: String,
    },

    /// `schema_version` is outside the accepted set.
    #[error("unsupported schema_version: {version}")]
    UnsupportedSchemaVersion {
        /// The rejected version string.
        version: String,
    },

    /// `payload_hash` does not match the canonical payload bytes.
    #[error("payload hash mismatch for envelope {envelope_id}: declared {declared}, computed {computed}")]
    PayloadHashMismatch {
        /// The envelope whose hash failed.
        envelope_id: String,
        /// The hash the envelope carried.
        declared: String,
        /// The hash the payload actually produces.
        computed: String,
    },

    /// The payload could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// The six contracted envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Instructs a node to perform work on a stage.
    WorkOrder,
    /// Reports a state transition or significant event.
    Event,
    /// References a content-addressed artifact.
    Artifact,
    /// Requests operator clarification for a blocked stage.
    Clarification,
    /// Reports a stage failure with recovery information.
    Failure,
    /// Responds to a clarification or other request.
    Response,
}

impl EnvelopeKind {
    /// All contracted kinds.
    pub const ALL: &'static [Self] = &[
        Self::WorkOrder,
        Self::Event,
        Self::Artifact,
        Self::Clarification,
        Self::Failure,
        Self::Response,
    ];

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "work_order" => Some(Self::WorkOrder),
            "event" => Some(Self::Event),
            "artifact" => Some(Self::Artifact),
            "clarification" => Some(Self::Clarification),
            "failure" => Some(Self::Failure),
            "response" => Some(Self::Response),
            _ => None,
        }
    }
}

/// A validated inter-node message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope schema version.
    pub schema_version: String,

    /// Unique envelope identifier.
    pub envelope_id: String,

    /// The run this envelope belongs to.
    pub run_id: String,

    /// Sending node.
    pub source_node_id: String,

    /// Receiving node.
    pub destination_node_id: String,

    /// One of the six contracted kinds.
    pub envelope_kind: EnvelopeKind,

    /// SHA-256 of the canonical payload bytes.
    pub payload_hash: String,

    /// When the envelope was constructed.
    #[serde(with = "timefmt::iso_micros")]
    pub timestamp_utc: DateTime<Utc>,

    /// Kind-specific payload.
    pub payload: Value,
}

impl Envelope {
    /// Constructs a sealed envelope, computing `payload_hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be canonicalized.
    pub fn new(
        kind: EnvelopeKind,
        run_id: &str,
        source_node_id: &str,
        destination_node_id: &str,
        payload: Value,
    ) -> Result<Self, EnvelopeError> {
        let payload_hash = sha256_hex(&canonical_bytes(&payload)?);
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            envelope_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            source_node_id: source_node_id.to_string(),
            destination_node_id: destination_node_id.to_string(),
            envelope_kind: kind,
            payload_hash,
            timestamp_utc: timefmt::now_utc_micros(),
            payload,
        })
    }

    /// Serializes the envelope to canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be canonicalized.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(canonical_bytes(&serde_json::to_value(self)?)?)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validates raw bytes into an [`Envelope`].
///
/// Rejection order: JSON parse, object check (before any field access),
/// `envelope_kind`, required base fields, `schema_version`, and finally the
/// payload hash recomputation.
///
/// # Errors
///
/// Returns an [`EnvelopeError`] describing the first failed check.
pub fn validate_bytes(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_slice(raw)?;

    let Value::Object(map) = &value else {
        return Err(EnvelopeError::NotAnObject {
            found: json_type_name(&value),
        });
    };

    let kind_raw = map
        .get("envelope_kind")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField {
            field: "envelope_kind",
        })?;
    if EnvelopeKind::parse(kind_raw).is_none() {
        return Err(EnvelopeError::UnknownKind {
            kind: kind_raw.to_string(),
        });
    }

    for field in [
        "envelope_id",
        "run_id",
        "source_node_id",
        "destination_node_id",
        "payload_hash",
        "timestamp_utc",
        "schema_version",
    ] {
        if map.get(field).and_then(Value::as_str).is_none() {
            return Err(EnvelopeError::MissingField { field });
        }
    }
    if !map.contains_key("payload") {
        return Err(EnvelopeError::MissingField { field: "payload" });
    }

    let schema_version = map
        .get("schema_version")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !ACCEPTED_SCHEMA_VERSIONS.contains(&schema_version) {
        return Err(EnvelopeError::UnsupportedSchemaVersion {
            version: schema_version.to_string(),
        });
    }

    let envelope: Envelope = serde_json::from_value(value)?;

    let computed = sha256_hex(&canonical_bytes(&envelope.payload)?);
    if computed != envelope.payload_hash {
        return Err(EnvelopeError::PayloadHashMismatch {
            envelope_id: envelope.envelope_id,
            declared: envelope.payload_hash,
            computed,
        });
    }

    Ok(envelope)
}
