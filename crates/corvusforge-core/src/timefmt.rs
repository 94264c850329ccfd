//! UTC timestamp handling with microsecond precision.
//!
//! Ledger entries, anchors, envelopes, and waivers all carry ISO8601 UTC
//! timestamps with exactly six fractional digits
//! (`2026-08-02T12:34:56.123456+00:00`). Fixing the precision keeps the
//! canonical byte form stable across serialize/parse round trips.

use chrono::{DateTime, SubsecRound, Utc};

const ISO_MICROS: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

/// Returns the current UTC time truncated to microsecond precision.
#[must_use]
pub fn now_utc_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Formats a timestamp in the fixed six-digit ISO8601 form.
#[must_use]
pub fn format_iso_micros(ts: &DateTime<Utc>) -> String {
    ts.format(ISO_MICROS).to_string()
}

/// Serde adapter for the fixed six-digit ISO8601 form.
pub mod iso_micros {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    use super::{ISO_MICROS, format_iso_micros};

    /// Serializes a timestamp as a fixed-precision ISO8601 string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_iso_micros(ts))
    }

    /// Deserializes a fixed-precision ISO8601 string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string does not match the
    /// expected format.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        let naive = chrono::NaiveDateTime::parse_from_str(
            raw.trim_end_matches("+00:00"),
            ISO_MICROS.trim_end_matches("+00:00"),
        )
        .map_err(D::Error::custom)?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

#[cfg(test)]
mod unit_tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_format_fixed_width() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 2, 12, 34, 56).unwrap();
        assert_eq!(format_iso_micros(&ts), "2026-08-02T12:34:56.000000+00:00");
    }

    #[test]
    fn test_now_truncated_to_micros() {
        let ts = now_utc_micros();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrap {
            #[serde(with = "iso_micros")]
            ts: chrono::DateTime<Utc>,
        }

        let original = Wrap {
            ts: now_utc_micros(),
        };
        let json = serde_json::to_string(&original).unwrap();
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ts, original.ts);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
