//! `SQLite`-backed append-only run ledger.
//!
//! The run ledger is the source of truth. It is:
//!
//! - **Append-only**: the only write path is [`RunLedger::append`] (and its
//!   batch form); there is no update and no delete.
//! - **Hash-chained**: each entry records the `entry_hash` of its
//!   predecessor, so any historical mutation breaks the chain.
//! - **Single-writer per run**: appends hold the connection lock across the
//!   read-link-insert sequence inside one transaction, so a failed append
//!   leaves no trace.
//!
//! WAL journal mode allows concurrent readers while a write is in
//! progress. Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

// Mutex poisoning and construction-time invariants are unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, params};
use subtle::ConstantTimeEq as _;
use thiserror::Error;

use super::entry::{EntryDraft, LedgerAnchor, LedgerEntry, SignedAnchor};
use crate::crypto::{CryptoError, ProviderChain};
use crate::hasher::CanonicalError;
use crate::timefmt;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from run ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The hash chain or an anchor check failed. Non-recoverable for the
    /// affected run.
    #[error("ledger integrity violation for run {run_id}: {details}")]
    Integrity {
        /// The run whose chain is broken.
        run_id: String,
        /// What failed.
        details: String,
    },

    /// An entry could not be canonicalized for hashing.
    #[error("canonicalization error: {0}")]
    Canonical(#[from] CanonicalError),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded back into an entry.
    #[error("corrupt ledger row {entry_id}: {details}")]
    CorruptRow {
        /// The entry whose row is unreadable.
        entry_id: String,
        /// What failed to decode.
        details: String,
    },

    /// Anchor signing failed.
    #[error("anchor signing error: {0}")]
    AnchorSigning(#[from] CryptoError),
}

/// Append-only, hash-chained run ledger.
pub struct RunLedger {
    conn: Arc<Mutex<Connection>>,
}

impl RunLedger {
    /// Opens or creates a ledger at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Append (the only write path)
    // ------------------------------------------------------------------

    /// Appends one entry, computing its chain link and sealing its hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be sealed or inserted. A failed
    /// append leaves no trace.
    pub fn append(&self, draft: EntryDraft) -> Result<LedgerEntry, LedgerError> {
        let mut sealed = self.append_batch(vec![draft])?;
        Ok(sealed.remove(0))
    }

    /// Appends several entries of one run atomically, in order.
    ///
    /// Used by the stage machine so a transition and its cascade entries
    /// commit together or not at all. Entries are chained in the given
    /// order; timestamps are clamped to be monotonic per run.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be sealed or inserted; on error
    /// nothing is inserted.
    pub fn append_batch(&self, drafts: Vec<EntryDraft>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction()?;

        let mut sealed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let run_id = draft.run_id.clone();
            let (previous_entry_hash, previous_ts) = match Self::chain_tip(&tx, &run_id)? {
                Some((hash, ts)) => (hash, Some(ts)),
                None => (String::new(), None),
            };

            let mut timestamp = timefmt::now_utc_micros();
            if let Some(prev) = previous_ts {
                // Clock regressions must not reorder the chain.
                if timestamp <= prev {
                    timestamp = prev + Duration::microseconds(1);
                }
            }

            let entry = draft.seal(previous_entry_hash, timestamp)?;
            Self::insert(&tx, &entry)?;
            sealed.push(entry);
        }

        tx.commit()?;
        Ok(sealed)
    }

    /// Reads the `(entry_hash, timestamp)` of a run's most recent entry.
    fn chain_tip(
        conn: &Connection,
        run_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, LedgerError> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT entry_hash, timestamp_utc FROM run_ledger
                 WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((hash, ts_raw)) => {
                let ts = DateTime::parse_from_rfc3339(&ts_raw)
                    .map_err(|e| LedgerError::CorruptRow {
                        entry_id: hash.clone(),
                        details: format!("unparsable timestamp {ts_raw:?}: {e}"),
                    })?
                    .with_timezone(&Utc);
                Ok(Some((hash, ts)))
            },
        }
    }

    fn insert(conn: &Connection, entry: &LedgerEntry) -> Result<(), LedgerError> {
        conn.execute(
            "INSERT INTO run_ledger
                (entry_id, run_id, stage_id, state_transition, timestamp_utc,
                 input_hash, output_hash, artifact_refs_json,
                 pipeline_version, schema_version, toolchain_version,
                 ruleset_versions_json, waiver_refs_json, trust_context_json,
                 trust_context_version, payload_hash, previous_entry_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                entry.entry_id,
                entry.run_id,
                entry.stage_id,
                entry.state_transition.to_string(),
                timefmt::format_iso_micros(&entry.timestamp_utc),
                entry.input_hash,
                entry.output_hash,
                serde_json::to_string(&entry.artifact_refs).map_err(CanonicalError::from)?,
                entry.pipeline_version,
                entry.schema_version,
                entry.toolchain_version,
                serde_json::to_string(&entry.ruleset_versions).map_err(CanonicalError::from)?,
                serde_json::to_string(&entry.waiver_refs).map_err(CanonicalError::from)?,
                serde_json::to_string(&entry.trust_context).map_err(CanonicalError::from)?,
                entry.trust_context_version,
                entry.payload_hash,
                entry.previous_entry_hash,
                entry.entry_hash,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries (read-only)
    // ------------------------------------------------------------------

    /// Returns the most recent entry for a run, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn latest_entry(&self, run_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM run_ledger WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt
            .query_map(params![run_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        match rows.pop() {
            None => Ok(None),
            Some(entry) => Ok(Some(entry?)),
        }
    }

    /// Returns all entries for a run in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn run_entries(&self, run_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt =
            conn.prepare("SELECT * FROM run_ledger WHERE run_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![run_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Returns all entries for one stage of a run, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn stage_history(
        &self,
        run_id: &str,
        stage_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM run_ledger WHERE run_id = ?1 AND stage_id = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id, stage_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Returns all distinct run identifiers, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn run_ids(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT run_id FROM run_ledger GROUP BY run_id ORDER BY MAX(id) DESC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Decodes a database row into an entry.
    ///
    /// `SQLite`-level failures surface as `rusqlite::Error`; JSON-column
    /// decoding failures surface as [`LedgerError::CorruptRow`] in the
    /// inner result.
    #[allow(clippy::type_complexity)]
    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LedgerEntry, LedgerError>> {
        let entry_id: String = row.get(1)?;
        let state_transition_raw: String = row.get(4)?;
        let timestamp_raw: String = row.get(5)?;
        let artifact_refs_json: String = row.get(8)?;
        let ruleset_versions_json: String = row.get(12)?;
        let waiver_refs_json: String = row.get(13)?;
        let trust_context_json: String = row.get(14)?;

        let corrupt = |details: String| LedgerError::CorruptRow {
            entry_id: entry_id.clone(),
            details,
        };

        let decoded = (|| -> Result<_, LedgerError> {
            let state_transition = state_transition_raw
                .parse::<super::entry::StateTransition>()
                .map_err(|e: String| corrupt(e))?;
            let timestamp_utc = DateTime::parse_from_rfc3339(&timestamp_raw)
                .map_err(|e| corrupt(format!("unparsable timestamp {timestamp_raw:?}: {e}")))?
                .with_timezone(&Utc);
            let artifact_refs = serde_json::from_str::<Vec<String>>(&artifact_refs_json)
                .map_err(|e| corrupt(format!("artifact_refs: {e}")))?;
            let ruleset_versions = serde_json::from_str::<
                std::collections::BTreeMap<String, String>,
            >(&ruleset_versions_json)
            .map_err(|e| corrupt(format!("ruleset_versions: {e}")))?;
            let waiver_refs = serde_json::from_str::<Vec<String>>(&waiver_refs_json)
                .map_err(|e| corrupt(format!("waiver_refs: {e}")))?;
            let trust_context =
                serde_json::from_str::<crate::crypto::TrustContext>(&trust_context_json)
                    .map_err(|e| corrupt(format!("trust_context: {e}")))?;
            Ok((
                state_transition,
                timestamp_utc,
                artifact_refs,
                ruleset_versions,
                waiver_refs,
                trust_context,
            ))
        })();

        let (state_transition, timestamp_utc, artifact_refs, ruleset_versions, waiver_refs, trust_context) =
            match decoded {
                Ok(fields) => fields,
                Err(err) => return Ok(Err(err)),
            };

        Ok(Ok(LedgerEntry {
            entry_id,
            run_id: row.get(2)?,
            stage_id: row.get(3)?,
            state_transition,
            timestamp_utc,
            input_hash: row.get(6)?,
            output_hash: row.get(7)?,
            artifact_refs,
            pipeline_version: row.get(9)?,
            schema_version: row.get(10)?,
            toolchain_version: row.get(11)?,
            ruleset_versions,
            waiver_refs,
            trust_context,
            trust_context_version: row.get(15)?,
            payload_hash: row.get(16)?,
            previous_entry_hash: row.get(17)?,
            entry_hash: row.get(18)?,
        }))
    }

    // ------------------------------------------------------------------
    // Chain verification
    // ------------------------------------------------------------------

    /// Verifies the hash chain for a run.
    ///
    /// Walks all entries in order, recomputes each `entry_hash`, and checks
    /// that `previous_entry_hash` links match, with the first entry linking
    /// to nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Integrity`] on any mismatch.
    pub fn verify_chain(&self, run_id: &str) -> Result<(), LedgerError> {
        let entries = self.run_entries(run_id)?;

        let mut prev_hash = String::new();
        for entry in &entries {
            if entry.previous_entry_hash != prev_hash {
                return Err(LedgerError::Integrity {
                    run_id: run_id.to_string(),
                    details: format!(
                        "chain broken at entry {}: expected previous_hash {:?}, got {:?}",
                        entry.entry_id, prev_hash, entry.previous_entry_hash
                    ),
                });
            }

            let recomputed = entry.compute_hash()?;
            let hash_matches =
                bool::from(entry.entry_hash.as_bytes().ct_eq(recomputed.as_bytes()));
            if !hash_matches {
                return Err(LedgerError::Integrity {
                    run_id: run_id.to_string(),
                    details: format!(
                        "tampered entry {}: recomputed hash {:?}, stored {:?}",
                        entry.entry_id, recomputed, entry.entry_hash
                    ),
                });
            }

            prev_hash = entry.entry_hash.clone();
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // External anchoring
    // ------------------------------------------------------------------

    /// Exports a tamper-evident anchor for external witnessing.
    ///
    /// Multiple anchors per run are permitted; each is a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read or the anchor cannot be
    /// sealed.
    pub fn export_anchor(&self, run_id: &str) -> Result<LedgerAnchor, LedgerError> {
        let entries = self.run_entries(run_id)?;
        let (root, first) = match (entries.last(), entries.first()) {
            (Some(last), Some(first)) => (last.entry_hash.as_str(), first.entry_hash.as_str()),
            _ => ("", ""),
        };
        Ok(LedgerAnchor::build(
            run_id,
            entries.len() as u64,
            root,
            first,
        )?)
    }

    /// Exports an anchor signed with the anchor key.
    ///
    /// The signature covers the canonical bytes of the anchor record.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be built or signing fails
    /// (including a fail-closed crypto chain).
    pub fn export_signed_anchor(
        &self,
        run_id: &str,
        chain: &ProviderChain,
        anchor_private_hex: &str,
        anchor_public_hex: &str,
    ) -> Result<SignedAnchor, LedgerError> {
        let anchor = self.export_anchor(run_id)?;
        let signature = chain.sign_data(&anchor.signable_bytes()?, anchor_private_hex)?;
        Ok(SignedAnchor {
            anchor,
            signature,
            anchor_key_public_hex: anchor_public_hex.to_string(),
        })
    }

    /// Persists an anchor as an independent document row.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be serialized or inserted.
    pub fn record_anchor(
        &self,
        anchor: &LedgerAnchor,
        signature: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO ledger_anchors (run_id, anchor_json, signature, anchor_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                anchor.run_id,
                serde_json::to_string(anchor).map_err(CanonicalError::from)?,
                signature,
                anchor.anchor_hash,
                timefmt::format_iso_micros(&timefmt::now_utc_micros()),
            ],
        )?;
        Ok(())
    }

    /// Verifies the current chain against a previously exported anchor.
    ///
    /// Checks, in order: the anchor's own hash, truncation, retroactive
    /// first-entry rewrite, the entry at the anchor point, and finally the
    /// full chain.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Integrity`] if the chain has diverged from
    /// the anchor.
    pub fn verify_against_anchor(
        &self,
        run_id: &str,
        anchor: &LedgerAnchor,
    ) -> Result<(), LedgerError> {
        let recomputed = anchor.compute_hash()?;
        let anchor_matches =
            bool::from(recomputed.as_bytes().ct_eq(anchor.anchor_hash.as_bytes()));
        if !anchor_matches {
            return Err(LedgerError::Integrity {
                run_id: run_id.to_string(),
                details: format!(
                    "anchor hash mismatch: recomputed {:?}, anchor carries {:?}",
                    recomputed, anchor.anchor_hash
                ),
            });
        }

        let entries = self.run_entries(run_id)?;
        let expected_count = anchor.entry_count as usize;
        if entries.len() < expected_count {
            return Err(LedgerError::Integrity {
                run_id: run_id.to_string(),
                details: format!(
                    "chain has {} entries but anchor expects at least {expected_count}; \
                     the chain has been truncated",
                    entries.len()
                ),
            });
        }

        if expected_count == 0 {
            return Ok(());
        }

        if entries[0].entry_hash != anchor.first_entry_hash {
            return Err(LedgerError::Integrity {
                run_id: run_id.to_string(),
                details: format!(
                    "first entry hash mismatch: chain has {:?}, anchor has {:?}; \
                     the chain may have been rewritten from the beginning",
                    entries[0].entry_hash, anchor.first_entry_hash
                ),
            });
        }

        let at_anchor = &entries[expected_count - 1];
        if at_anchor.entry_hash != anchor.root_hash {
            return Err(LedgerError::Integrity {
                run_id: run_id.to_string(),
                details: format!(
                    "root hash mismatch at entry {expected_count}: chain has {:?}, \
                     anchor has {:?}; the chain may have been retroactively modified",
                    at_anchor.entry_hash, anchor.root_hash
                ),
            });
        }

        self.verify_chain(run_id)
    }
}

#[cfg(test)]
impl RunLedger {
    /// Test-only escape hatch for simulating storage-level tampering.
    pub(crate) fn raw_execute(&self, sql: &str) -> Result<usize, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        Ok(conn.execute(sql, [])?)
    }
}
