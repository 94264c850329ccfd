//! The append-only, hash-chained run ledger and its external anchors.
//!
//! Every state transition in a run becomes one sealed [`LedgerEntry`];
//! entries chain through `previous_entry_hash`, anchors checkpoint the
//! chain for external witnessing, and [`RunLedger::verify_chain`] detects
//! any historical mutation.

mod entry;
mod store;


pub use entry::{EntryDraft, LedgerAnchor, LedgerEntry, SignedAnchor, StateTransition};
pub use store::{LedgerError, RunLedger};
