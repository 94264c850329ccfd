//! The stage machine: transition validation, prerequisite enforcement, and
//! cascade blocking, with every outcome recorded in the run ledger.
//!
//! A transition and its cascade entries are appended in one ledger
//! transaction: either the whole effect is visible or none of it is.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

// Mutex poisoning and construction-time invariants are unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use super::StageState;
use crate::crypto::TrustContext;
use crate::graph::PrerequisiteGraph;
use crate::hasher::{CanonicalError, canonical_bytes, sha256_hex};
use crate::ledger::{EntryDraft, LedgerEntry, LedgerError, RunLedger, StateTransition};
use crate::timefmt;
use crate::versioning::VersionPin;
use crate::waiver::{WaiverManager, WaiverScope};

/// Errors from stage machine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StageMachineError {
    /// The requested edge is not in the allowed-transition table.
    #[error(
        "cannot transition {stage_id} from {from} to {to}; allowed targets: {allowed:?}"
    )]
    InvalidTransition {
        /// The stage whose transition was refused.
        stage_id: String,
        /// Its current state.
        from: StageState,
        /// The requested target state.
        to: StageState,
        /// The targets the table permits from `from`.
        allowed: Vec<StageState>,
    },

    /// A stage cannot enter RUNNING because prerequisites are unmet.
    #[error("cannot start {stage_id}: {}", .reasons.join("; "))]
    PrerequisiteNotMet {
        /// The stage that cannot start.
        stage_id: String,
        /// One human-readable reason per unmet predecessor.
        reasons: Vec<String>,
    },

    /// The stage is not declared in the prerequisite graph.
    #[error("unknown stage: {stage_id}")]
    UnknownStage {
        /// The undeclared stage.
        stage_id: String,
    },

    /// The ledger refused the append; no state advanced.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A payload could not be canonicalized for hashing.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Caller-supplied context for one transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionRequest {
    /// SHA-256 of canonical stage inputs, or empty.
    pub input_hash: String,

    /// SHA-256 of canonical stage outputs, or empty.
    pub output_hash: String,

    /// Content addresses of artifacts produced by the transition.
    pub artifact_refs: Vec<String>,

    /// Caller-supplied waiver references; the machine adds the waivers it
    /// consulted to satisfy prerequisites.
    pub waiver_refs: Vec<String>,

    /// Stage-specific payload; hashed into `payload_hash` when present.
    pub payload: Option<Value>,

    /// Fingerprints of the trust roots active for this run.
    pub trust_context: TrustContext,
}

/// Enforces the stage state machine with prerequisite checking.
pub struct StageMachine {
    ledger: Arc<RunLedger>,
    graph: Arc<PrerequisiteGraph>,
    waivers: Arc<WaiverManager>,
    version_pin: VersionPin,
    states: Mutex<HashMap<String, BTreeMap<String, StageState>>>,
}

impl StageMachine {
    /// Creates a machine over the given ledger, graph, and waiver manager.
    #[must_use]
    pub fn new(
        ledger: Arc<RunLedger>,
        graph: Arc<PrerequisiteGraph>,
        waivers: Arc<WaiverManager>,
        version_pin: VersionPin,
    ) -> Self {
        Self {
            ledger,
            graph,
            waivers,
            version_pin,
            states: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // State management
    // ------------------------------------------------------------------

    /// Initializes all stages of a new run to NOT_STARTED.
    pub fn initialize_run(&self, run_id: &str) -> BTreeMap<String, StageState> {
        let fresh: BTreeMap<String, StageState> = self
            .graph
            .topological_order()
            .into_iter()
            .map(|sid| (sid, StageState::NotStarted))
            .collect();
        let mut states = self.states.lock().expect("lock poisoned");
        states.insert(run_id.to_string(), fresh.clone());
        fresh
    }

    /// Returns the current state of one stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's state must be rebuilt and the ledger
    /// cannot be read.
    pub fn current_state(
        &self,
        run_id: &str,
        stage_id: &str,
    ) -> Result<StageState, StageMachineError> {
        Ok(self
            .snapshot(run_id)?
            .get(stage_id)
            .copied()
            .unwrap_or(StageState::NotStarted))
    }

    /// Returns a snapshot of all stage states for a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's state must be rebuilt and the ledger
    /// cannot be read.
    pub fn all_states(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<String, StageState>, StageMachineError> {
        self.snapshot(run_id)
    }

    /// Whether the run has any stage currently RUNNING.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's state cannot be read.
    pub fn is_active(&self, run_id: &str) -> Result<bool, StageMachineError> {
        Ok(self
            .snapshot(run_id)?
            .values()
            .any(|state| *state == StageState::Running))
    }

    /// Returns the valid target states for a stage right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's state cannot be read.
    pub fn available_transitions(
        &self,
        run_id: &str,
        stage_id: &str,
    ) -> Result<&'static [StageState], StageMachineError> {
        Ok(self.current_state(run_id, stage_id)?.allowed_targets())
    }

    fn snapshot(&self, run_id: &str) -> Result<BTreeMap<String, StageState>, StageMachineError> {
        let mut states = self.states.lock().expect("lock poisoned");
        if let Some(cached) = states.get(run_id) {
            return Ok(cached.clone());
        }
        let rebuilt = self.rebuild(run_id)?;
        states.insert(run_id.to_string(), rebuilt.clone());
        Ok(rebuilt)
    }

    /// Rebuilds in-memory state from the ledger (resume path).
    fn rebuild(&self, run_id: &str) -> Result<BTreeMap<String, StageState>, StageMachineError> {
        let mut states: BTreeMap<String, StageState> = self
            .graph
            .topological_order()
            .into_iter()
            .map(|sid| (sid, StageState::NotStarted))
            .collect();
        for entry in self.ledger.run_entries(run_id)? {
            states.insert(entry.stage_id.clone(), entry.state_transition.to);
        }
        Ok(states)
    }

    // ------------------------------------------------------------------
    // Transition logic
    // ------------------------------------------------------------------

    /// Checks whether a stage can transition to RUNNING.
    ///
    /// Returns `(true, [])` when every direct predecessor is PASSED or
    /// covered by a valid waiver, otherwise one reason per failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's state cannot be read.
    pub fn can_start(
        &self,
        run_id: &str,
        stage_id: &str,
    ) -> Result<(bool, Vec<String>), StageMachineError> {
        if self.graph.definition(stage_id).is_none() {
            return Err(StageMachineError::UnknownStage {
                stage_id: stage_id.to_string(),
            });
        }

        let states = self.snapshot(run_id)?;
        let current = states
            .get(stage_id)
            .copied()
            .unwrap_or(StageState::NotStarted);
        if current != StageState::NotStarted {
            return Ok((
                false,
                vec![format!("stage is currently {current}, not not_started")],
            ));
        }

        let waived = self.waived_predecessors(stage_id, &states);
        if self.graph.prerequisites_met(stage_id, &states, &waived) {
            Ok((true, Vec::new()))
        } else {
            Ok((
                false,
                self.graph.blocking_reasons(stage_id, &states, &waived),
            ))
        }
    }

    /// The waiver scope required to bypass a stage: its id plus its
    /// declared gate name.
    fn required_scope(&self, stage_id: &str) -> Option<WaiverScope> {
        self.graph.definition(stage_id).map(|sd| WaiverScope {
            stage_id: sd.stage_id.clone(),
            gate: sd.gate.clone(),
        })
    }

    /// Predecessors of `stage_id` currently covered by a valid waiver for
    /// their full scope.
    fn waived_predecessors(
        &self,
        stage_id: &str,
        states: &BTreeMap<String, StageState>,
    ) -> BTreeSet<String> {
        let now = timefmt::now_utc_micros();
        self.graph
            .predecessors(stage_id)
            .into_iter()
            .filter(|prereq| {
                states.get(prereq) != Some(&StageState::Passed)
                    && self
                        .required_scope(prereq)
                        .is_some_and(|scope| self.waivers.has_valid_waiver(&scope, now))
            })
            .collect()
    }

    /// Transitions a stage, recording the entry (and any cascade entries)
    /// atomically in the ledger.
    ///
    /// On RUNNING→FAILED, every transitive dependent currently NOT_STARTED
    /// is cascade-blocked. On RUNNING→PASSED, direct dependents that are
    /// BLOCKED and whose prerequisites are now met are unblocked. Both
    /// cascades append their own entries for audit completeness.
    ///
    /// # Errors
    ///
    /// Returns [`StageMachineError::InvalidTransition`] for forbidden
    /// edges, [`StageMachineError::PrerequisiteNotMet`] when entering
    /// RUNNING without satisfied prerequisites, and ledger errors if the
    /// append fails — in which case no state advances.
    pub fn transition(
        &self,
        run_id: &str,
        stage_id: &str,
        target: StageState,
        request: TransitionRequest,
    ) -> Result<LedgerEntry, StageMachineError> {
        if self.graph.definition(stage_id).is_none() {
            return Err(StageMachineError::UnknownStage {
                stage_id: stage_id.to_string(),
            });
        }

        let mut cache = self.states.lock().expect("lock poisoned");
        if !cache.contains_key(run_id) {
            let rebuilt = self.rebuild(run_id)?;
            cache.insert(run_id.to_string(), rebuilt);
        }
        let states = cache.get_mut(run_id).expect("run state just inserted");

        let current = states
            .get(stage_id)
            .copied()
            .unwrap_or(StageState::NotStarted);
        if !current.can_transition_to(target) {
            return Err(StageMachineError::InvalidTransition {
                stage_id: stage_id.to_string(),
                from: current,
                to: target,
                allowed: current.allowed_targets().to_vec(),
            });
        }

        // Prerequisite precondition, and the waivers that satisfy it.
        // Entering RUNNING requires met prerequisites; leaving BLOCKED
        // requires that the blocking predecessor is now PASSED or waived.
        let mut waiver_refs = request.waiver_refs.clone();
        if target == StageState::Running || target == StageState::NotStarted {
            let waived = self.waived_predecessors(stage_id, states);
            if !self.graph.prerequisites_met(stage_id, states, &waived) {
                return Err(StageMachineError::PrerequisiteNotMet {
                    stage_id: stage_id.to_string(),
                    reasons: self.graph.blocking_reasons(stage_id, states, &waived),
                });
            }
            let now = timefmt::now_utc_micros();
            for prereq in &waived {
                if let Some(stored) = self
                    .required_scope(prereq)
                    .and_then(|scope| self.waivers.find_valid(&scope, now))
                {
                    waiver_refs.push(stored.content_address);
                }
            }
        }

        let payload_hash = match &request.payload {
            Some(payload) => sha256_hex(&canonical_bytes(payload)?),
            None => String::new(),
        };

        let mut main = EntryDraft::new(
            run_id,
            stage_id,
            StateTransition::new(current, target),
        );
        main.input_hash = request.input_hash;
        main.output_hash = request.output_hash;
        main.artifact_refs = request.artifact_refs;
        main.waiver_refs = waiver_refs;
        main.trust_context = request.trust_context.clone();
        main.payload_hash = payload_hash;
        main.version_pin = self.version_pin.clone();

        // Cascade effects, appended with the main entry in one transaction.
        let mut drafts = vec![main];
        let mut cascade_targets: Vec<(String, StageState)> = Vec::new();

        if target == StageState::Failed {
            for dependent in self.graph.transitive_dependents(stage_id) {
                if states.get(&dependent) == Some(&StageState::NotStarted) {
                    cascade_targets.push((dependent, StageState::Blocked));
                }
            }
        } else if target == StageState::Passed {
            // Project the stage's new state before re-checking dependents.
            let mut projected = states.clone();
            projected.insert(stage_id.to_string(), StageState::Passed);
            for dependent in self.graph.transitive_dependents(stage_id) {
                if projected.get(&dependent) != Some(&StageState::Blocked) {
                    continue;
                }
                let waived = self.waived_predecessors(&dependent, &projected);
                if self.graph.prerequisites_met(&dependent, &projected, &waived) {
                    cascade_targets.push((dependent, StageState::NotStarted));
                }
            }
        }

        for (dependent, cascade_to) in &cascade_targets {
            let cascade_from = match cascade_to {
                StageState::Blocked => StageState::NotStarted,
                _ => StageState::Blocked,
            };
            let mut cascade = EntryDraft::new(
                run_id,
                dependent,
                StateTransition::new(cascade_from, *cascade_to),
            );
            cascade.trust_context = request.trust_context.clone();
            cascade.version_pin = self.version_pin.clone();
            drafts.push(cascade);
        }

        let mut sealed = self.ledger.append_batch(drafts)?;

        // Only after a successful commit does in-memory state advance.
        states.insert(stage_id.to_string(), target);
        for (dependent, cascade_to) in cascade_targets {
            states.insert(dependent, cascade_to);
        }

        Ok(sealed.remove(0))
    }
}
