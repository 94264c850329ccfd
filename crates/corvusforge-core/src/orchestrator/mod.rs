//! The pipeline orchestrator: thin composition over the integrity core.
//!
//! Construction runs the production guard, wires the ledger, artifact
//! store, prerequisite graph, waiver manager, and stage machine together,
//! and computes the trust context once. Every transition the orchestrator
//! drives seals that trust context into its ledger entry.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{ArtifactError, FsArtifactStore};
use crate::config::ForgeConfig;
use crate::crypto::{ProviderChain, TrustContext, compute_trust_context};
use crate::graph::{GraphError, PrerequisiteGraph};
use crate::guard::{ProductionGuardError, enforce_production_guard, waiver_signature_required};
use crate::hasher::{CanonicalError, compute_input_hash, compute_output_hash};
use crate::ledger::{LedgerAnchor, LedgerEntry, LedgerError, RunLedger, SignedAnchor};
use crate::stage::{StageMachine, StageMachineError, StageState, TransitionRequest};
use crate::timefmt;
use crate::versioning::VersionPin;
use crate::waiver::WaiverManager;

/// Result type for stage handlers.
pub type HandlerResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// A registered stage handler.
///
/// Handlers are opaque to the core: they may take arbitrary time and use
/// their own parallelism, but must not re-enter the orchestrator for the
/// same run.
pub trait StageHandler: Send + Sync {
    /// Executes the stage, returning its result payload.
    ///
    /// # Errors
    ///
    /// A handler error fails the stage: the orchestrator records a FAILED
    /// transition and cascade-blocks dependents.
    fn run(&self, run_id: &str, payload: &Value) -> HandlerResult;
}

impl<F> StageHandler for F
where
    F: Fn(&str, &Value) -> HandlerResult + Send + Sync,
{
    fn run(&self, run_id: &str, payload: &Value) -> HandlerResult {
        self(run_id, payload)
    }
}

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Production constraints are violated; the orchestrator refuses to
    /// start.
    #[error(transparent)]
    Guard(#[from] ProductionGuardError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Stage machine refusal or failure.
    #[error(transparent)]
    StageMachine(#[from] StageMachineError),

    /// Artifact store failure.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Prerequisite graph construction failure.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Canonicalization failure.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// A stage handler failed; the FAILED transition has been recorded.
    #[error("stage {stage_id} handler failed: {message}")]
    Handler {
        /// The failed stage.
        stage_id: String,
        /// The handler's error message.
        message: String,
    },
}

/// Central pipeline orchestrator.
pub struct Orchestrator {
    config: ForgeConfig,
    crypto: Arc<ProviderChain>,
    ledger: Arc<RunLedger>,
    artifacts: Arc<FsArtifactStore>,
    waivers: Arc<WaiverManager>,
    machine: StageMachine,
    trust_context: TrustContext,
    handlers: HashMap<String, Box<dyn StageHandler>>,
    run_id: String,
}

impl Orchestrator {
    /// Builds an orchestrator with the default probed crypto chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the production guard fails or any subsystem
    /// cannot be opened.
    pub fn new(config: ForgeConfig) -> Result<Self, OrchestratorError> {
        Self::with_crypto(config, Arc::new(ProviderChain::probe()))
    }

    /// Builds an orchestrator over an explicit crypto chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the production guard fails or any subsystem
    /// cannot be opened.
    pub fn with_crypto(
        config: ForgeConfig,
        crypto: Arc<ProviderChain>,
    ) -> Result<Self, OrchestratorError> {
        enforce_production_guard(&config, &crypto)?;

        let ledger = Arc::new(RunLedger::open(&config.ledger_path)?);
        let artifacts = Arc::new(FsArtifactStore::open(&config.artifact_dir)?);
        let graph = Arc::new(PrerequisiteGraph::standard()?);
        let waivers = Arc::new(WaiverManager::new(
            Arc::clone(&artifacts),
            Arc::clone(&crypto),
            waiver_signature_required(&config),
        ));
        let machine = StageMachine::new(
            Arc::clone(&ledger),
            graph,
            Arc::clone(&waivers),
            VersionPin::default(),
        );

        // Key fingerprints are fixed for the orchestrator's lifetime;
        // rotations show up as a new orchestrator with a new context.
        let trust_context = compute_trust_context(
            &config.plugin_trust_root_public_hex,
            &config.waiver_signing_key_public_hex,
            &config.anchor_signing_key_public_hex,
        );

        let timestamp = timefmt::now_utc_micros().format("%Y%m%d-%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!("cf-{timestamp}-{}", &suffix[..6]);

        Ok(Self {
            config,
            crypto,
            ledger,
            artifacts,
            waivers,
            machine,
            trust_context,
            handlers: HashMap::new(),
            run_id,
        })
    }

    fn request(&self) -> TransitionRequest {
        TransitionRequest {
            trust_context: self.trust_context.clone(),
            ..TransitionRequest::default()
        }
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// Initializes a new run and records the intake transition pair.
    ///
    /// Returns the run identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the intake transitions cannot be recorded.
    pub fn start_run(&self, prerequisites: Option<Value>) -> Result<String, OrchestratorError> {
        self.machine.initialize_run(&self.run_id);

        let intake_payload = json!({ "prerequisites": prerequisites.unwrap_or(json!([])) });
        let mut running = self.request();
        running.input_hash = compute_input_hash("s0_intake", &intake_payload)?;
        running.payload = Some(intake_payload);
        self.machine
            .transition(&self.run_id, "s0_intake", StageState::Running, running)?;

        let outputs = json!({ "run_id": self.run_id });
        let mut passed = self.request();
        passed.output_hash = compute_output_hash("s0_intake", &outputs)?;
        self.machine
            .transition(&self.run_id, "s0_intake", StageState::Passed, passed)?;

        tracing::info!(run_id = %self.run_id, "run started");
        Ok(self.run_id.clone())
    }

    /// Points the orchestrator at an existing run, rebuilding state from
    /// the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn resume_run(
        &mut self,
        run_id: &str,
    ) -> Result<std::collections::BTreeMap<String, StageState>, OrchestratorError> {
        self.run_id = run_id.to_string();
        Ok(self.machine.all_states(run_id)?)
    }

    // ------------------------------------------------------------------
    // Stage execution
    // ------------------------------------------------------------------

    /// Registers a handler for a stage.
    pub fn register_handler(&mut self, stage_id: &str, handler: Box<dyn StageHandler>) {
        self.handlers.insert(stage_id.to_string(), handler);
    }

    /// Executes a stage through its registered handler.
    ///
    /// Transitions RUNNING (prerequisites checked, input hash sealed),
    /// invokes the handler, then transitions PASSED with the output hash
    /// and any artifact references the handler returned — or FAILED with
    /// the error, cascade-blocking dependents. A stage left BLOCKED by an
    /// earlier failure is unblocked first when its prerequisites are now
    /// met.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Handler`] when the handler fails (the
    /// FAILED entry is already recorded), or the stage machine's refusal.
    pub fn execute_stage(
        &self,
        stage_id: &str,
        payload: Value,
    ) -> Result<Value, OrchestratorError> {
        // Recover from an earlier cascade block if the path has reopened.
        if self.machine.current_state(&self.run_id, stage_id)? == StageState::Blocked {
            self.machine.transition(
                &self.run_id,
                stage_id,
                StageState::NotStarted,
                self.request(),
            )?;
        }

        let input_hash = compute_input_hash(stage_id, &payload)?;
        let mut running = self.request();
        running.input_hash.clone_from(&input_hash);
        running.payload = Some(payload.clone());
        self.machine
            .transition(&self.run_id, stage_id, StageState::Running, running)?;

        let result = match self.handlers.get(stage_id) {
            Some(handler) => match handler.run(&self.run_id, &payload) {
                Ok(result) => result,
                Err(err) => {
                    let message = err.to_string();
                    let mut failed = self.request();
                    failed.input_hash.clone_from(&input_hash);
                    failed.output_hash =
                        compute_output_hash(stage_id, &json!({ "error": message }))?;
                    self.machine.transition(
                        &self.run_id,
                        stage_id,
                        StageState::Failed,
                        failed,
                    )?;
                    return Err(OrchestratorError::Handler {
                        stage_id: stage_id.to_string(),
                        message,
                    });
                },
            },
            None => json!({ "status": "passed", "note": "no handler registered" }),
        };

        let artifact_refs = result
            .get("artifact_refs")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut passed = self.request();
        passed.input_hash = input_hash;
        passed.output_hash = compute_output_hash(stage_id, &result)?;
        passed.artifact_refs = artifact_refs;
        self.machine
            .transition(&self.run_id, stage_id, StageState::Passed, passed)?;

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Queries and delegation
    // ------------------------------------------------------------------

    /// The current run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// The trust context sealed into this orchestrator's entries.
    #[must_use]
    pub const fn trust_context(&self) -> &TrustContext {
        &self.trust_context
    }

    /// The waiver manager.
    #[must_use]
    pub fn waiver_manager(&self) -> &Arc<WaiverManager> {
        &self.waivers
    }

    /// The artifact store.
    #[must_use]
    pub fn artifact_store(&self) -> &Arc<FsArtifactStore> {
        &self.artifacts
    }

    /// The crypto provider chain.
    #[must_use]
    pub fn crypto(&self) -> &Arc<ProviderChain> {
        &self.crypto
    }

    /// Current states of all stages in the run.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub fn get_states(
        &self,
    ) -> Result<std::collections::BTreeMap<String, StageState>, OrchestratorError> {
        Ok(self.machine.all_states(&self.run_id)?)
    }

    /// Current state of one stage.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub fn get_stage_state(&self, stage_id: &str) -> Result<StageState, OrchestratorError> {
        Ok(self.machine.current_state(&self.run_id, stage_id)?)
    }

    /// Whether a stage can start, with reasons when it cannot.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub fn can_start(&self, stage_id: &str) -> Result<(bool, Vec<String>), OrchestratorError> {
        Ok(self.machine.can_start(&self.run_id, stage_id)?)
    }

    /// All ledger entries of the current run.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn get_run_entries(&self) -> Result<Vec<LedgerEntry>, OrchestratorError> {
        Ok(self.ledger.run_entries(&self.run_id)?)
    }

    /// Verifies the hash chain of the current run.
    ///
    /// # Errors
    ///
    /// Returns a ledger integrity error if the chain is broken.
    pub fn verify_chain(&self) -> Result<(), OrchestratorError> {
        Ok(self.ledger.verify_chain(&self.run_id)?)
    }

    /// Exports an anchor for the current run.
    ///
    /// # Errors
    ///
    /// Returns an error if the anchor cannot be built.
    pub fn export_anchor(&self) -> Result<LedgerAnchor, OrchestratorError> {
        Ok(self.ledger.export_anchor(&self.run_id)?)
    }

    /// Exports a signed anchor for the current run using the configured
    /// anchor key.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails (including fail-closed crypto).
    pub fn export_signed_anchor(
        &self,
        anchor_private_hex: &str,
    ) -> Result<SignedAnchor, OrchestratorError> {
        Ok(self.ledger.export_signed_anchor(
            &self.run_id,
            &self.crypto,
            anchor_private_hex,
            &self.config.anchor_signing_key_public_hex,
        )?)
    }
}

#[cfg(test)]
mod unit_tests {
    use tempfile::TempDir;

    use super::*;

    fn debug_orchestrator() -> (Orchestrator, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = ForgeConfig {
            ledger_path: dir.path().join("ledger.db"),
            artifact_dir: dir.path().join("artifacts"),
            ..ForgeConfig::default()
        };
        (Orchestrator::new(config).unwrap(), dir)
    }

    #[test]
    fn test_start_run_records_intake_pair() {
        let (orchestrator, _dir) = debug_orchestrator();
        let run_id = orchestrator.start_run(None).unwrap();
        assert!(run_id.starts_with("cf-"));

        let entries = orchestrator.get_run_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state_transition.to_string(), "not_started->running");
        assert_eq!(entries[1].state_transition.to_string(), "running->passed");
        assert!(!entries[0].input_hash.is_empty());
        assert!(!entries[1].output_hash.is_empty());
        orchestrator.verify_chain().unwrap();
    }

    #[test]
    fn test_execute_stage_without_handler_passes_through() {
        let (orchestrator, _dir) = debug_orchestrator();
        orchestrator.start_run(None).unwrap();

        let result = orchestrator
            .execute_stage("s1_prerequisites", json!({}))
            .unwrap();
        assert_eq!(result["status"], "passed");
        assert_eq!(
            orchestrator.get_stage_state("s1_prerequisites").unwrap(),
            StageState::Passed
        );
    }

    #[test]
    fn test_handler_result_hashed_and_artifacts_sealed() {
        let (mut orchestrator, _dir) = debug_orchestrator();
        orchestrator.register_handler(
            "s1_prerequisites",
            Box::new(|_run_id: &str, _payload: &Value| -> HandlerResult {
                Ok(json!({
                    "status": "passed",
                    "artifact_refs": ["sha256:aaaa", "sha256:bbbb"]
                }))
            }),
        );
        orchestrator.start_run(None).unwrap();
        orchestrator
            .execute_stage("s1_prerequisites", json!({"input": 1}))
            .unwrap();

        let entries = orchestrator.get_run_entries().unwrap();
        let passed = entries
            .iter()
            .find(|e| {
                e.stage_id == "s1_prerequisites"
                    && e.state_transition.to == StageState::Passed
            })
            .unwrap();
        assert_eq!(passed.artifact_refs, vec!["sha256:aaaa", "sha256:bbbb"]);
        assert!(!passed.output_hash.is_empty());
        assert!(!passed.input_hash.is_empty());
    }

    #[test]
    fn test_handler_failure_records_failed_and_cascades() {
        let (mut orchestrator, _dir) = debug_orchestrator();
        orchestrator.register_handler(
            "s1_prerequisites",
            Box::new(|_: &str, _: &Value| -> HandlerResult {
                Err("dependency resolution failed".into())
            }),
        );
        orchestrator.start_run(None).unwrap();

        let err = orchestrator
            .execute_stage("s1_prerequisites", json!({}))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Handler { .. }));

        let states = orchestrator.get_states().unwrap();
        assert_eq!(
            states.get("s1_prerequisites"),
            Some(&StageState::Failed)
        );
        // Everything downstream is cascade-blocked.
        assert_eq!(states.get("s7_release"), Some(&StageState::Blocked));
        orchestrator.verify_chain().unwrap();
    }

    #[test]
    fn test_entries_carry_trust_context() {
        let dir = TempDir::new().unwrap();
        let config = ForgeConfig {
            ledger_path: dir.path().join("ledger.db"),
            artifact_dir: dir.path().join("artifacts"),
            plugin_trust_root_public_hex: "cc".repeat(32),
            ..ForgeConfig::default()
        };
        let orchestrator = Orchestrator::new(config).unwrap();
        orchestrator.start_run(None).unwrap();

        let expected = orchestrator.trust_context().clone();
        assert!(!expected.plugin_trust_root_fp.is_empty());
        for entry in orchestrator.get_run_entries().unwrap() {
            assert_eq!(entry.trust_context, expected);
        }
    }

    #[test]
    fn test_production_guard_blocks_construction() {
        let dir = TempDir::new().unwrap();
        let config = ForgeConfig {
            environment: crate::config::Environment::Production,
            ledger_path: dir.path().join("ledger.db"),
            artifact_dir: dir.path().join("artifacts"),
            ..ForgeConfig::default()
        };
        assert!(matches!(
            Orchestrator::new(config),
            Err(OrchestratorError::Guard(_))
        ));
    }

    #[test]
    fn test_resume_run_sees_prior_state() {
        let dir = TempDir::new().unwrap();
        let config = ForgeConfig {
            ledger_path: dir.path().join("ledger.db"),
            artifact_dir: dir.path().join("artifacts"),
            ..ForgeConfig::default()
        };
        let first = Orchestrator::new(config.clone()).unwrap();
        let run_id = first.start_run(None).unwrap();
        first.execute_stage("s1_prerequisites", json!({})).unwrap();

        let mut second = Orchestrator::new(config).unwrap();
        let states = second.resume_run(&run_id).unwrap();
        assert_eq!(states.get("s1_prerequisites"), Some(&StageState::Passed));
        second.execute_stage("s2_environment", json!({})).unwrap();
        second.verify_chain().unwrap();
    }
}
