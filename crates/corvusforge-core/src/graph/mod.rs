//! Prerequisite DAG over pipeline stages.
//!
//! The graph is static configuration: each stage declares its direct
//! predecessors, and construction rejects cycles. Cascade blocking is a
//! reverse-edge traversal, not a per-stage branch.

// Mutex poisoning and construction-time invariants are unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::StageState;

/// Errors from prerequisite graph construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// The declared edges contain a cycle.
    #[error("prerequisite graph has a cycle: visited {visited} of {total} stages")]
    Cycle {
        /// Stages reachable through topological traversal.
        visited: usize,
        /// Total stages declared.
        total: usize,
    },

    /// A stage names a prerequisite that is not declared.
    #[error("stage {stage_id} names unknown prerequisite {prerequisite}")]
    UnknownPrerequisite {
        /// The declaring stage.
        stage_id: String,
        /// The undeclared prerequisite.
        prerequisite: String,
    },
}

/// Static definition of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stable stage identifier, e.g. `s55_accessibility`.
    pub stage_id: String,

    /// Human-readable name used in blocking reasons.
    pub display_name: String,

    /// Gate name a waiver must carry in its scope to bypass this stage.
    pub gate: String,

    /// Ordering hint; fractional ordinals interleave gate stages.
    pub ordinal: f64,

    /// Direct predecessors that must be PASSED or waived.
    pub prerequisites: Vec<String>,

    /// Whether this stage is a mandatory gate (waiver-eligible).
    pub is_mandatory_gate: bool,
}

impl StageDefinition {
    fn new(
        stage_id: &str,
        display_name: &str,
        gate: &str,
        ordinal: f64,
        prerequisites: &[&str],
        is_mandatory_gate: bool,
    ) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            display_name: display_name.to_string(),
            gate: gate.to_string(),
            ordinal,
            prerequisites: prerequisites.iter().map(ToString::to_string).collect(),
            is_mandatory_gate,
        }
    }
}

/// The standard Corvusforge pipeline stages.
#[must_use]
pub fn default_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("s0_intake", "Intake", "intake", 0.0, &[], false),
        StageDefinition::new(
            "s1_prerequisites",
            "Prerequisites Synthesis",
            "prerequisites",
            1.0,
            &["s0_intake"],
            false,
        ),
        StageDefinition::new(
            "s2_environment",
            "Environment Readiness",
            "environment",
            2.0,
            &["s1_prerequisites"],
            false,
        ),
        StageDefinition::new(
            "s3_test_contracting",
            "Test Contracting",
            "test_contracting",
            3.0,
            &["s2_environment"],
            false,
        ),
        StageDefinition::new(
            "s4_code_plan",
            "Code Plan",
            "code_plan",
            4.0,
            &["s3_test_contracting"],
            false,
        ),
        StageDefinition::new(
            "s5_implementation",
            "Implementation",
            "implementation",
            5.0,
            &["s4_code_plan"],
            false,
        ),
        StageDefinition::new(
            "s55_accessibility",
            "Accessibility Gate",
            "accessibility",
            5.5,
            &["s5_implementation"],
            true,
        ),
        StageDefinition::new(
            "s575_security",
            "Security & Red Team Gate",
            "security",
            5.75,
            &["s5_implementation"],
            true,
        ),
        StageDefinition::new(
            "s6_verification",
            "Verification",
            "verification",
            6.0,
            &["s55_accessibility", "s575_security"],
            false,
        ),
        StageDefinition::new(
            "s7_release",
            "Release & Attestation",
            "release",
            7.0,
            &["s6_verification"],
            false,
        ),
    ]
}

/// Directed acyclic graph of stage prerequisites.
#[derive(Debug)]
pub struct PrerequisiteGraph {
    stages: BTreeMap<String, StageDefinition>,
    prerequisites: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl PrerequisiteGraph {
    /// Builds the graph from stage definitions.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownPrerequisite`] for dangling edges and
    /// [`GraphError::Cycle`] if the edges are not acyclic.
    pub fn new(definitions: Vec<StageDefinition>) -> Result<Self, GraphError> {
        let stages: BTreeMap<String, StageDefinition> = definitions
            .iter()
            .map(|sd| (sd.stage_id.clone(), sd.clone()))
            .collect();

        let mut prerequisites: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sd in &definitions {
            prerequisites.insert(sd.stage_id.clone(), sd.prerequisites.clone());
            dependents.entry(sd.stage_id.clone()).or_default();
        }
        for sd in &definitions {
            for prereq in &sd.prerequisites {
                let Some(entry) = dependents.get_mut(prereq) else {
                    return Err(GraphError::UnknownPrerequisite {
                        stage_id: sd.stage_id.clone(),
                        prerequisite: prereq.clone(),
                    });
                };
                entry.push(sd.stage_id.clone());
            }
        }

        let graph = Self {
            stages,
            prerequisites,
            dependents,
        };
        graph.validate_acyclic()?;
        Ok(graph)
    }

    /// Builds the graph over the default pipeline stages.
    ///
    /// # Errors
    ///
    /// The default stages are acyclic; this errors only if they are edited
    /// into an invalid shape.
    pub fn standard() -> Result<Self, GraphError> {
        Self::new(default_stages())
    }

    /// Kahn's algorithm; every node must be reachable or there is a cycle.
    fn validate_acyclic(&self) -> Result<(), GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .prerequisites
            .iter()
            .map(|(sid, prereqs)| (sid.as_str(), prereqs.len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(sid, _)| *sid)
            .collect();

        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            if let Some(deps) = self.dependents.get(node) {
                for dep in deps {
                    let deg = in_degree
                        .get_mut(dep.as_str())
                        .expect("dependent is a declared stage");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }

        if visited == self.stages.len() {
            Ok(())
        } else {
            Err(GraphError::Cycle {
                visited,
                total: self.stages.len(),
            })
        }
    }

    /// Returns the definition for a stage, if declared.
    #[must_use]
    pub fn definition(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.stages.get(stage_id)
    }

    /// Returns all declared stage identifiers in topological order, with
    /// ordinal as the tie-break.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let ordinal = |sid: &str| {
            self.stages
                .get(sid)
                .map_or(f64::MAX, |sd| sd.ordinal)
        };

        let mut in_degree: BTreeMap<String, usize> = self
            .prerequisites
            .iter()
            .map(|(sid, prereqs)| (sid.clone(), prereqs.len()))
            .collect();

        let mut ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(sid, _)| sid.clone())
            .collect();
        ready.sort_by(|a, b| ordinal(a).total_cmp(&ordinal(b)));
        let mut queue: VecDeque<String> = ready.into();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            let mut newly_ready = Vec::new();
            for dep in self.dependents.get(&node).into_iter().flatten() {
                let deg = in_degree.get_mut(dep).expect("dependent is declared");
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(dep.clone());
                }
            }
            newly_ready.sort_by(|a, b| ordinal(a).total_cmp(&ordinal(b)));
            queue.extend(newly_ready);
        }
        order
    }

    /// Direct predecessors of a stage.
    #[must_use]
    pub fn predecessors(&self, stage_id: &str) -> Vec<String> {
        self.prerequisites.get(stage_id).cloned().unwrap_or_default()
    }

    /// All transitive dependents of a stage (BFS over reverse edges).
    #[must_use]
    pub fn transitive_dependents(&self, stage_id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = self
            .dependents
            .get(stage_id)
            .cloned()
            .unwrap_or_default()
            .into();

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }
            queue.extend(self.dependents.get(&node).cloned().unwrap_or_default());
            result.push(node);
        }
        result
    }

    /// Whether every direct predecessor is PASSED or named in `waived`.
    #[must_use]
    pub fn prerequisites_met(
        &self,
        stage_id: &str,
        states: &BTreeMap<String, StageState>,
        waived: &BTreeSet<String>,
    ) -> bool {
        self.predecessors(stage_id).iter().all(|prereq| {
            states.get(prereq) == Some(&StageState::Passed) || waived.contains(prereq)
        })
    }

    /// Human-readable reasons a stage cannot start, one per unmet
    /// predecessor.
    #[must_use]
    pub fn blocking_reasons(
        &self,
        stage_id: &str,
        states: &BTreeMap<String, StageState>,
        waived: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut reasons = Vec::new();
        for prereq in self.predecessors(stage_id) {
            let state = states
                .get(&prereq)
                .copied()
                .unwrap_or(StageState::NotStarted);
            if state != StageState::Passed && !waived.contains(&prereq) {
                let name = self
                    .stages
                    .get(&prereq)
                    .map_or(prereq.clone(), |sd| sd.display_name.clone());
                reasons.push(format!("{name} ({prereq}) is {state}"));
            }
        }
        reasons
    }
}
