//! Envelope fan-out with per-sink failure isolation.
//!
//! Every envelope dispatched here is offered to every registered sink. A
//! failure in one sink never prevents delivery to the others; only a total
//! failure raises.

mod sinks;

use std::collections::BTreeMap;

use thiserror::Error;

pub use sinks::{ArtifactStoreSink, JsonlFileSink};

use crate::envelope::Envelope;

/// Error returned by a sink's write.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// I/O failure inside the sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The envelope could not be serialized for this sink.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other sink-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Raised only when every registered sink failed for an envelope.
#[derive(Debug, Error)]
#[error("all {failed} sinks failed for envelope {envelope_id}: {details}")]
pub struct SinkDispatchError {
    /// The envelope nothing accepted.
    pub envelope_id: String,

    /// How many sinks failed.
    pub failed: usize,

    /// Per-sink failure details.
    pub details: String,
}

/// A destination for dispatched envelopes.
///
/// Retry is a sink-internal concern; the dispatcher never retries.
pub trait EnvelopeSink: Send + Sync {
    /// Registry name of this sink.
    fn name(&self) -> &str;

    /// Accepts one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the envelope; the
    /// dispatcher records the failure and continues with other sinks.
    fn write(&self, envelope: &Envelope) -> Result<(), SinkError>;
}

/// Routes envelopes to ALL registered sinks.
#[derive(Default)]
pub struct SinkDispatcher {
    sinks: BTreeMap<String, Box<dyn EnvelopeSink>>,
}

impl SinkDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink under its own name. Re-registering a name replaces
    /// the previous sink.
    pub fn register_sink(&mut self, sink: Box<dyn EnvelopeSink>) {
        let name = sink.name().to_string();
        tracing::info!(sink = %name, "registered sink");
        self.sinks.insert(name, sink);
    }

    /// Removes a sink by name.
    pub fn unregister_sink(&mut self, name: &str) {
        if self.sinks.remove(name).is_some() {
            tracing::info!(sink = %name, "unregistered sink");
        }
    }

    /// Names of the registered sinks.
    #[must_use]
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.keys().cloned().collect()
    }

    /// Dispatches an envelope to every registered sink in isolation.
    ///
    /// Returns per-sink success. An empty registry returns an empty map
    /// without error.
    ///
    /// # Errors
    ///
    /// Returns [`SinkDispatchError`] only when every sink failed.
    pub fn dispatch(
        &self,
        envelope: &Envelope,
    ) -> Result<BTreeMap<String, bool>, SinkDispatchError> {
        if self.sinks.is_empty() {
            tracing::warn!(
                envelope_id = %envelope.envelope_id,
                "no sinks registered; envelope dropped"
            );
            return Ok(BTreeMap::new());
        }

        let mut results = BTreeMap::new();
        let mut failures: Vec<(String, SinkError)> = Vec::new();

        for (name, sink) in &self.sinks {
            match sink.write(envelope) {
                Ok(()) => {
                    results.insert(name.clone(), true);
                },
                Err(err) => {
                    tracing::error!(
                        sink = %name,
                        envelope_id = %envelope.envelope_id,
                        error = %err,
                        "sink write failed"
                    );
                    results.insert(name.clone(), false);
                    failures.push((name.clone(), err));
                },
            }
        }

        if failures.len() == self.sinks.len() {
            return Err(SinkDispatchError {
                envelope_id: envelope.envelope_id.clone(),
                failed: failures.len(),
                details: failures
                    .iter()
                    .map(|(name, err)| format!("{name}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        Ok(results)
    }

    /// Dispatches a batch, continuing across envelopes regardless of
    /// individual failures.
    ///
    /// A total per-envelope failure is recorded in that envelope's result
    /// map rather than aborting the batch.
    #[must_use]
    pub fn dispatch_batch(
        &self,
        envelopes: &[Envelope],
    ) -> BTreeMap<String, BTreeMap<String, bool>> {
        let mut results = BTreeMap::new();
        for envelope in envelopes {
            let per_sink = match self.dispatch(envelope) {
                Ok(map) => map,
                Err(_) => self.sink_names().into_iter().map(|n| (n, false)).collect(),
            };
            results.insert(envelope.envelope_id.clone(), per_sink);
        }
        results
    }
}

#[cfg(test)]
mod unit_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::envelope::EnvelopeKind;

    struct WorkingSink {
        name: String,
        accepted: AtomicUsize,
    }

    impl EnvelopeSink for WorkingSink {
        fn name(&self) -> &str {
            &self.name
        }
        fn write(&self, _envelope: &Envelope) -> Result<(), SinkError> {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ThrowingSink;

    impl EnvelopeSink for ThrowingSink {
        fn name(&self) -> &str {
            "throwing"
        }
        fn write(&self, _envelope: &Envelope) -> Result<(), SinkError> {
            Err(SinkError::Other("sink exploded".to_string()))
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(EnvelopeKind::Event, "r1", "a", "b", json!({"k": "v"})).unwrap()
    }

    #[test]
    fn test_empty_registry_returns_empty_map() {
        let dispatcher = SinkDispatcher::new();
        let results = dispatcher.dispatch(&envelope()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_one_throwing_one_working() {
        let mut dispatcher = SinkDispatcher::new();
        dispatcher.register_sink(Box::new(WorkingSink {
            name: "working".to_string(),
            accepted: AtomicUsize::new(0),
        }));
        dispatcher.register_sink(Box::new(ThrowingSink));

        let results = dispatcher.dispatch(&envelope()).unwrap();
        assert_eq!(results.get("working"), Some(&true));
        assert_eq!(results.get("throwing"), Some(&false));
    }

    #[test]
    fn test_all_failing_raises() {
        let mut dispatcher = SinkDispatcher::new();
        dispatcher.register_sink(Box::new(ThrowingSink));

        let err = dispatcher.dispatch(&envelope()).unwrap_err();
        assert_eq!(err.failed, 1);
        assert!(err.details.contains("sink exploded"));
    }

    #[test]
    fn test_batch_continues_past_total_failures() {
        let mut dispatcher = SinkDispatcher::new();
        dispatcher.register_sink(Box::new(ThrowingSink));

        let envelopes = vec![envelope(), envelope()];
        let results = dispatcher.dispatch_batch(&envelopes);
        assert_eq!(results.len(), 2);
        for per_sink in results.values() {
            assert_eq!(per_sink.get("throwing"), Some(&false));
        }
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut dispatcher = SinkDispatcher::new();
        dispatcher.register_sink(Box::new(WorkingSink {
            name: "dup".to_string(),
            accepted: AtomicUsize::new(0),
        }));
        dispatcher.register_sink(Box::new(WorkingSink {
            name: "dup".to_string(),
            accepted: AtomicUsize::new(0),
        }));
        assert_eq!(dispatcher.sink_names(), vec!["dup"]);
    }

    #[test]
    fn test_unregister() {
        let mut dispatcher = SinkDispatcher::new();
        dispatcher.register_sink(Box::new(ThrowingSink));
        dispatcher.unregister_sink("throwing");
        assert!(dispatcher.sink_names().is_empty());
    }
}
