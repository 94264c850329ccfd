//! Bundled envelope sinks.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use super::{EnvelopeSink, SinkError};
use crate::artifact::FsArtifactStore;
use crate::envelope::Envelope;

/// Appends each envelope as one canonical JSON line to a local file.
pub struct JsonlFileSink {
    name: String,
    path: PathBuf,
}

impl JsonlFileSink {
    /// Creates a sink writing to `path`.
    #[must_use]
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
        }
    }
}

impl EnvelopeSink for JsonlFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let mut line = envelope
            .canonical_bytes()
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Stores each envelope's canonical bytes in the artifact store.
pub struct ArtifactStoreSink {
    name: String,
    store: Arc<FsArtifactStore>,
}

impl ArtifactStoreSink {
    /// Creates a sink backed by the given store.
    #[must_use]
    pub fn new(name: &str, store: Arc<FsArtifactStore>) -> Self {
        Self {
            name: name.to_string(),
            store,
        }
    }
}

impl EnvelopeSink for ArtifactStoreSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let bytes = envelope
            .canonical_bytes()
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        self.store
            .put(&bytes, "application/json")
            .map_err(|e| SinkError::Other(e.to_string()))?;
        Ok(())
    }
}
