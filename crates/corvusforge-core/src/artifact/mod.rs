//! Content-addressed, immutable artifact store.
//!
//! Every artifact is stored under its SHA-256 digest:
//! `{base}/{hex[0..2]}/{hex[2..4]}/{hex}.dat` with a `.meta.json` sidecar
//! carrying the media type. Storing identical content twice is a no-op.
//! There is no update and no delete — the address IS the identity, and a
//! mismatch between bytes and address is corruption, not a versioning
//! event.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hasher::sha256_hex;

/// Prefix used in produced content addresses.
const ADDRESS_PREFIX: &str = "sha256:";

/// Errors from artifact store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArtifactError {
    /// Stored bytes no longer match their content address.
    #[error("artifact integrity failure at {content_address}: stored bytes hash to {actual}")]
    Integrity {
        /// The address whose content failed verification.
        content_address: String,
        /// The digest the stored bytes actually hash to.
        actual: String,
    },

    /// No artifact exists at the given address.
    #[error("artifact not found: {content_address}")]
    NotFound {
        /// The missing address.
        content_address: String,
    },

    /// I/O error from the backing filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sidecar metadata could not be parsed.
    #[error("invalid artifact metadata for {content_address}: {source}")]
    Metadata {
        /// The address whose metadata is unreadable.
        content_address: String,
        /// The underlying parse error.
        source: serde_json::Error,
    },
}

/// An artifact retrieved from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// `sha256:<hex>` content address.
    pub content_address: String,

    /// Size of the artifact in bytes.
    pub size_bytes: u64,

    /// MIME type recorded at store time.
    pub media_type: String,

    /// The artifact bytes, verified against the address on read.
    pub bytes: Vec<u8>,
}

/// Sidecar metadata persisted next to each blob.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    media_type: String,
    size_bytes: u64,
}

/// SHA-256 keyed, immutable, filesystem-backed artifact store.
#[derive(Debug)]
pub struct FsArtifactStore {
    base: PathBuf,
}

impl FsArtifactStore {
    /// Opens (creating if necessary) a store rooted at `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(base: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Strips the `sha256:` prefix from a content address, if present.
    fn digest_of(content_address: &str) -> &str {
        content_address
            .strip_prefix(ADDRESS_PREFIX)
            .unwrap_or(content_address)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.base
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(format!("{digest}.dat"))
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.base
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(format!("{digest}.meta.json"))
    }

    /// Stores bytes, returning the `sha256:<hex>` content address.
    ///
    /// Idempotent: identical bytes return the same address without a
    /// rewrite. An existing blob is re-verified before being trusted.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Integrity`] if an existing blob at the same
    /// address fails verification, or an I/O error.
    pub fn put(&self, bytes: &[u8], media_type: &str) -> Result<String, ArtifactError> {
        let digest = sha256_hex(bytes);
        let content_address = format!("{ADDRESS_PREFIX}{digest}");
        let path = self.blob_path(&digest);

        if path.exists() {
            if !self.verify(&content_address)? {
                let stored = fs::read(&path)?;
                return Err(ArtifactError::Integrity {
                    content_address,
                    actual: sha256_hex(&stored),
                });
            }
            return Ok(content_address);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        let meta = ArtifactMeta {
            media_type: media_type.to_string(),
            size_bytes: bytes.len() as u64,
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(|source| ArtifactError::Metadata {
            content_address: content_address.clone(),
            source,
        })?;
        fs::write(self.meta_path(&digest), meta_bytes)?;
        Ok(content_address)
    }

    /// Retrieves an artifact, re-verifying its hash on read.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if the address is absent and
    /// [`ArtifactError::Integrity`] if the stored bytes do not hash to the
    /// address.
    pub fn get(&self, content_address: &str) -> Result<Artifact, ArtifactError> {
        let digest = Self::digest_of(content_address);
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(ArtifactError::NotFound {
                content_address: content_address.to_string(),
            });
        }

        let bytes = fs::read(&path)?;
        let actual = sha256_hex(&bytes);
        if actual != digest {
            return Err(ArtifactError::Integrity {
                content_address: content_address.to_string(),
                actual,
            });
        }

        let media_type = match fs::read(self.meta_path(digest)) {
            Ok(raw) => serde_json::from_slice::<ArtifactMeta>(&raw)
                .map_err(|source| ArtifactError::Metadata {
                    content_address: content_address.to_string(),
                    source,
                })?
                .media_type,
            Err(_) => "application/octet-stream".to_string(),
        };

        Ok(Artifact {
            content_address: format!("{ADDRESS_PREFIX}{digest}"),
            size_bytes: bytes.len() as u64,
            media_type,
            bytes,
        })
    }

    /// Checks whether an artifact exists.
    #[must_use]
    pub fn exists(&self, content_address: &str) -> bool {
        self.blob_path(Self::digest_of(content_address)).exists()
    }

    /// Re-hashes stored bytes and compares against the address.
    ///
    /// Returns `false` for absent artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures while reading.
    pub fn verify(&self, content_address: &str) -> Result<bool, ArtifactError> {
        let digest = Self::digest_of(content_address);
        let path = self.blob_path(digest);
        if !path.exists() {
            return Ok(false);
        }
        Ok(sha256_hex(&fs::read(&path)?) == digest)
    }
}
