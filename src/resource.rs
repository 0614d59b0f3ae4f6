//! The static resource served to every client.
//!
//! Loaded once at startup and frozen: the bytes are reference counted and
//! never mutated, so every connection can read them without locking.

use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Immutable body shared by all connections.
#[derive(Debug, Clone)]
pub struct StaticResource {
    bytes: Bytes,
}

impl StaticResource {
    /// Read the whole file into memory.
    pub fn load(path: &Path) -> Result<Self, ResourceError> {
        let contents = std::fs::read(path).map_err(|source| ResourceError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from(contents))
    }

    /// Length in bytes, as advertised in `Content-Length`.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A cheap handle to the same bytes.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl From<Vec<u8>> for StaticResource {
    fn from(contents: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(contents),
        }
    }
}

impl From<&'static [u8]> for StaticResource {
    fn from(contents: &'static [u8]) -> Self {
        Self {
            bytes: Bytes::from_static(contents),
        }
    }
}

/// The resource could not be read at startup.
#[derive(Debug)]
pub struct ResourceError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to load resource '{}': {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
