//! The externally supplied sandbox binary.
//!
//! The interpreter build is versioned independently of this crate, so every
//! module carries a SHA-256 digest that ends up in the evaluation span.

use anyhow::{anyhow, Error};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Wasm (or wat) bytes of the PAC interpreter.
///
/// Cheap to clone. Only the bytes are shared between evaluations; every call
/// compiles and instantiates its own copy.
#[derive(Clone)]
pub struct SandboxModule {
    bytes: Arc<[u8]>,
    digest: String,
}

impl SandboxModule {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Self {
            bytes: bytes.into(),
            digest,
        }
    }

    /// Load a module from disk.
    ///
    /// Only `.wasm` and `.wat` files are accepted.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let canonical = path
            .canonicalize()
            .map_err(|e| anyhow!("Invalid module path '{}': {}", path.display(), e))?;

        if !canonical.is_file() {
            return Err(anyhow!("Module path must be a file: {}", canonical.display()));
        }

        if !Self::is_extension_allowed(&canonical) {
            return Err(anyhow!(
                "Only .wasm and .wat files allowed, got: {}",
                canonical.display()
            ));
        }

        let bytes = std::fs::read(&canonical)
            .map_err(|e| anyhow!("Failed to read '{}': {}", canonical.display(), e))?;

        Ok(Self::from_bytes(bytes))
    }

    fn is_extension_allowed(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("wasm") | Some("wat")
        )
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex SHA-256 of the module bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Debug for SandboxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxModule")
            .field("len", &self.bytes.len())
            .field("digest", &self.digest)
            .finish()
    }
}
