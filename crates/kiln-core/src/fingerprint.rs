//! Content-addressed fingerprints for build artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::BackendKind;
use crate::language::Language;

/// SHA-256 digest identifying a `(language, code, backend)` triple.
///
/// Each field is length-prefixed before hashing so that no two distinct
/// triples share an encoding. The digest is stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(language: Language, code: &str, backend: BackendKind) -> Self {
        let mut hasher = Sha256::new();
        for field in [language.as_str(), code, backend.as_str()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Full 64-character lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in image and container names.
    pub fn short(&self) -> &str {
        self.0.get(..24).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
