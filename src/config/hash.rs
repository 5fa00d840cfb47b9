//! Content hashing for change detection.
//!
//! Config payloads are opaque blobs: the engine never parses them, it only
//! compares the SHA-256 of what it wants written with what the control plane
//! reports is on disk.

use sha2::{Digest, Sha256};

use super::spec::{AttrValue, Declaration};

/// Hasher for payloads and declarations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHasher;

impl ContentHasher {
    /// Creates a new content hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a config payload.
    #[must_use]
    pub fn hash_payload(&self, content: impl AsRef<[u8]>) -> String {
        hex::encode(Sha256::digest(content.as_ref()))
    }

    /// Computes a hash of the whole declaration.
    ///
    /// Recorded in reports so two runs can be tied to the same input.
    #[must_use]
    pub fn hash_declaration(&self, declaration: &Declaration) -> String {
        let mut hasher = Sha256::new();

        hasher.update(declaration.target.name.as_bytes());
        hasher.update(declaration.target.home.as_bytes());

        for resource in &declaration.resources {
            hasher.update(resource.kind.to_string().as_bytes());
            hasher.update(resource.name.as_bytes());

            // BTreeMap iteration is already sorted
            for (key, value) in &resource.desired {
                hasher.update(key.as_bytes());
                hasher.update(Self::attr_bytes(value));
            }

            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
            }
            for notify in &resource.notify {
                hasher.update(notify.as_bytes());
            }
            if let Some(file) = &resource.file {
                hasher.update(file.as_bytes());
            }
            if let Some(content) = &resource.content {
                hasher.update(content.as_bytes());
            }
            if let Some(source) = &resource.source {
                hasher.update(source.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    fn attr_bytes(value: &AttrValue) -> Vec<u8> {
        match value {
            AttrValue::Bool(b) => vec![0, u8::from(*b)],
            AttrValue::Int(i) => {
                let mut bytes = vec![1];
                bytes.extend_from_slice(&i.to_be_bytes());
                bytes
            }
            AttrValue::Text(s) => {
                let mut bytes = vec![2];
                bytes.extend_from_slice(s.as_bytes());
                bytes
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
