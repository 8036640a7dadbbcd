//! Content-integrity digests for uploaded documents.
//!
//! Uploads arrive in chunks, so [`ChecksumBuilder`] accumulates them and
//! produces the SHA-256 of the concatenated bytes.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 over a chunked upload.
#[derive(Default)]
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finish and return the lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
