use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of an in-memory buffer.
#[must_use]
pub fn compute_sha256(bytes: &[u8]) -> String {
    let mut digest = StreamingDigest::new();
    digest.update(bytes);
    digest.finalize_hex()
}

/// Incremental hasher fed one chunk at a time while a download streams.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// True for a 64 character lowercase hex string.
#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
