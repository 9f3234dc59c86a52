mod blob;
mod responses;
mod sink;

pub use blob::{is_json_address, BlobStore, CachedValue, FsBlobStore, MemoryBlobStore};
pub use responses::{CachedResponse, FsResponseCache, MemoryResponseCache, ResponseCache};
pub use sink::{ArtifactSink, BlobSink, FanOutSink};

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

pub const DEFAULT_RESPONSE_CACHE: &str = "transformers-cache";

/// Upper bound on buffer space reserved from an untrusted length hint.
pub(crate) const MAX_PREALLOCATION: usize = 64 << 20;

/// Platform data directory that holds both stores.
pub fn resolve_cache_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "PrivyTune", "ShardCache")
        .context("missing project directories")?;
    let dir = project_dirs.data_dir().join("cache");
    std::fs::create_dir_all(&dir).context("create cache dir")?;
    Ok(dir)
}

/// File name for a key; keys are full URLs so they are hashed rather than escaped.
pub(crate) fn key_file_stem(key: &str) -> String {
    crate::models::compute_sha256(key.as_bytes())
}

/// Initial buffer capacity for a body whose length was announced by the server or manifest.
pub(crate) fn preallocation(hint: Option<u64>) -> usize {
    hint.and_then(|len| usize::try_from(len).ok())
        .map_or(0, |len| len.min(MAX_PREALLOCATION))
}
