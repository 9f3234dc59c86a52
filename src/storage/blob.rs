use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::manifest::strip_query;

use super::key_file_stem;

/// A cached artifact: raw bytes for shards and graphs, parsed JSON for config files.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl CachedValue {
    /// Picks the value shape from the address, parsing JSON bodies.
    pub fn for_address(url: &str, body: Vec<u8>) -> Result<Self, serde_json::Error> {
        if is_json_address(url) {
            serde_json::from_slice(&body).map(CachedValue::Json)
        } else {
            Ok(CachedValue::Bytes(body))
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CachedValue::Bytes(bytes) => Some(bytes),
            CachedValue::Json(_) => None,
        }
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self, CachedValue::Json(_))
    }

    /// Wire form of the value, as it would be served back to a loader.
    pub fn to_body(&self) -> Vec<u8> {
        match self {
            CachedValue::Bytes(bytes) => bytes.clone(),
            CachedValue::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            CachedValue::Bytes(_) => "bin",
            CachedValue::Json(_) => "json",
        }
    }
}

/// Addresses whose path ends in `.json` are stored as structured values.
#[must_use]
pub fn is_json_address(url: &str) -> bool {
    strip_query(url).to_ascii_lowercase().ends_with(".json")
}

/// Durable key-value store keyed by artifact URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<CachedValue>>;

    async fn set(&self, key: &str, value: CachedValue) -> StoreResult<()>;

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool>;

    async fn keys(&self) -> StoreResult<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<HashMap<String, CachedValue>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CachedValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: CachedValue) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryIndex {
    key: String,
    json: bool,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
}

/// Filesystem store: one value file per key plus a small index file naming the key.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| StoreError::io(root.display(), err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn value_path(&self, key: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{extension}", key_file_stem(key)))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.key.json", key_file_stem(key)))
    }

    async fn read_index(&self, key: &str) -> StoreResult<Option<EntryIndex>> {
        let path = self.index_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path.display(), err)),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let staging = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(|err| StoreError::io(staging.display(), err))?;
    if let Err(err) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(StoreError::io(path.display(), err));
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> StoreResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::io(path.display(), err)),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CachedValue>> {
        let Some(index) = self.read_index(key).await? else {
            return Ok(None);
        };
        if index.key != key {
            return Ok(None);
        }

        let extension = if index.json { "json" } else { "bin" };
        let path = self.value_path(key, extension);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path.display(), err)),
        };

        if index.json {
            serde_json::from_slice(&bytes)
                .map(|value| Some(CachedValue::Json(value)))
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })
        } else {
            Ok(Some(CachedValue::Bytes(bytes)))
        }
    }

    async fn set(&self, key: &str, value: CachedValue) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let path = self.value_path(key, value.extension());
        write_atomic(&path, &value.to_body()).await?;

        let stale = if value.is_json() { "bin" } else { "json" };
        remove_if_present(&self.value_path(key, stale)).await?;

        let index = EntryIndex {
            key: key.to_string(),
            json: value.is_json(),
            stored_at: OffsetDateTime::now_utc(),
        };
        let serialized = serde_json::to_vec_pretty(&index).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;
        write_atomic(&self.index_path(key), &serialized).await
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        let Some(index) = self.read_index(key).await? else {
            return Ok(false);
        };
        if index.key != key {
            return Ok(false);
        }
        let path = self.value_path(key, if index.json { "json" } else { "bin" });
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| StoreError::io(path.display(), err))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let removed_index = remove_if_present(&self.index_path(key)).await?;
        let removed_bin = remove_if_present(&self.value_path(key, "bin")).await?;
        let removed_json = remove_if_present(&self.value_path(key, "json")).await?;
        Ok(removed_index || removed_bin || removed_json)
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| StoreError::io(self.root.display(), err))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::io(self.root.display(), err))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(".key.json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            if let Ok(index) = serde_json::from_slice::<EntryIndex>(&bytes) {
                keys.push(index.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
