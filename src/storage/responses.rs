use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

use super::{key_file_stem, ArtifactSink};

/// A full HTTP response kept for header-preserving replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    #[must_use]
    pub fn ok(headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Named cache of whole responses keyed by request URL.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, url: &str) -> StoreResult<Option<CachedResponse>>;

    async fn contains(&self, url: &str) -> StoreResult<bool> {
        Ok(self.lookup(url).await?.is_some())
    }

    async fn put(&self, url: &str, response: CachedResponse) -> StoreResult<()>;

    /// Streams a body in; the entry appears only once the writer finishes.
    async fn open_writer(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> StoreResult<Box<dyn ArtifactSink>>;

    async fn remove(&self, url: &str) -> StoreResult<bool>;
}

#[derive(Default, Clone)]
pub struct MemoryResponseCache {
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
}

impl MemoryResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryWriter {
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[async_trait]
impl ArtifactSink for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> StoreResult<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StoreResult<()> {
        let MemoryWriter {
            entries,
            url,
            headers,
            body,
        } = *self;
        entries.write().insert(url, CachedResponse::ok(headers, body));
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn lookup(&self, url: &str) -> StoreResult<Option<CachedResponse>> {
        Ok(self.entries.read().get(url).cloned())
    }

    async fn contains(&self, url: &str) -> StoreResult<bool> {
        Ok(self.entries.read().contains_key(url))
    }

    async fn put(&self, url: &str, response: CachedResponse) -> StoreResult<()> {
        self.entries.write().insert(url.to_string(), response);
        Ok(())
    }

    async fn open_writer(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> StoreResult<Box<dyn ArtifactSink>> {
        Ok(Box::new(MemoryWriter {
            entries: self.entries.clone(),
            url: url.to_string(),
            headers,
            body: Vec::new(),
        }))
    }

    async fn remove(&self, url: &str) -> StoreResult<bool> {
        Ok(self.entries.write().remove(url).is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
}

/// Response cache on disk: `<root>/<name>/<hash>.body` plus a `.meta.json` header file.
pub struct FsResponseCache {
    dir: PathBuf,
}

impl FsResponseCache {
    pub async fn open(root: impl AsRef<Path>, name: &str) -> StoreResult<Self> {
        let dir = root.as_ref().join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(dir.display(), err))?;
        Ok(Self { dir })
    }

    fn body_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.body", key_file_stem(url)))
    }

    fn meta_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", key_file_stem(url)))
    }

    async fn read_meta(&self, url: &str) -> StoreResult<Option<ResponseMeta>> {
        let path = self.meta_path(url);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path.display(), err)),
        };
        let meta: ResponseMeta =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                key: url.to_string(),
                source,
            })?;
        Ok((meta.url == url).then_some(meta))
    }
}

async fn publish(
    body_staging: &Path,
    body_path: &Path,
    meta_path: &Path,
    meta: &ResponseMeta,
) -> StoreResult<()> {
    tokio::fs::rename(body_staging, body_path)
        .await
        .map_err(|err| StoreError::io(body_path.display(), err))?;
    let serialized = serde_json::to_vec_pretty(meta).map_err(|source| StoreError::Decode {
        key: meta.url.clone(),
        source,
    })?;
    tokio::fs::write(meta_path, serialized)
        .await
        .map_err(|err| StoreError::io(meta_path.display(), err))
}

struct FsWriter {
    file: Option<tokio::fs::File>,
    staging: PathBuf,
    body_path: PathBuf,
    meta_path: PathBuf,
    meta: ResponseMeta,
}

#[async_trait]
impl ArtifactSink for FsWriter {
    async fn write(&mut self, chunk: &[u8]) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::SinkClosed(self.meta.url.clone()))?;
        file.write_all(chunk)
            .await
            .map_err(|err| StoreError::io(self.staging.display(), err))
    }

    async fn finish(self: Box<Self>) -> StoreResult<()> {
        let FsWriter {
            file,
            staging,
            body_path,
            meta_path,
            meta,
        } = *self;
        let mut file = file.ok_or_else(|| StoreError::SinkClosed(meta.url.clone()))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(staging.display(), err))?;
        drop(file);
        if let Err(error) = publish(&staging, &body_path, &meta_path, &meta).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let FsWriter { file, staging, .. } = *self;
        drop(file);
        let _ = tokio::fs::remove_file(&staging).await;
    }
}

#[async_trait]
impl ResponseCache for FsResponseCache {
    async fn lookup(&self, url: &str) -> StoreResult<Option<CachedResponse>> {
        let Some(meta) = self.read_meta(url).await? else {
            return Ok(None);
        };
        let path = self.body_path(url);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(CachedResponse {
                status: meta.status,
                headers: meta.headers,
                body,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path.display(), err)),
        }
    }

    async fn contains(&self, url: &str) -> StoreResult<bool> {
        if self.read_meta(url).await?.is_none() {
            return Ok(false);
        }
        let path = self.body_path(url);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| StoreError::io(path.display(), err))
    }

    async fn put(&self, url: &str, response: CachedResponse) -> StoreResult<()> {
        let mut writer = self.open_writer(url, response.headers).await?;
        writer.write(&response.body).await?;
        writer.finish().await
    }

    async fn open_writer(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> StoreResult<Box<dyn ArtifactSink>> {
        let body_path = self.body_path(url);
        let staging = body_path.with_extension(format!("{}.part", Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&staging)
            .await
            .map_err(|err| StoreError::io(staging.display(), err))?;
        Ok(Box::new(FsWriter {
            file: Some(file),
            staging,
            body_path,
            meta_path: self.meta_path(url),
            meta: ResponseMeta {
                url: url.to_string(),
                status: 200,
                headers,
            },
        }))
    }

    async fn remove(&self, url: &str) -> StoreResult<bool> {
        let mut removed = false;
        for path in [self.meta_path(url), self.body_path(url)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(path.display(), err)),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://cdn.example/m/onnx/model_quantized.onnx";

    #[tokio::test]
    async fn fs_writer_is_invisible_until_finished() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsResponseCache::open(dir.path(), "transformers-cache")
            .await
            .unwrap();

        let headers = vec![("Content-Type".to_string(), "application/octet-stream".to_string())];
        let mut writer = cache.open_writer(URL, headers).await.unwrap();
        writer.write(b"graph-").await.unwrap();
        writer.write(b"bytes").await.unwrap();
        assert!(!cache.contains(URL).await.unwrap());

        writer.finish().await.unwrap();
        let cached = cache.lookup(URL).await.unwrap().unwrap();
        assert_eq!(cached.status, 200);
        assert_eq!(cached.body, b"graph-bytes".to_vec());
        assert_eq!(cached.header("content-type"), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn fs_abort_leaves_no_entry_or_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsResponseCache::open(dir.path(), "c").await.unwrap();

        let mut writer = cache.open_writer(URL, vec![]).await.unwrap();
        writer.write(b"half").await.unwrap();
        writer.abort().await;

        assert!(cache.lookup(URL).await.unwrap().is_none());
        let leftovers = std::fs::read_dir(dir.path().join("c")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn fs_put_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsResponseCache::open(dir.path(), "c").await.unwrap();
        cache
            .put(URL, CachedResponse::ok(vec![], vec![1, 2, 3]))
            .await
            .unwrap();
        assert!(cache.contains(URL).await.unwrap());
        assert!(cache.remove(URL).await.unwrap());
        assert!(!cache.contains(URL).await.unwrap());
        assert!(!cache.remove(URL).await.unwrap());
    }

    #[tokio::test]
    async fn fs_metadata_without_body_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsResponseCache::open(dir.path(), "c").await.unwrap();
        cache
            .put(URL, CachedResponse::ok(vec![], b"graph".to_vec()))
            .await
            .unwrap();

        tokio::fs::remove_file(cache.body_path(URL)).await.unwrap();
        assert!(!cache.contains(URL).await.unwrap());
    }
}
