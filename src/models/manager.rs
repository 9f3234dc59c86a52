use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::settings::Settings;
use crate::error::{LoaderError, ManagerError};
use crate::net::{build_client, Fetcher, HttpFetcher};
use crate::storage::{resolve_cache_dir, BlobStore, FsBlobStore, FsResponseCache, ResponseCache};

use super::{
    download::{AcquireOptions, AcquireReport, Progress, ShardAcquirer},
    loader::{prepare_local_model, LocalModel, StoreBackedFetcher},
    manifest::Manifest,
    membership::{cache_report, CacheReport},
    plan_for,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    NotCached,
    Downloading { progress: f32 },
    Cached,
    Error(String),
}

/// Removes the model id from the in-flight set when the acquisition ends.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    model_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.model_id);
    }
}

pub struct ModelManager {
    store: Arc<dyn BlobStore>,
    responses: Arc<dyn ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    acquirer: ShardAcquirer,
    pub(crate) in_flight: Mutex<HashSet<String>>,
    statuses: RwLock<HashMap<String, ModelStatus>>,
}

impl ModelManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        responses: Arc<dyn ResponseCache>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let acquirer = ShardAcquirer::new(store.clone(), responses.clone(), fetcher.clone());
        Self {
            store,
            responses,
            fetcher,
            acquirer,
            in_flight: Mutex::new(HashSet::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Filesystem stores under the configured cache directory plus an HTTP fetcher.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let root = match &settings.cache_dir {
            Some(dir) => dir.clone(),
            None => resolve_cache_dir()?,
        };
        let store = FsBlobStore::open(root.join("blobs"))
            .await
            .with_context(|| format!("open blob store in {}", root.display()))?;
        let responses = FsResponseCache::open(&root, &settings.response_cache_name)
            .await
            .with_context(|| format!("open response cache in {}", root.display()))?;
        let fetcher = HttpFetcher::new(build_client(settings)?);
        tracing::info!(cache_dir = %root.display(), "model cache opened");
        Ok(Self::new(
            Arc::new(store),
            Arc::new(responses),
            Arc::new(fetcher),
        ))
    }

    #[must_use]
    pub fn status(&self, model_id: &str) -> ModelStatus {
        self.statuses
            .read()
            .get(model_id)
            .cloned()
            .unwrap_or(ModelStatus::NotCached)
    }

    fn set_status(&self, model_id: &str, status: ModelStatus) {
        self.statuses.write().insert(model_id.to_string(), status);
    }

    #[must_use]
    pub fn is_in_flight(&self, model_id: &str) -> bool {
        self.in_flight.lock().contains(model_id)
    }

    pub async fn cache_report(&self, manifest: &Manifest) -> CacheReport {
        cache_report(manifest, self.store.as_ref(), self.responses.as_ref()).await
    }

    pub async fn is_cached(&self, manifest: &Manifest) -> bool {
        self.cache_report(manifest).await.is_complete()
    }

    /// Re-probes the stores unless an acquisition currently owns the status.
    pub async fn refresh_status(&self, manifest: &Manifest) -> ModelStatus {
        if self.is_in_flight(&manifest.model_id) {
            return self.status(&manifest.model_id);
        }
        let status = if self.is_cached(manifest).await {
            ModelStatus::Cached
        } else {
            match self.status(&manifest.model_id) {
                error @ ModelStatus::Error(_) => error,
                _ => ModelStatus::NotCached,
            }
        };
        self.set_status(&manifest.model_id, status.clone());
        status
    }

    pub async fn acquire(&self, manifest: &Manifest) -> Result<AcquireReport, ManagerError> {
        self.acquire_with_options(manifest, &AcquireOptions::default(), |_| {})
            .await
    }

    /// At most one acquisition per model id runs at a time.
    pub async fn acquire_with_options<F>(
        &self,
        manifest: &Manifest,
        options: &AcquireOptions,
        mut on_progress: F,
    ) -> Result<AcquireReport, ManagerError>
    where
        F: FnMut(Progress) + Send,
    {
        let model_id = manifest.model_id.clone();
        if !self.in_flight.lock().insert(model_id.clone()) {
            return Err(ManagerError::AlreadyInFlight(model_id));
        }
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            model_id: model_id.clone(),
        };

        self.set_status(&model_id, ModelStatus::Downloading { progress: 0.0 });
        let result = self
            .acquirer
            .acquire_with_options(manifest, options, |progress| {
                self.set_status(
                    &model_id,
                    ModelStatus::Downloading {
                        progress: progress.fraction(),
                    },
                );
                on_progress(progress);
            })
            .await;

        match &result {
            Ok(_) => self.set_status(&model_id, ModelStatus::Cached),
            Err(error) => {
                tracing::error!("Acquisition of {model_id} failed: {error}");
                self.set_status(&model_id, ModelStatus::Error(error.to_string()));
            }
        }
        Ok(result?)
    }

    /// Drops every artifact of the model from both stores.
    pub async fn evict(&self, manifest: &Manifest) -> Result<usize, ManagerError> {
        if self.is_in_flight(&manifest.model_id) {
            return Err(ManagerError::AlreadyInFlight(manifest.model_id.clone()));
        }
        let mut removed = 0;
        for artifact in plan_for(manifest) {
            if self.store.remove(&artifact.url).await? {
                removed += 1;
            }
            if artifact.kind.is_graph() && self.responses.remove(&artifact.url).await? {
                removed += 1;
            }
        }
        self.set_status(&manifest.model_id, ModelStatus::NotCached);
        tracing::info!(model_id = %manifest.model_id, removed, "model evicted");
        Ok(removed)
    }

    pub async fn prepare_local_model(&self, manifest: &Manifest) -> Result<LocalModel, LoaderError> {
        prepare_local_model(manifest, self.store.clone(), self.responses.clone()).await
    }

    /// Cache-first fetcher that still reaches the network on a miss.
    #[must_use]
    pub fn cached_fetcher(&self) -> StoreBackedFetcher {
        StoreBackedFetcher::new(
            self.store.clone(),
            self.responses.clone(),
            Some(self.fetcher.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{compute_sha256, manifest::ShardEntry};
    use crate::storage::{MemoryBlobStore, MemoryResponseCache};
    use crate::testing::StaticFetcher;

    const BASE: &str = "https://cdn.example/tiny";

    fn manifest() -> Manifest {
        Manifest {
            schema_version: 1,
            model_id: "tiny".into(),
            display_name: Some("Tiny".into()),
            version: None,
            license: None,
            format: None,
            max_sequence_len: None,
            tokenizer_url: format!("{BASE}/tokenizer.json"),
            onnx: None,
            shards: vec![ShardEntry {
                url: format!("{BASE}/model.safetensors"),
                sha256: compute_sha256(b"weights"),
                size: None,
            }],
        }
    }

    fn served() -> Arc<StaticFetcher> {
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.bytes(&format!("{BASE}/model.safetensors"), b"weights");
        for name in [
            "tokenizer.json",
            "config.json",
            "generation_config.json",
            "special_tokens_map.json",
            "tokenizer_config.json",
        ] {
            fetcher.json(&format!("{BASE}/{name}"), "{}");
        }
        fetcher
    }

    fn manager(fetcher: Arc<StaticFetcher>) -> ModelManager {
        ModelManager::new(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryResponseCache::new()),
            fetcher,
        )
    }

    #[tokio::test]
    async fn acquire_marks_model_cached() {
        let manager = manager(served());
        let manifest = manifest();
        assert_eq!(manager.refresh_status(&manifest).await, ModelStatus::NotCached);

        let mut last = None;
        manager
            .acquire_with_options(&manifest, &AcquireOptions::default(), |progress| {
                last = Some(progress)
            })
            .await
            .unwrap();

        assert_eq!(manager.status("tiny"), ModelStatus::Cached);
        assert!(last.unwrap().is_complete());
        assert!(manager.is_cached(&manifest).await);
        assert!(!manager.is_in_flight("tiny"));
    }

    #[tokio::test]
    async fn concurrent_acquisition_of_the_same_model_is_rejected() {
        let manager = manager(served());
        let manifest = manifest();
        manager.in_flight.lock().insert("tiny".into());

        let error = manager.acquire(&manifest).await.unwrap_err();
        assert!(matches!(error, ManagerError::AlreadyInFlight(ref id) if id == "tiny"));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_guard_released() {
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.bytes(&format!("{BASE}/model.safetensors"), b"tampered");
        let manager = manager(fetcher);
        let manifest = manifest();

        let error = manager.acquire(&manifest).await.unwrap_err();
        assert!(matches!(error, ManagerError::Acquire(_)));
        assert!(matches!(manager.status("tiny"), ModelStatus::Error(ref message) if message.starts_with("Checksum mismatch for shard:")));
        assert!(!manager.is_in_flight("tiny"));
    }

    #[tokio::test]
    async fn evict_removes_every_artifact() {
        let manager = manager(served());
        let manifest = manifest();
        manager.acquire(&manifest).await.unwrap();

        let removed = manager.evict(&manifest).await.unwrap();
        assert_eq!(removed, 6);
        assert!(!manager.is_cached(&manifest).await);
        assert_eq!(manager.status("tiny"), ModelStatus::NotCached);
    }

    #[tokio::test]
    async fn local_model_requires_a_complete_cache() {
        let fetcher = served();
        let manager = manager(fetcher.clone());
        let manifest = manifest();
        assert!(manager.prepare_local_model(&manifest).await.is_err());

        manager.acquire(&manifest).await.unwrap();
        let requests = fetcher.request_count();
        let local = manager.prepare_local_model(&manifest).await.unwrap();
        assert_eq!(local.read(&format!("{BASE}/model.safetensors")).await.unwrap(), b"weights".to_vec());
        assert_eq!(fetcher.request_count(), requests);
    }
}
