use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FetchError, LoaderError};
use crate::net::{FetchResponse, Fetcher};
use crate::storage::{BlobStore, CachedValue, ResponseCache};

use super::{manifest::Manifest, membership::cache_report};

/// Serves model artifacts out of the local stores, falling back to the network
/// only when one is configured.
pub struct StoreBackedFetcher {
    store: Arc<dyn BlobStore>,
    responses: Arc<dyn ResponseCache>,
    fallback: Option<Arc<dyn Fetcher>>,
}

impl StoreBackedFetcher {
    pub fn new(
        store: Arc<dyn BlobStore>,
        responses: Arc<dyn ResponseCache>,
        fallback: Option<Arc<dyn Fetcher>>,
    ) -> Self {
        Self {
            store,
            responses,
            fallback,
        }
    }
}

fn content_type(value: &CachedValue) -> &'static str {
    if value.is_json() {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

#[async_trait]
impl Fetcher for StoreBackedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        match self.store.get(url).await {
            Ok(Some(value)) => {
                let headers = vec![("Content-Type".to_string(), content_type(&value).to_string())];
                return Ok(FetchResponse::from_bytes(200, headers, value.to_body()));
            }
            Ok(None) => {}
            Err(error) => tracing::warn!("Blob store read of {url} failed: {error}"),
        }

        match self.responses.lookup(url).await {
            Ok(Some(cached)) => {
                return Ok(FetchResponse::from_bytes(
                    cached.status,
                    cached.headers,
                    cached.body,
                ));
            }
            Ok(None) => {}
            Err(error) => tracing::warn!("Response cache read of {url} failed: {error}"),
        }

        match &self.fallback {
            Some(fallback) => {
                tracing::debug!("Cache miss for {url}; using network");
                fallback.fetch(url).await
            }
            None => Ok(FetchResponse::from_bytes(404, Vec::new(), Vec::new())),
        }
    }
}

/// A manifest whose address set is known to be cache resident.
pub struct LocalModel {
    pub manifest: Manifest,
    fetcher: Arc<StoreBackedFetcher>,
}

impl LocalModel {
    #[must_use]
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.fetcher.clone()
    }

    /// Reads one artifact through the cache-backed fetcher.
    pub async fn read(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetcher.fetch(url).await?.bytes().await
    }
}

/// Turns a cache-resident model into an inference-ready handle.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    type Handle: Send;

    async fn load(&self, model: LocalModel) -> anyhow::Result<Self::Handle>;
}

/// Checks membership, then hands back a model that reads only from the stores.
pub async fn prepare_local_model(
    manifest: &Manifest,
    store: Arc<dyn BlobStore>,
    responses: Arc<dyn ResponseCache>,
) -> Result<LocalModel, LoaderError> {
    let report = cache_report(manifest, store.as_ref(), responses.as_ref()).await;
    if !report.is_complete() {
        return Err(LoaderError::NotCached {
            model_id: manifest.model_id.clone(),
            missing: report.missing,
        });
    }
    Ok(LocalModel {
        manifest: manifest.clone(),
        fetcher: Arc::new(StoreBackedFetcher::new(store, responses, None)),
    })
}
