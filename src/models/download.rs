use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::AcquireError;
use crate::net::Fetcher;
use crate::storage::{
    ArtifactSink, BlobSink, BlobStore, CachedValue, FanOutSink, ResponseCache,
};

use super::{
    manifest::Manifest,
    metadata::{compute_sha256, StreamingDigest},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Shard,
    Auxiliary,
    Graph,
    GraphData,
}

impl ArtifactKind {
    /// Graph artifacts may also live in the response cache.
    #[must_use]
    pub fn is_graph(self) -> bool {
        matches!(self, ArtifactKind::Graph | ArtifactKind::GraphData)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPlan {
    pub url: String,
    pub kind: ArtifactKind,
    pub expected_sha256: Option<String>,
    pub size: Option<u64>,
}

/// Every artifact a manifest needs, in acquisition order: shards, auxiliary
/// files (tokenizer first), then the optimized graph and its external data.
/// Addresses are unique; the first occurrence wins.
#[must_use]
pub fn plan_for(manifest: &Manifest) -> Vec<ArtifactPlan> {
    let mut plan = Vec::new();

    for shard in &manifest.shards {
        plan.push(ArtifactPlan {
            url: shard.url.clone(),
            kind: ArtifactKind::Shard,
            expected_sha256: Some(shard.sha256.clone()),
            size: shard.size,
        });
    }

    for url in manifest.auxiliary_urls() {
        plan.push(ArtifactPlan {
            url,
            kind: ArtifactKind::Auxiliary,
            expected_sha256: None,
            size: None,
        });
    }

    if let Some(graph) = &manifest.onnx {
        plan.push(ArtifactPlan {
            url: graph.model.clone(),
            kind: ArtifactKind::Graph,
            expected_sha256: graph.sha256.clone(),
            size: graph.size,
        });
        if let Some(external) = graph.external_data.as_ref().filter(|url| !url.is_empty()) {
            plan.push(ArtifactPlan {
                url: external.clone(),
                kind: ArtifactKind::GraphData,
                expected_sha256: graph.external_sha256.clone(),
                size: None,
            });
        }
    }

    let mut seen = HashSet::new();
    plan.retain(|artifact| seen.insert(artifact.url.clone()));
    plan
}

/// The address set that must be cache-resident for a model to load.
#[must_use]
pub fn artifact_addresses(manifest: &Manifest) -> Vec<String> {
    plan_for(manifest)
        .into_iter()
        .map(|artifact| artifact.url)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: f64,
    pub total: usize,
}

impl Progress {
    #[must_use]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        ((self.completed / self.total as f64).clamp(0.0, 1.0)) as f32
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireReport {
    pub fetched: Vec<String>,
    pub reused: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Fail up front when the manifest has no optimized graph.
    pub require_graph: bool,
    pub cancel: Option<CancellationFlag>,
}

impl AcquireOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationFlag::is_cancelled)
    }
}

enum Outcome {
    Fetched,
    Reused,
    Skipped,
}

struct ProgressTracker<'a> {
    completed: usize,
    total: usize,
    last: f64,
    on_progress: &'a mut (dyn FnMut(Progress) + Send),
}

impl ProgressTracker<'_> {
    fn advance(&mut self) {
        self.completed += 1;
        self.emit(self.completed as f64);
    }

    fn partial(&mut self, fraction: f64) {
        self.emit(self.completed as f64 + fraction.clamp(0.0, 1.0));
    }

    fn emit(&mut self, completed: f64) {
        if completed < self.last {
            return;
        }
        self.last = completed;
        (self.on_progress)(Progress {
            completed,
            total: self.total,
        });
    }
}

/// Reuse-if-valid, else fetch, verify and store, one artifact at a time.
pub struct ShardAcquirer {
    store: Arc<dyn BlobStore>,
    responses: Arc<dyn ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
}

impl ShardAcquirer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        responses: Arc<dyn ResponseCache>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            store,
            responses,
            fetcher,
        }
    }

    pub async fn acquire(&self, manifest: &Manifest) -> Result<AcquireReport, AcquireError> {
        self.acquire_with_progress(manifest, |_| {}).await
    }

    pub async fn acquire_with_progress<F>(
        &self,
        manifest: &Manifest,
        progress: F,
    ) -> Result<AcquireReport, AcquireError>
    where
        F: FnMut(Progress) + Send,
    {
        self.acquire_with_options(manifest, &AcquireOptions::default(), progress)
            .await
    }

    pub async fn acquire_with_options<F>(
        &self,
        manifest: &Manifest,
        options: &AcquireOptions,
        mut progress: F,
    ) -> Result<AcquireReport, AcquireError>
    where
        F: FnMut(Progress) + Send,
    {
        if options.require_graph && !manifest.has_graph() {
            return Err(AcquireError::MissingGraph {
                model_id: manifest.model_id.clone(),
            });
        }

        let plan = plan_for(manifest);
        let mut tracker = ProgressTracker {
            completed: 0,
            total: plan.len(),
            last: 0.0,
            on_progress: &mut progress,
        };
        let mut report = AcquireReport::default();

        tracing::info!(
            model_id = %manifest.model_id,
            artifacts = plan.len(),
            "acquiring model artifacts"
        );

        for artifact in &plan {
            if options.cancelled() {
                return Err(AcquireError::Cancelled);
            }

            let outcome = match artifact.kind {
                ArtifactKind::Shard => self.acquire_shard(artifact).await?,
                ArtifactKind::Auxiliary => self.acquire_auxiliary(artifact).await?,
                ArtifactKind::Graph | ArtifactKind::GraphData => {
                    self.acquire_graph(artifact, options, &mut tracker).await?
                }
            };

            let bucket = match outcome {
                Outcome::Fetched => &mut report.fetched,
                Outcome::Reused => &mut report.reused,
                Outcome::Skipped => &mut report.skipped,
            };
            bucket.push(artifact.url.clone());
            tracker.advance();
        }

        tracing::info!(
            model_id = %manifest.model_id,
            fetched = report.fetched.len(),
            reused = report.reused.len(),
            skipped = report.skipped.len(),
            "model artifacts ready"
        );
        Ok(report)
    }

    /// Cached bytes that still hash to the expected digest.
    async fn cached_bytes_valid(&self, url: &str, expected: Option<&str>) -> bool {
        let cached = match self.store.get(url).await {
            Ok(cached) => cached,
            Err(error) => {
                tracing::warn!("Treating unreadable cache entry {url} as missing: {error}");
                return false;
            }
        };
        match (cached, expected) {
            (Some(CachedValue::Bytes(bytes)), Some(expected)) => {
                if compute_sha256(&bytes) == expected {
                    true
                } else {
                    tracing::warn!("Cached copy of {url} failed verification; downloading again");
                    false
                }
            }
            (Some(CachedValue::Bytes(_)), None) => true,
            (Some(CachedValue::Json(_)), _) => {
                tracing::warn!("Cached copy of {url} has the wrong shape; downloading again");
                false
            }
            (None, _) => false,
        }
    }

    async fn acquire_shard(&self, artifact: &ArtifactPlan) -> Result<Outcome, AcquireError> {
        let url = artifact.url.as_str();
        let expected = artifact.expected_sha256.as_deref();
        if self.cached_bytes_valid(url, expected).await {
            tracing::debug!("Reusing cached shard {url}");
            return Ok(Outcome::Reused);
        }

        let response = self.fetcher.fetch(url).await?;
        if !response.is_success() {
            return Err(AcquireError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        let body = response.bytes().await?;

        if let Some(expected) = expected {
            let actual = compute_sha256(&body);
            if actual != expected {
                tracing::error!("Shard {url} hashed to {actual}, expected {expected}");
                return Err(AcquireError::ChecksumMismatch {
                    url: url.to_string(),
                });
            }
        }

        let size = body.len();
        self.store.set(url, CachedValue::Bytes(body)).await?;
        tracing::info!("Fetched shard {url} ({size} bytes)");
        Ok(Outcome::Fetched)
    }

    /// Auxiliary files are best effort: any network or parse failure skips the file.
    async fn acquire_auxiliary(&self, artifact: &ArtifactPlan) -> Result<Outcome, AcquireError> {
        let url = artifact.url.as_str();
        let json_expected = crate::storage::is_json_address(url);
        match self.store.get(url).await {
            Ok(Some(value)) if value.is_json() == json_expected => {
                tracing::debug!("Reusing cached auxiliary file {url}");
                return Ok(Outcome::Reused);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!("Treating unreadable cache entry {url} as missing: {error}");
            }
        }

        let response = match self.fetcher.fetch(url).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("Skipping auxiliary file {url}: {error}");
                return Ok(Outcome::Skipped);
            }
        };
        if !response.is_success() {
            tracing::warn!(
                "Skipping auxiliary file {url}: HTTP {}",
                response.status
            );
            return Ok(Outcome::Skipped);
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!("Skipping auxiliary file {url}: {error}");
                return Ok(Outcome::Skipped);
            }
        };
        let value = match CachedValue::for_address(url, body) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!("Skipping auxiliary file {url}: body is not JSON ({error})");
                return Ok(Outcome::Skipped);
            }
        };

        self.store.set(url, value).await?;
        tracing::info!("Fetched auxiliary file {url}");
        Ok(Outcome::Fetched)
    }

    /// Streams a graph artifact into both stores from a single fetch.
    async fn acquire_graph(
        &self,
        artifact: &ArtifactPlan,
        options: &AcquireOptions,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<Outcome, AcquireError> {
        let url = artifact.url.as_str();
        let expected = artifact.expected_sha256.as_deref();

        if self.cached_bytes_valid(url, expected).await {
            tracing::debug!("Reusing cached graph artifact {url}");
            return Ok(Outcome::Reused);
        }
        if self.reuse_cached_response(url, expected).await? {
            return Ok(Outcome::Reused);
        }

        let response = self.fetcher.fetch(url).await?;
        if !response.is_success() {
            return Err(AcquireError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let size = artifact.size.or(response.content_length).filter(|size| *size > 0);
        let writer = self
            .responses
            .open_writer(url, response.headers.clone())
            .await?;
        // The blob store is the fallible one; finish it before publishing the response copy.
        let mut sink: Box<dyn ArtifactSink> = Box::new(
            FanOutSink::new()
                .with(Box::new(BlobSink::new(self.store.clone(), url, size)))
                .with(writer),
        );

        let mut digest = StreamingDigest::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            if options.cancelled() {
                sink.abort().await;
                return Err(AcquireError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    sink.abort().await;
                    return Err(error.into());
                }
            };
            digest.update(&chunk);
            if let Err(error) = sink.write(&chunk).await {
                sink.abort().await;
                return Err(error.into());
            }
            if let Some(size) = size {
                tracker.partial(digest.bytes_seen() as f64 / size as f64);
            }
        }

        let received = digest.bytes_seen();
        if let Some(expected) = expected {
            let actual = digest.finalize_hex();
            if actual != expected {
                sink.abort().await;
                tracing::error!("Graph artifact {url} hashed to {actual}, expected {expected}");
                return Err(AcquireError::ChecksumMismatch {
                    url: url.to_string(),
                });
            }
        }

        sink.finish().await?;
        tracing::info!("Fetched graph artifact {url} ({received} bytes)");
        Ok(Outcome::Fetched)
    }

    /// A verified response-cache copy is reused and backfilled into the blob store.
    async fn reuse_cached_response(
        &self,
        url: &str,
        expected: Option<&str>,
    ) -> Result<bool, AcquireError> {
        let cached = match self.responses.lookup(url).await {
            Ok(Some(cached)) if (200..300).contains(&cached.status) => cached,
            Ok(_) => return Ok(false),
            Err(error) => {
                tracing::warn!("Treating unreadable response cache entry {url} as missing: {error}");
                return Ok(false);
            }
        };
        if let Some(expected) = expected {
            if compute_sha256(&cached.body) != expected {
                tracing::warn!("Response cache copy of {url} failed verification; downloading again");
                return Ok(false);
            }
        }
        self.store
            .set(url, CachedValue::Bytes(cached.body))
            .await?;
        tracing::debug!("Reusing response cache copy of {url}");
        Ok(true)
    }
}
