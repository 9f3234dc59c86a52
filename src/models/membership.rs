use futures_util::future::join_all;
use serde::Serialize;

use crate::storage::{BlobStore, ResponseCache};

use super::{
    download::{plan_for, ArtifactPlan},
    manifest::Manifest,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    pub model_id: String,
    pub total: usize,
    pub missing: Vec<String>,
}

impl CacheReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    #[must_use]
    pub fn present(&self) -> usize {
        self.total - self.missing.len()
    }
}

async fn is_present(
    artifact: &ArtifactPlan,
    store: &dyn BlobStore,
    responses: &dyn ResponseCache,
) -> bool {
    match store.contains(&artifact.url).await {
        Ok(true) => return true,
        Ok(false) => {}
        Err(error) => {
            tracing::warn!("Probe of {} failed: {error}", artifact.url);
        }
    }
    if !artifact.kind.is_graph() {
        return false;
    }
    responses.contains(&artifact.url).await.unwrap_or_else(|error| {
        tracing::warn!("Response cache probe of {} failed: {error}", artifact.url);
        false
    })
}

/// Probes every address concurrently; a failed probe counts as absent.
pub async fn cache_report(
    manifest: &Manifest,
    store: &dyn BlobStore,
    responses: &dyn ResponseCache,
) -> CacheReport {
    let plan = plan_for(manifest);
    let probes = plan
        .iter()
        .map(|artifact| async move { (artifact, is_present(artifact, store, responses).await) });
    let missing = join_all(probes)
        .await
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(artifact, _)| artifact.url.clone())
        .collect();

    CacheReport {
        model_id: manifest.model_id.clone(),
        total: plan.len(),
        missing,
    }
}

pub async fn is_cached(
    manifest: &Manifest,
    store: &dyn BlobStore,
    responses: &dyn ResponseCache,
) -> bool {
    cache_report(manifest, store, responses).await.is_complete()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute_sha256;
    use crate::models::manifest::{OnnxGraph, ShardEntry};
    use crate::storage::{CachedResponse, CachedValue, MemoryBlobStore, MemoryResponseCache};

    fn manifest() -> Manifest {
        Manifest {
            schema_version: 1,
            model_id: "tiny".into(),
            display_name: None,
            version: None,
            license: None,
            format: None,
            max_sequence_len: None,
            tokenizer_url: "https://cdn.example/tiny/tokenizer.json".into(),
            onnx: None,
            shards: vec![ShardEntry {
                url: "https://cdn.example/tiny/model.safetensors".into(),
                sha256: compute_sha256(b"weights"),
                size: None,
            }],
        }
    }

    async fn fill(store: &MemoryBlobStore, manifest: &Manifest) {
        for url in crate::models::artifact_addresses(manifest) {
            let value = if url.ends_with(".json") {
                CachedValue::Json(serde_json::json!({}))
            } else {
                CachedValue::Bytes(b"weights".to_vec())
            };
            store.set(&url, value).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_cache_reports_everything_missing() {
        let manifest = manifest();
        let store = MemoryBlobStore::new();
        let responses = MemoryResponseCache::new();

        let report = cache_report(&manifest, &store, &responses).await;
        assert_eq!(report.total, 6);
        assert_eq!(report.missing.len(), 6);
        assert!(!is_cached(&manifest, &store, &responses).await);
    }

    #[tokio::test]
    async fn one_missing_auxiliary_file_fails_membership() {
        let manifest = manifest();
        let store = MemoryBlobStore::new();
        let responses = MemoryResponseCache::new();
        fill(&store, &manifest).await;
        assert!(is_cached(&manifest, &store, &responses).await);

        let removed = "https://cdn.example/tiny/special_tokens_map.json";
        store.remove(removed).await.unwrap();
        let report = cache_report(&manifest, &store, &responses).await;
        assert_eq!(report.missing, vec![removed.to_string()]);
        assert_eq!(report.present(), 5);
    }

    #[tokio::test]
    async fn graph_may_live_in_the_response_cache() {
        let mut manifest = manifest();
        let graph = "https://cdn.example/tiny/onnx/model.onnx";
        manifest.onnx = Some(OnnxGraph {
            model: graph.into(),
            external_data: None,
            sha256: None,
            external_sha256: None,
            quantization: None,
            size: None,
        });
        let store = MemoryBlobStore::new();
        let responses = MemoryResponseCache::new();
        fill(&store, &manifest).await;
        store.remove(graph).await.unwrap();
        assert!(!is_cached(&manifest, &store, &responses).await);

        responses
            .put(graph, CachedResponse::ok(vec![], b"graph".to_vec()))
            .await
            .unwrap();
        assert!(is_cached(&manifest, &store, &responses).await);
    }

    #[tokio::test]
    async fn shards_do_not_count_from_the_response_cache() {
        let manifest = manifest();
        let store = MemoryBlobStore::new();
        let responses = MemoryResponseCache::new();
        fill(&store, &manifest).await;
        let shard = &manifest.shards[0].url;
        store.remove(shard).await.unwrap();
        responses
            .put(shard, CachedResponse::ok(vec![], b"weights".to_vec()))
            .await
            .unwrap();
        assert!(!is_cached(&manifest, &store, &responses).await);
    }
}
