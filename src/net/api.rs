use reqwest::Client;

use crate::error::ApiError;
use crate::models::Manifest;

/// Client for the backend that lists models and serves their manifests.
pub struct ModelsApi {
    client: Client,
    endpoint: String,
}

impl ModelsApi {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self { client, endpoint }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn manifest_url(&self, model_id: &str) -> String {
        format!("{}/{}", self.endpoint, model_id)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ApiError> {
        let body = self.get(&self.endpoint).await?;
        serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
            url: self.endpoint.clone(),
            source,
        })
    }

    pub async fn fetch_manifest(&self, model_id: &str) -> Result<Manifest, ApiError> {
        let url = self.manifest_url(model_id);
        let body = self.get(&url).await?;
        let manifest = Manifest::from_json(&body)?;
        tracing::debug!(
            model_id,
            shards = manifest.shards.len(),
            graph = manifest.has_graph(),
            "fetched manifest"
        );
        Ok(manifest)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let transport = |source| ApiError::Transport {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
