use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, stream::BoxStream, StreamExt};
use reqwest::Client;

use crate::error::FetchError;
use crate::storage::preallocation;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Response head plus a lazily read body.
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl FetchResponse {
    /// Response with the whole body available as a single chunk.
    #[must_use]
    pub fn from_bytes(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let content_length = Some(body.len() as u64);
        Self {
            status,
            headers,
            content_length,
            body: stream::once(async move { Ok(Bytes::from(body)) }).boxed(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Drains the body into memory.
    pub async fn bytes(mut self) -> Result<Vec<u8>, FetchError> {
        let mut buffer = Vec::with_capacity(preallocation(self.content_length));
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer)
    }
}

/// Fetch-like seam injected into the acquisition engine and the model loader.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let content_length = response.content_length();

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|err| FetchError::Body {
                    url: owned_url.clone(),
                    message: err.to_string(),
                })
            })
            .boxed();

        Ok(FetchResponse {
            status,
            headers,
            content_length,
            body,
        })
    }
}
