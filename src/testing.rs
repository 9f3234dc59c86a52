use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::net::{FetchResponse, Fetcher};

struct Route {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    chunk: usize,
    announced_length: Option<u64>,
}

/// In-memory fetcher with canned routes that records every request.
#[derive(Default)]
pub(crate) struct StaticFetcher {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn route(&self, url: &str, status: u16, headers: Vec<(String, String)>, body: &[u8], chunk: usize) {
        self.routes.lock().insert(
            url.to_string(),
            Route {
                status,
                headers,
                body: body.to_vec(),
                chunk: chunk.max(1),
                announced_length: None,
            },
        );
    }

    pub(crate) fn bytes(&self, url: &str, body: &[u8]) {
        let headers = vec![("content-type".into(), "application/octet-stream".into())];
        self.route(url, 200, headers, body, usize::MAX);
    }

    pub(crate) fn json(&self, url: &str, body: &str) {
        let headers = vec![("content-type".into(), "application/json".into())];
        self.route(url, 200, headers, body.as_bytes(), usize::MAX);
    }

    pub(crate) fn chunked(&self, url: &str, body: &[u8], chunk: usize) {
        self.route(url, 200, Vec::new(), body, chunk);
    }

    pub(crate) fn respond(&self, url: &str, status: u16, body: &[u8]) {
        self.route(url, status, Vec::new(), body, usize::MAX);
    }

    /// Makes an existing route announce `length` instead of its real body size.
    pub(crate) fn announce_length(&self, url: &str, length: u64) {
        if let Some(route) = self.routes.lock().get_mut(url) {
            route.announced_length = Some(length);
        }
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|seen| *seen == url).count()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.requests.lock().push(url.to_string());
        let routes = self.routes.lock();
        let Some(route) = routes.get(url) else {
            return Err(FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".into(),
            });
        };

        let chunks: Vec<Result<Bytes, FetchError>> = route
            .body
            .chunks(route.chunk)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(FetchResponse {
            status: route.status,
            headers: route.headers.clone(),
            content_length: route.announced_length.or(Some(route.body.len() as u64)),
            body: stream::iter(chunks).boxed(),
        })
    }
}
