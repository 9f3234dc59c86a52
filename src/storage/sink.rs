use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;

use super::{preallocation, BlobStore, CachedValue};

/// Destination for a streamed artifact. Nothing is visible to readers until `finish`.
#[async_trait]
pub trait ArtifactSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> StoreResult<()>;

    async fn finish(self: Box<Self>) -> StoreResult<()>;

    async fn abort(self: Box<Self>);
}

/// Feeds one byte stream to several sinks so one fetch can populate every store.
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Box<dyn ArtifactSink>>,
}

impl FanOutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Box<dyn ArtifactSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ArtifactSink for FanOutSink {
    async fn write(&mut self, chunk: &[u8]) -> StoreResult<()> {
        for sink in &mut self.sinks {
            sink.write(chunk).await?;
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StoreResult<()> {
        let mut sinks = self.sinks.into_iter();
        while let Some(sink) = sinks.next() {
            if let Err(error) = sink.finish().await {
                for rest in sinks {
                    rest.abort().await;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        for sink in self.sinks {
            sink.abort().await;
        }
    }
}

/// Materializes the stream and hands it to a blob store as raw bytes.
pub struct BlobSink {
    store: Arc<dyn BlobStore>,
    key: String,
    buffer: Vec<u8>,
}

impl BlobSink {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, size_hint: Option<u64>) -> Self {
        Self {
            store,
            key: key.into(),
            buffer: Vec::with_capacity(preallocation(size_hint)),
        }
    }
}

#[async_trait]
impl ArtifactSink for BlobSink {
    async fn write(&mut self, chunk: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StoreResult<()> {
        let BlobSink { store, key, buffer } = *self;
        store.set(&key, CachedValue::Bytes(buffer)).await
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, MemoryResponseCache, ResponseCache};

    #[tokio::test]
    async fn fan_out_publishes_to_every_sink_on_finish() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let responses = MemoryResponseCache::new();
        let url = "https://cdn.example/m/model.onnx";

        let mut sink = Box::new(
            FanOutSink::new()
                .with(Box::new(BlobSink::new(blobs.clone(), url, Some(6))))
                .with(responses.open_writer(url, vec![]).await.unwrap()),
        );
        assert_eq!(sink.len(), 2);
        sink.write(b"abc").await.unwrap();
        sink.write(b"def").await.unwrap();
        assert!(blobs.is_empty());
        assert!(!responses.contains(url).await.unwrap());

        sink.finish().await.unwrap();
        assert_eq!(
            blobs.get(url).await.unwrap(),
            Some(CachedValue::Bytes(b"abcdef".to_vec()))
        );
        assert_eq!(
            responses.lookup(url).await.unwrap().unwrap().body,
            b"abcdef".to_vec()
        );
    }

    #[tokio::test]
    async fn abort_publishes_nothing() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let responses = MemoryResponseCache::new();
        let url = "https://cdn.example/m/model.onnx";

        let mut sink = Box::new(
            FanOutSink::new()
                .with(Box::new(BlobSink::new(blobs.clone(), url, None)))
                .with(responses.open_writer(url, vec![]).await.unwrap()),
        );
        sink.write(b"partial").await.unwrap();
        sink.abort().await;

        assert!(blobs.is_empty());
        assert!(!responses.contains(url).await.unwrap());
    }

    #[tokio::test]
    async fn blob_sink_ignores_an_oversized_hint() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let url = "https://cdn.example/m/model.onnx_data";

        let mut sink = Box::new(BlobSink::new(blobs.clone(), url, Some(u64::MAX)));
        sink.write(b"data").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(
            blobs.get(url).await.unwrap(),
            Some(CachedValue::Bytes(b"data".to_vec()))
        );
    }
}
