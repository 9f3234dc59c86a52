mod download;
mod loader;
mod manager;
pub mod manifest;
mod membership;
mod metadata;
mod service;

pub use download::{
    artifact_addresses, plan_for, AcquireOptions, AcquireReport, ArtifactKind, ArtifactPlan,
    CancellationFlag, Progress, ShardAcquirer,
};
pub use loader::{prepare_local_model, LocalModel, ModelLoader, StoreBackedFetcher};
pub use manager::{ModelManager, ModelStatus};
pub use manifest::{Manifest, OnnxGraph, ShardEntry};
pub use membership::{cache_report, is_cached, CacheReport};
pub use metadata::{compute_sha256, StreamingDigest};
pub use service::{ModelDownloadJob, ModelDownloadService};
