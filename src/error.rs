use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value for {key} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid store key: {0:?}")]
    InvalidKey(String),

    #[error("artifact sink for {0} was already finished")]
    SinkClosed(String),
}

impl StoreError {
    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("reading body of {url} failed: {message}")]
    Body { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("manifest schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("manifest field {0} is missing or empty")]
    MissingField(&'static str),

    #[error("tokenizer_url has no parent directory: {0}")]
    TokenizerWithoutParent(String),

    #[error("shard {url} declares an invalid sha256 {digest:?}")]
    InvalidDigest { url: String, digest: String },

    #[error("shard url appears more than once: {0}")]
    DuplicateShard(String),
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Checksum mismatch for shard: {url}")]
    ChecksumMismatch { url: String },

    #[error("download of {url} failed with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error(transparent)]
    Network(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("manifest for {model_id} does not describe an optimized graph")]
    MissingGraph { model_id: String },

    #[error("acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("models endpoint returned HTTP {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("response from {url} could not be decoded: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("model {model_id} is not fully cached; missing {} artifacts", missing.len())]
    NotCached {
        model_id: String,
        missing: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("an acquisition for {0} is already in flight")]
    AlreadyInFlight(String),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
