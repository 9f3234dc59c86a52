use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::storage::DEFAULT_RESPONSE_CACHE;

const CONFIG_FILE: &str = "config.json";
const ENV_ENDPOINT: &str = "SHARD_CACHE_ENDPOINT";
const ENV_CACHE_DIR: &str = "SHARD_CACHE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub models_endpoint: String,
    pub cache_dir: Option<PathBuf>,
    pub response_cache_name: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models_endpoint: "http://localhost:8080/api/v1/models".into(),
            cache_dir: None,
            response_cache_name: DEFAULT_RESPONSE_CACHE.into(),
            request_timeout_secs: 60 * 60,
            user_agent: format!("shard-cache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Environment values win over the persisted file.
    fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                self.models_endpoint = endpoint;
            }
        }
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            if !dir.trim().is_empty() {
                self.cache_dir = Some(PathBuf::from(dir));
            }
        }
    }
}

pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsManager {
    pub fn new() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Ok(Self::at(config_path))
    }

    /// Settings backed by an explicit file, used by tests and `--config`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut settings = match load_settings(&path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!("Falling back to default settings: {error:?}");
                Settings::default()
            }
        };
        settings.apply_env();
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn read(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: Settings) -> Result<()> {
        let mut guard = self.inner.write();
        *guard = settings;
        persist_settings(self.path.as_path(), &guard)
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.models_endpoint == endpoint {
            return Ok(());
        }
        guard.models_endpoint = endpoint.to_string();
        persist_settings(self.path.as_path(), &guard)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "PrivyTune", "ShardCache")
        .context("missing project directories")?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}
