use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::metadata::LevelFilter;

use shard_cache::{
    core::{
        events::{EventBus, ModelStatusEvent},
        settings::{Settings, SettingsManager},
    },
    models::{
        AcquireOptions, ModelDownloadJob, ModelDownloadService, ModelManager, ModelStatus,
    },
    net::{build_client, ModelsApi},
};

/// Model shard cache
#[derive(Parser)]
#[command(name = "shard-cache")]
#[command(about = "Download, verify and inspect cached model shards")]
#[command(version)]
pub struct Cli {
    /// Settings file to use instead of the platform default
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Models endpoint that lists models and serves manifests
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Directory holding the blob store and response cache
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// More log output; repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        }
    }

    /// Command-line values override the loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(endpoint) = &self.endpoint {
            settings.models_endpoint = endpoint.clone();
        }
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = Some(dir.clone());
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// List models offered by the endpoint and whether they are cached
    List,
    /// Show which artifacts of a model are cached
    Status {
        model: String,
    },
    /// Download and verify every artifact of a model
    Pull {
        model: String,
        /// Fail if the model has no optimized graph
        #[arg(long)]
        require_graph: bool,
    },
    /// Remove a model's artifacts from the cache
    Evict {
        model: String,
    },
    /// Print the saved models endpoint, or save a new one
    Endpoint {
        url: Option<String>,
    },
}

pub async fn run(
    command: Command,
    settings_manager: &SettingsManager,
    settings: &Settings,
) -> Result<()> {
    match command {
        Command::Endpoint { url } => endpoint(settings_manager, url.as_deref()),
        Command::List => {
            let (api, manager) = connect(settings).await?;
            list(&api, &manager).await
        }
        Command::Status { model } => {
            let (api, manager) = connect(settings).await?;
            status(&api, &manager, &model).await
        }
        Command::Pull {
            model,
            require_graph,
        } => {
            let (api, manager) = connect(settings).await?;
            pull(&api, manager, &model, require_graph).await
        }
        Command::Evict { model } => {
            let (api, manager) = connect(settings).await?;
            evict(&api, &manager, &model).await
        }
    }
}

async fn connect(settings: &Settings) -> Result<(ModelsApi, Arc<ModelManager>)> {
    let api = ModelsApi::new(build_client(settings)?, settings.models_endpoint.clone());
    let manager = Arc::new(ModelManager::open(settings).await?);
    Ok((api, manager))
}

/// Prints the endpoint in effect, or validates and persists a new default.
fn endpoint(settings_manager: &SettingsManager, url: Option<&str>) -> Result<()> {
    let Some(url) = url else {
        println!("{}", settings_manager.read().models_endpoint);
        return Ok(());
    };
    let url = save_endpoint(settings_manager, url)?;
    println!("saved {url} to {}", settings_manager.path().display());
    Ok(())
}

fn save_endpoint(settings_manager: &SettingsManager, url: &str) -> Result<String> {
    let url = url.trim();
    let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid endpoint {url:?}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("endpoint must be http or https: {url}");
    }
    settings_manager.set_endpoint(url)?;
    Ok(url.to_string())
}

async fn list(api: &ModelsApi, manager: &ModelManager) -> Result<()> {
    let models = api.list_models().await?;
    if models.is_empty() {
        println!("no models offered by {}", api.endpoint());
        return Ok(());
    }
    for model_id in models {
        match api.fetch_manifest(&model_id).await {
            Ok(manifest) => {
                let report = manager.cache_report(&manifest).await;
                println!(
                    "{:<40} {:>3}/{:<3} {}",
                    manifest.label(),
                    report.present(),
                    report.total,
                    if report.is_complete() { "cached" } else { "-" }
                );
            }
            Err(error) => println!("{model_id:<40} manifest unavailable: {error}"),
        }
    }
    Ok(())
}

async fn status(api: &ModelsApi, manager: &ModelManager, model_id: &str) -> Result<()> {
    let manifest = api.fetch_manifest(model_id).await?;
    let report = manager.cache_report(&manifest).await;
    println!(
        "{}: {}/{} artifacts cached",
        manifest.label(),
        report.present(),
        report.total
    );
    for url in &report.missing {
        println!("  missing {url}");
    }
    Ok(())
}

async fn pull(
    api: &ModelsApi,
    manager: Arc<ModelManager>,
    model_id: &str,
    require_graph: bool,
) -> Result<()> {
    let manifest = api.fetch_manifest(model_id).await?;
    let events = Arc::new(EventBus::new());
    let receiver = events.subscribe();
    let service = ModelDownloadService::new(manager.clone(), events)?;
    service.queue(ModelDownloadJob::new(manifest.clone()).with_options(AcquireOptions {
        require_graph,
        cancel: None,
    }))?;

    let status = tokio::task::spawn_blocking(move || wait_for_terminal(&receiver))
        .await
        .context("join progress reporter")??;
    if let ModelStatus::Error(message) = status {
        bail!("pull of {model_id} failed: {message}");
    }

    let report = manager.cache_report(&manifest).await;
    println!(
        "{} cached ({}/{} artifacts)",
        manifest.label(),
        report.present(),
        report.total
    );
    Ok(())
}

fn wait_for_terminal(receiver: &Receiver<ModelStatusEvent>) -> Result<ModelStatus> {
    loop {
        let event = match receiver.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("download worker stopped"),
        };
        match event.status {
            ModelStatus::Downloading { progress } => {
                eprint!("\r{}: {:>5.1}%", event.model_id, progress * 100.0);
            }
            terminal @ (ModelStatus::Cached | ModelStatus::Error(_)) => {
                eprintln!();
                return Ok(terminal);
            }
            ModelStatus::NotCached => {}
        }
    }
}

async fn evict(api: &ModelsApi, manager: &ModelManager, model_id: &str) -> Result<()> {
    let manifest = api.fetch_manifest(model_id).await?;
    let removed = manager.evict(&manifest).await?;
    println!("removed {removed} cached entries for {}", manifest.label());
    Ok(())
}
