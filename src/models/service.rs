use std::{sync::Arc, thread};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::core::events::{EventBus, ModelStatusEvent};
use crate::error::ManagerError;

use super::{
    download::{AcquireOptions, AcquireReport, Progress},
    manifest::Manifest,
    ModelManager, ModelStatus,
};

/// Smallest progress step worth an event.
const PROGRESS_STEP: f32 = 0.01;

#[derive(Debug, Clone)]
pub struct ModelDownloadJob {
    pub id: Uuid,
    pub manifest: Manifest,
    pub options: AcquireOptions,
}

impl ModelDownloadJob {
    #[must_use]
    pub fn new(manifest: Manifest) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest,
            options: AcquireOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: AcquireOptions) -> Self {
        self.options = options;
        self
    }
}

/// Runs acquisitions one at a time on a dedicated worker thread.
#[derive(Debug, Clone)]
pub struct ModelDownloadService {
    sender: Sender<ModelDownloadJob>,
}

impl ModelDownloadService {
    pub fn new(manager: Arc<ModelManager>, events: Arc<EventBus>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build download runtime")?;
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name("model-download".into())
            .spawn(move || worker_loop(receiver, manager, events, runtime))
            .context("spawn model download worker")?;
        Ok(Self { sender })
    }

    pub fn queue(&self, job: ModelDownloadJob) -> Result<Uuid> {
        let id = job.id;
        self.sender
            .send(job)
            .context("send model download job to worker")?;
        Ok(id)
    }
}

fn worker_loop(
    receiver: Receiver<ModelDownloadJob>,
    manager: Arc<ModelManager>,
    events: Arc<EventBus>,
    runtime: Runtime,
) {
    for job in receiver.iter() {
        tracing::info!(job_id = %job.id, model_id = %job.manifest.model_id, "download job started");
        emit_status(&events, &job, ModelStatus::Downloading { progress: 0.0 });

        let mut last_reported = 0.0;
        let result = runtime.block_on(manager.acquire_with_options(
            &job.manifest,
            &job.options,
            |progress| on_progress(&events, &job, progress, &mut last_reported),
        ));

        match result {
            Ok(report) => on_download_success(&events, &job, &report),
            Err(error @ ManagerError::AlreadyInFlight(_)) => {
                tracing::warn!("Skipping job {}: {error}", job.id);
                emit_status(&events, &job, ModelStatus::Error(error.to_string()));
            }
            Err(error) => on_download_failure(&events, &job, &error),
        }
    }
    tracing::debug!("model download worker stopped");
}

fn on_download_success(events: &EventBus, job: &ModelDownloadJob, report: &AcquireReport) {
    tracing::info!(
        job_id = %job.id,
        model_id = %job.manifest.model_id,
        fetched = report.fetched.len(),
        reused = report.reused.len(),
        skipped = report.skipped.len(),
        "download job finished"
    );
    emit_status(events, job, ModelStatus::Cached);
}

fn on_download_failure(events: &EventBus, job: &ModelDownloadJob, error: &ManagerError) {
    tracing::error!("Download job {} failed: {error}", job.id);
    emit_status(events, job, ModelStatus::Error(error.to_string()));
}

fn on_progress(events: &EventBus, job: &ModelDownloadJob, progress: Progress, last_reported: &mut f32) {
    let fraction = progress.fraction();
    if !should_report(*last_reported, fraction) {
        return;
    }
    *last_reported = fraction;
    emit_status(events, job, ModelStatus::Downloading { progress: fraction });
}

fn should_report(last: f32, next: f32) -> bool {
    next >= 1.0 || next - last >= PROGRESS_STEP
}

fn emit_status(events: &EventBus, job: &ModelDownloadJob, status: ModelStatus) {
    events.emit_model_status(ModelStatusEvent::now(
        job.id,
        job.manifest.model_id.clone(),
        status,
    ));
}
