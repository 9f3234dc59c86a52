use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::ModelStatus;

pub const EVENT_MODEL_STATUS: &str = "model-status";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusEvent {
    pub job_id: Uuid,
    pub model_id: String,
    pub status: ModelStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl ModelStatusEvent {
    #[must_use]
    pub fn now(job_id: Uuid, model_id: impl Into<String>, status: ModelStatus) -> Self {
        Self {
            job_id,
            model_id: model_id.into(),
            status,
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Fan-out of status events to any number of subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ModelStatusEvent>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ModelStatusEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn emit_model_status(&self, event: ModelStatusEvent) {
        tracing::trace!(
            event = EVENT_MODEL_STATUS,
            model_id = %event.model_id,
            status = ?event.status
        );
        // Dropped receivers unsubscribe.
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
