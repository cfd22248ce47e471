//! Fire-and-forget event emission: reconcilers enqueue into a bounded
//! channel and a background task publishes through the kube events API.

use filestore_core::{EventSink, EventType, RecordedEvent};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct KubeEvents {
    tx: mpsc::Sender<RecordedEvent>,
}

impl KubeEvents {
    /// Events are attached to `reference`. The publishing task ends once every
    /// `KubeEvents` handle is dropped and the queue is drained.
    pub fn spawn(client: Client, controller: &str, reference: ObjectReference, cap: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        let recorder = Recorder::new(client, reporter, reference);
        (Self { tx }, tokio::spawn(publish(recorder, rx)))
    }

    #[cfg(test)]
    fn with_sender(tx: mpsc::Sender<RecordedEvent>) -> Self { Self { tx } }
}

impl EventSink for KubeEvents {
    fn record(&self, event: RecordedEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                counter!("events_dropped_total", 1u64);
                debug!(reason = %ev.reason, "event queue full; dropping event");
            }
            Err(TrySendError::Closed(ev)) => debug!(reason = %ev.reason, "event publisher gone; dropping event"),
        }
    }
}

async fn publish(recorder: Recorder, mut rx: mpsc::Receiver<RecordedEvent>) {
    while let Some(ev) = rx.recv().await {
        let type_ = match ev.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        let event = Event { type_, reason: ev.reason.clone(), note: Some(ev.note), action: "Reconcile".into(), secondary: None };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason = %ev.reason, error = %e, "failed to publish event");
        }
    }
    debug!("event publisher stopped");
}
