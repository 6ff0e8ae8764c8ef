//! Typed events from providers to the rest of the server.
//!
//! Pipelines never call into the server directly. They send [`AppEvent`]s on
//! one channel, and publish raw protocol traffic as [`ProviderEvent`]s on a
//! broadcast bus that anyone may subscribe to.

use serde_json::Value;
use signalk_core::Delta;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::n2k::PgnMessage;

/// Events consumed by the server hub.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A canonical delta ready for the full model.
    Delta { provider_id: String, delta: Delta },

    /// Human readable status ("Connected to 10.0.0.5:10110").
    ProviderStatus { provider_id: String, message: String },

    /// Human readable error; the provider keeps running.
    ProviderError { provider_id: String, message: String },

    /// Latest device description for a source, keyed `label.src`.
    SourceDelta { key: String, delta: Delta },

    /// Named value for observers (device discovery etc.).
    PropertyValue { name: String, value: Value },

    /// One record reached the end of a pipeline.
    Activity { provider_id: String },
}

/// Raw traffic seen by decoders.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// An accepted NMEA 0183 sentence.
    Nmea0183 { provider_id: String, sentence: String },

    /// A normalized NMEA 2000 message.
    N2kMessage { provider_id: String, message: PgnMessage },
}

const EVENT_BUS_CAPACITY: usize = 256;

/// Cloneable handle used by stages to report to the server.
#[derive(Debug, Clone)]
pub struct AppHandle {
    tx: mpsc::Sender<AppEvent>,
    events: broadcast::Sender<ProviderEvent>,
}

impl AppHandle {
    pub fn new(tx: mpsc::Sender<AppEvent>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx, events }
    }

    /// Handle plus the receiving end, for tests and embedding.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AppEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Deliver a delta, waiting for room. Returns false once the server is gone.
    pub async fn delta(&self, provider_id: &str, delta: Delta) -> bool {
        self.tx
            .send(AppEvent::Delta {
                provider_id: provider_id.to_string(),
                delta,
            })
            .await
            .is_ok()
    }

    pub fn status(&self, provider_id: &str, message: impl Into<String>) {
        self.notify(AppEvent::ProviderStatus {
            provider_id: provider_id.to_string(),
            message: message.into(),
        });
    }

    pub fn error(&self, provider_id: &str, message: impl Into<String>) {
        self.notify(AppEvent::ProviderError {
            provider_id: provider_id.to_string(),
            message: message.into(),
        });
    }

    pub fn source_delta(&self, key: String, delta: Delta) {
        self.notify(AppEvent::SourceDelta { key, delta });
    }

    pub fn property_value(&self, name: &str, value: Value) {
        self.notify(AppEvent::PropertyValue {
            name: name.to_string(),
            value,
        });
    }

    pub fn activity(&self, provider_id: &str) {
        self.notify(AppEvent::Activity {
            provider_id: provider_id.to_string(),
        });
    }

    /// Publish raw traffic. Nobody listening is fine.
    pub fn publish(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    // Side-channel events are best effort; deltas use the awaiting path.
    fn notify(&self, event: AppEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Dropping app event: {}", e);
        }
    }
}
