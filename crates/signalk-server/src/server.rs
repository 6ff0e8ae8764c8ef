//! The server hub.
//!
//! Owns the full model and consumes every [`AppEvent`] the provider
//! pipelines send:
//! - deltas are merged into the model and rebroadcast
//! - status and error messages update the provider status map
//! - source deltas refresh the `sources` branch and are kept per source
//!
//! It also closes the statistics window once a second and prunes inactive
//! contexts when `pruneContextsMinutes` is set.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use signalk_core::config::ServerSettings;
use signalk_core::{Delta, FullSignalK, SignalKStore};
use signalk_providers::{AppEvent, AppHandle};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::statistics::StatisticsCollector;

/// How many provider events may queue before pipelines wait.
const EVENT_CAPACITY: usize = 1024;

/// Applied deltas buffered per downstream subscriber.
const DELTA_BROADCAST_CAPACITY: usize = 1024;

/// How often inactive contexts are looked for.
const PRUNE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the SignalK server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    /// Self vessel URN.
    pub self_urn: String,
    /// Contexts not updated for this long are removed.
    pub prune_contexts: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            name: "signalk-ingest".to_string(),
            version: signalk_core::store::SIGNALK_VERSION.to_string(),
            self_urn: settings.self_urn(),
            prune_contexts: settings
                .prune_contexts_minutes
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(u64::from(m) * 60)),
        }
    }
}

/// Last reported state of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub message: String,
    pub is_error: bool,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// The SignalK server hub.
pub struct SignalKServer {
    config: ServerConfig,
    store: Arc<RwLock<FullSignalK>>,
    /// Every delta after it was applied.
    delta_tx: broadcast::Sender<Delta>,
    app: AppHandle,
    event_rx: mpsc::Receiver<AppEvent>,
    statuses: Arc<RwLock<HashMap<String, ProviderStatus>>>,
    source_deltas: Arc<RwLock<HashMap<String, Delta>>>,
    properties: Arc<RwLock<HashMap<String, Value>>>,
    statistics: Arc<StatisticsCollector>,
}

impl SignalKServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = FullSignalK::new(&config.self_urn);
        let (delta_tx, _) = broadcast::channel(DELTA_BROADCAST_CAPACITY);
        let (app, event_rx) = AppHandle::channel(EVENT_CAPACITY);

        Self {
            config,
            store: Arc::new(RwLock::new(store)),
            delta_tx,
            app,
            event_rx,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            source_deltas: Arc::new(RwLock::new(HashMap::new())),
            properties: Arc::new(RwLock::new(HashMap::new())),
            statistics: Arc::new(StatisticsCollector::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for provider pipelines.
    pub fn app_handle(&self) -> AppHandle {
        self.app.clone()
    }

    pub fn store(&self) -> Arc<RwLock<FullSignalK>> {
        self.store.clone()
    }

    /// Receive every delta after it reached the full model.
    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.delta_tx.subscribe()
    }

    pub fn statistics(&self) -> Arc<StatisticsCollector> {
        self.statistics.clone()
    }

    pub fn statuses(&self) -> Arc<RwLock<HashMap<String, ProviderStatus>>> {
        self.statuses.clone()
    }

    /// Latest device description per source key (`label.src`).
    pub fn source_deltas(&self) -> Arc<RwLock<HashMap<String, Delta>>> {
        self.source_deltas.clone()
    }

    pub fn properties(&self) -> Arc<RwLock<HashMap<String, Value>>> {
        self.properties.clone()
    }

    /// Process events until `shutdown` completes.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("SignalK hub running for {}", self.config.self_urn);
        let mut rate = tokio::time::interval(Duration::from_secs(1));
        let mut prune = tokio::time::interval(PRUNE_CHECK_INTERVAL);
        let max_age = self.config.prune_contexts;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = rate.tick() => self.statistics.update_rate(),
                _ = prune.tick(), if max_age.is_some() => {
                    if let Some(max_age) = max_age {
                        self.prune(max_age).await;
                    }
                }
            }
        }
        info!("SignalK hub stopped");
    }

    /// Apply one provider event.
    pub async fn handle_event(&self, event: AppEvent) {
        match event {
            AppEvent::Delta { provider_id, delta } => self.apply_delta(&provider_id, delta).await,
            AppEvent::ProviderStatus { provider_id, message } => {
                debug!("{}: {}", provider_id, message);
                self.set_status(provider_id, message, false).await;
            }
            AppEvent::ProviderError { provider_id, message } => {
                warn!("{}: {}", provider_id, message);
                self.set_status(provider_id, message, true).await;
            }
            AppEvent::SourceDelta { key, delta } => {
                {
                    let mut store = self.store.write().await;
                    for update in &delta.updates {
                        if let Some(source) = &update.source {
                            store.update_source(source, update.timestamp.as_deref());
                        }
                    }
                }
                self.source_deltas.write().await.insert(key, delta);
            }
            AppEvent::PropertyValue { name, value } => {
                debug!("Property {} = {}", name, value);
                self.properties.write().await.insert(name, value);
            }
            AppEvent::Activity { provider_id } => {
                if let Some(status) = self.statuses.write().await.get_mut(&provider_id) {
                    status.last_activity = Some(now_iso());
                }
            }
        }
    }

    async fn apply_delta(&self, provider_id: &str, delta: Delta) {
        let paths = {
            let mut store = self.store.write().await;
            store.add_delta(&delta);
            store.path_count()
        };
        self.statistics.record_delta(provider_id);
        self.statistics.set_active_paths(paths);
        // no subscribers is fine
        let _ = self.delta_tx.send(delta);
    }

    async fn set_status(&self, id: String, message: String, is_error: bool) {
        let mut statuses = self.statuses.write().await;
        let last_activity = statuses.get(&id).and_then(|s| s.last_activity.clone());
        statuses.insert(
            id.clone(),
            ProviderStatus {
                id,
                message,
                is_error,
                timestamp: now_iso(),
                last_activity,
            },
        );
    }

    async fn prune(&self, max_age: Duration) {
        let pruned = self.store.write().await.prune_contexts(max_age);
        if !pruned.is_empty() {
            info!("Pruned {} inactive context(s): {}", pruned.len(), pruned.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalk_core::{PathValue, Source, Update};

    fn delta(context: &str, path: &str, value: Value) -> Delta {
        Delta::single(
            Some(context.to_string()),
            Update::from_source(
                Source::generic("test", "SignalK"),
                Some("2024-01-01T00:00:00.000Z".into()),
                vec![PathValue::new(path, value)],
            ),
        )
    }

    #[tokio::test]
    async fn test_delta_applied_and_broadcast() {
        let server = SignalKServer::new(ServerConfig::default());
        let mut deltas = server.subscribe();
        server
            .handle_event(AppEvent::Delta {
                provider_id: "p".into(),
                delta: delta("vessels.self", "navigation.speedOverGround", json!(3.5)),
            })
            .await;

        let received = deltas.recv().await.unwrap();
        assert_eq!(received.updates[0].values[0].path, "navigation.speedOverGround");

        let store = server.store();
        let store = store.read().await;
        assert_eq!(
            store.get_path("vessels.self.navigation.speedOverGround.value"),
            Some(json!(3.5))
        );
        assert_eq!(server.statistics().snapshot().total_deltas, 1);
        assert_eq!(server.statistics().snapshot().number_of_available_paths, 1);
    }

    #[tokio::test]
    async fn test_status_and_activity() {
        let server = SignalKServer::new(ServerConfig::default());
        server
            .handle_event(AppEvent::ProviderStatus {
                provider_id: "gps".into(),
                message: "Connected".into(),
            })
            .await;
        server
            .handle_event(AppEvent::Activity {
                provider_id: "gps".into(),
            })
            .await;
        server
            .handle_event(AppEvent::ProviderError {
                provider_id: "gps".into(),
                message: "Disconnected".into(),
            })
            .await;

        let statuses = server.statuses();
        let statuses = statuses.read().await;
        let gps = &statuses["gps"];
        assert!(gps.is_error);
        assert_eq!(gps.message, "Disconnected");
        assert!(gps.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_source_delta_updates_sources() {
        let server = SignalKServer::new(ServerConfig::default());
        let mut source = Source::n2k("can0", 36, 126996);
        source.manufacturer_code = Some("Garmin".into());
        server
            .handle_event(AppEvent::SourceDelta {
                key: "can0.36".into(),
                delta: Delta::single(None, Update::from_source(source, None, Vec::new())),
            })
            .await;

        assert!(server.source_deltas().read().await.contains_key("can0.36"));
        let model = server.store().read().await.retrieve();
        assert_eq!(model["sources"]["can0"]["36"]["n2k"]["manufacturerCode"], "Garmin");
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = SignalKServer::new(ServerConfig::default());
        let app = server.app_handle();
        let store = server.store();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        assert!(app.delta("p", delta("vessels.urn:mrn:imo:mmsi:230000001", "navigation.position", json!({"latitude": 60.1, "longitude": 24.9}))).await);
        // the delta is applied before the hub looks at the shutdown again
        for _ in 0..100 {
            if store.read().await.context("vessels.urn:mrn:imo:mmsi:230000001").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.read().await.context("vessels.urn:mrn:imo:mmsi:230000001").is_some());

        stop.send(()).unwrap();
        task.await.unwrap();
    }
}
